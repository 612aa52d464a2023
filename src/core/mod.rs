//! # Stage runtime: spawn and drive.
//!
//! [`start`] spawns one task per stage. The task runs `init`, reports
//! readiness (or refusal) back to the starter, performs the spec's
//! upstream subscriptions, then drains the mailbox until a stop reason
//! emerges — from a callback, the shutdown token, or the protocol.
//!
//! The whole drive runs under `catch_unwind`: a panicking callback turns
//! into an abnormal exit reason instead of a crashed task, and monitors
//! always learn the outcome, clean or not.

mod bridge;
mod buffer;
mod cell;
mod consumer;
mod demand;
mod producer;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::StartError;
use crate::handle::{StageAddr, StageHandle};
use crate::message::Envelope;
use crate::monitor::MonitorHub;
use crate::reason::ExitReason;
use crate::stage::{Init, Stage};
use crate::subscription::StageId;

use self::cell::{Flow, StageCell};

/// Spawns a stage and waits for its `init` to settle.
///
/// Returns once the stage is processing messages. The handle may be
/// dropped freely; the stage keeps running until stopped, shut down, or
/// terminated by its subscriptions' cancel policies.
pub async fn start<S: Stage>(stage: S) -> Result<StageHandle<S>, StartError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = Arc::new(MonitorHub::new());
    let addr = StageAddr::new(tx, hub, StageId::next());
    let (ready_tx, ready_rx) = oneshot::channel();
    let join = tokio::spawn(run_stage(stage, addr.clone(), rx, ready_tx));
    match ready_rx.await {
        Ok(Ok(token)) => Ok(StageHandle::new(addr, token, join)),
        Ok(Err(err)) => {
            let _ = join.await;
            Err(err)
        }
        // The init itself panicked; surface whatever reason the task kept.
        Err(_) => {
            let reason = match join.await {
                Ok(reason) => reason,
                Err(_) => ExitReason::error("stage task failed during startup"),
            };
            Err(StartError::Stopped { reason })
        }
    }
}

async fn run_stage<S: Stage>(
    stage: S,
    addr: StageAddr<S>,
    mailbox: mpsc::UnboundedReceiver<Envelope<S>>,
    ready: oneshot::Sender<Result<CancellationToken, StartError>>,
) -> ExitReason {
    let hub = Arc::clone(addr.hub());
    let id = addr.id();
    let reason = match AssertUnwindSafe(drive(stage, addr, mailbox, ready))
        .catch_unwind()
        .await
    {
        Ok(reason) => reason,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(stage = %id, panic = %message, "stage callback panicked");
            ExitReason::error(message)
        }
    };
    if !reason.is_clean() {
        error!(stage = %id, reason = %reason, "stage terminated abnormally");
    } else {
        debug!(stage = %id, reason = %reason, "stage terminated");
    }
    hub.down(reason.clone());
    reason
}

async fn drive<S: Stage>(
    mut stage: S,
    addr: StageAddr<S>,
    mut mailbox: mpsc::UnboundedReceiver<Envelope<S>>,
    ready: oneshot::Sender<Result<CancellationToken, StartError>>,
) -> ExitReason {
    let spec = match stage.init().await {
        Init::Start(spec) => spec,
        Init::Stop(reason) => {
            let _ = ready.send(Err(StartError::Stopped {
                reason: reason.clone(),
            }));
            return reason;
        }
        Init::Ignore => {
            let _ = ready.send(Err(StartError::Ignored));
            return ExitReason::Normal;
        }
    };
    if let Err(err) = spec.validate() {
        let message = err.to_string();
        let _ = ready.send(Err(err));
        return ExitReason::error(message);
    }

    let token = spec.shutdown.clone().unwrap_or_default();
    let (mut cell, subscribe_to) = StageCell::new(stage, spec, addr);
    let _ = ready.send(Ok(token.clone()));

    let mut stopped = None;
    for (to, opts) in subscribe_to {
        if let Flow::Stop(reason) = cell.subscribe_upstream(to, opts, None) {
            stopped = Some(reason);
            break;
        }
    }

    let reason = match stopped {
        Some(reason) => reason,
        None => loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break ExitReason::Shutdown,
                next = mailbox.recv() => match next {
                    Some(envelope) => {
                        if let Flow::Stop(reason) = cell.handle(envelope).await {
                            break reason;
                        }
                    }
                    None => break ExitReason::Normal,
                },
            }
        },
    };
    cell.terminate(&reason).await;
    reason
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked".to_string()
    }
}
