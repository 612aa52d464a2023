//! # Consumer-side subscription handling and demand engine.
//!
//! Implements the inbound half of a stage: opening subscriptions,
//! completing the handshake on `ACK`, receiving event batches under the
//! demand window, and reacting to peer cancellations.
//!
//! ## Batch handling per demand mode
//! - `Auto`: split into chunks of at most `max_demand - min_demand`,
//!   account each against the window, deliver to `handle_events`, send the
//!   scheduled top-up ask after the callback returns.
//! - `Manual`: deliver the batch whole; the user asks explicitly.
//! - `Forward` (producer-consumer): batches meet downstream demand in the
//!   bridge; whatever demand covers is delivered now, the rest queues.
//!   Each delivered batch re-asks its upstream for the same amount.

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::config::{CancelPolicy, SubscriptionOptions};
use crate::core::bridge::QueuedBatch;
use crate::core::cell::{DemandMode, Flow, MonitorTarget, PendingSub, ProducerSlot, StageCell};
use crate::core::demand::{split_events, DemandWindow};
use crate::error::StageError;
use crate::reason::{Disconnect, ExitReason};
use crate::stage::{Peer, Stage, StageType, Subscribed};
use crate::subscription::{ProducerRef, Subscription, SubscriptionId};

impl<S: Stage> StageCell<S> {
    /// Opens a subscription to `to`: monitor, `SUBSCRIBE`, pre-ack entry.
    ///
    /// `reply` is present for handle-initiated subscriptions (which report
    /// validation errors to the caller and leave the stage running) and
    /// absent for `subscribe_to` entries made during init (where invalid
    /// options are fatal).
    pub(crate) fn subscribe_upstream(
        &mut self,
        to: ProducerRef<S::In, S::InNotice>,
        opts: SubscriptionOptions,
        reply: Option<oneshot::Sender<Result<SubscriptionId, StageError>>>,
    ) -> Flow {
        let bounds = match opts.resolve() {
            Ok(bounds) => bounds,
            Err(err) => {
                return match reply {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                        Flow::Continue
                    }
                    None => Flow::Stop(ExitReason::error(format!(
                        "invalid subscription options: {err}"
                    ))),
                };
            }
        };

        let id = SubscriptionId::next();
        let link = Subscription::new(to.clone(), self.addr.consumer_ref(), id);
        let monitor = to.watch(self.addr.down_sink());
        if !link.send_subscribe(opts.clone()) {
            to.unwatch(monitor);
            return match opts.cancel {
                // Fabricate a reference and report success; nothing was
                // subscribed and nothing will arrive on it.
                CancelPolicy::Temporary => {
                    if let Some(tx) = reply {
                        let _ = tx.send(Ok(id));
                    }
                    Flow::Continue
                }
                CancelPolicy::Permanent => {
                    if let Some(tx) = reply {
                        let _ = tx.send(Err(StageError::NoProc));
                    }
                    Flow::Stop(ExitReason::NoProc)
                }
            };
        }
        self.monitors.insert(monitor, MonitorTarget::PreAck(id));
        self.pending.insert(
            id,
            PendingSub {
                link,
                opts,
                bounds,
                monitor,
            },
        );
        if let Some(tx) = reply {
            let _ = tx.send(Ok(id));
        }
        Flow::Continue
    }

    /// The producer acknowledged: run `handle_subscribe`, fix the demand
    /// mode, send the opening ask.
    pub(super) async fn on_ack(&mut self, from: Subscription<S::In, S::InNotice>) -> Flow {
        let id = from.id();
        let Some(pending) = self.pending.remove(&id) else {
            from.cancel(ExitReason::UnknownSubscription);
            return Flow::Continue;
        };
        self.monitors
            .insert(pending.monitor, MonitorTarget::Subscription(id));
        let link = pending.link.clone();
        let subscribed = self
            .stage
            .handle_subscribe(Peer::Upstream(&link), &pending.opts)
            .await;
        match subscribed {
            Subscribed::Stop(reason) => Flow::Stop(reason),
            Subscribed::Automatic => {
                let mode = if self.kind == StageType::ProducerConsumer {
                    DemandMode::Forward
                } else {
                    DemandMode::Auto(DemandWindow::new(pending.bounds.min, pending.bounds.max))
                };
                self.producers.insert(
                    id,
                    ProducerSlot {
                        link: link.clone(),
                        cancel: pending.opts.cancel,
                        mode,
                        monitor: pending.monitor,
                    },
                );
                link.ask(pending.bounds.max);
                Flow::Continue
            }
            Subscribed::Manual => {
                self.producers.insert(
                    id,
                    ProducerSlot {
                        link,
                        cancel: pending.opts.cancel,
                        mode: DemandMode::Manual,
                        monitor: pending.monitor,
                    },
                );
                Flow::Continue
            }
        }
    }

    pub(super) async fn on_events(
        &mut self,
        from: Subscription<S::In, S::InNotice>,
        events: Vec<S::In>,
    ) -> Flow {
        let id = from.id();
        enum Plan {
            Manual,
            Forward,
            Auto { limit: usize },
        }
        let plan = match self.producers.get(&id) {
            Some(slot) => match &slot.mode {
                DemandMode::Manual => Plan::Manual,
                DemandMode::Forward => Plan::Forward,
                DemandMode::Auto(window) => Plan::Auto {
                    limit: window.max_batch(),
                },
            },
            None => {
                // In-flight events after a cancel; the producer learns the
                // reference is stale and the events vanish silently.
                from.cancel(ExitReason::UnknownSubscription);
                return Flow::Continue;
            }
        };

        match plan {
            Plan::Manual => {
                let emit = self.stage.handle_events(events, &from).await;
                self.apply(emit)
            }
            Plan::Forward => match self.bridge.absorb(events, from) {
                Some(batch) => self.deliver_transform_batch(batch).await,
                None => Flow::Continue,
            },
            Plan::Auto { limit } => {
                for chunk in split_events(events, limit) {
                    let len = chunk.len();
                    let outcome = match self.producers.get_mut(&id) {
                        Some(slot) => match &mut slot.mode {
                            DemandMode::Auto(window) => window.on_batch(len),
                            _ => return Flow::Continue,
                        },
                        None => return Flow::Continue,
                    };
                    if outcome.excess > 0 {
                        error!(
                            stage = %self.label,
                            subscription = %id,
                            excess = outcome.excess,
                            "events received in excess of demand"
                        );
                    }
                    let emit = self.stage.handle_events(chunk, &from).await;
                    if let Flow::Stop(reason) = self.apply(emit) {
                        return Flow::Stop(reason);
                    }
                    // Asks reflect post-callback demand intent.
                    if let Some(ask) = outcome.ask {
                        from.ask(ask);
                    }
                }
                Flow::Continue
            }
        }
    }

    /// Delivers one bridge batch through `handle_events`, dispatching the
    /// emissions, then re-asks the originating upstream.
    pub(super) async fn deliver_transform_batch(
        &mut self,
        batch: QueuedBatch<S::In, S::InNotice>,
    ) -> Flow {
        let len = batch.events.len();
        let from = batch.from;
        let emit = self.stage.handle_events(batch.events, &from).await;
        if let Flow::Stop(reason) = self.apply(emit) {
            return Flow::Stop(reason);
        }
        if let Some(slot) = self.producers.get(&from.id()) {
            if matches!(slot.mode, DemandMode::Forward) {
                from.ask(len);
            }
        }
        Flow::Continue
    }

    pub(super) async fn on_notice(
        &mut self,
        from: Subscription<S::In, S::InNotice>,
        msg: S::InNotice,
    ) -> Flow {
        if !self.producers.contains_key(&from.id()) {
            debug!(
                stage = %self.label,
                subscription = %from.id(),
                "dropping notice for unknown subscription"
            );
            return Flow::Continue;
        }
        let emit = self.stage.handle_notice(msg, &from).await;
        self.apply(emit)
    }

    /// The producer cancelled (or confirmed our cancel).
    pub(super) async fn on_peer_cancel(
        &mut self,
        from: Subscription<S::In, S::InNotice>,
        reason: ExitReason,
    ) -> Flow {
        let id = from.id();
        if let Some(pending) = self.pending.remove(&id) {
            // Rejected before the handshake completed (e.g. duplicated
            // reference): no handle_cancel, only the policy.
            self.monitors.remove(&pending.monitor);
            pending.link.producer().unwatch(pending.monitor);
            return match pending.opts.cancel {
                CancelPolicy::Permanent => Flow::Stop(reason),
                CancelPolicy::Temporary => Flow::Continue,
            };
        }
        if self.producers.contains_key(&id) {
            return self.drop_producer(id, Disconnect::Cancel(reason)).await;
        }
        debug!(
            stage = %self.label,
            subscription = %id,
            "dropping cancel for unknown subscription"
        );
        Flow::Continue
    }
}
