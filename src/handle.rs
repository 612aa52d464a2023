//! # Stage handles and addresses.
//!
//! [`StageHandle`] is the owner-side surface of a running stage: the
//! synchronous request/reply plumbing (`call`, `subscribe`, `sync_notify`),
//! the fire-and-forget sends (`cast`, `info`, `cancel`, `stop`), shutdown,
//! and `join`. Synchronous operations take a timeout — 5 s unless the
//! `_timeout` variant is used — and a timeout fails the caller only; the
//! stage never notices.
//!
//! Internally the handle wraps a [`StageAddr`], the concrete mailbox
//! address also hiding behind the erased producer/consumer endpoints that
//! subscriptions carry around.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::SubscriptionOptions;
use crate::error::StageError;
use crate::message::{Command, ConsumerMsg, Envelope, ProducerMsg};
use crate::monitor::{DownSink, MonitorHub, MonitorId};
use crate::reason::ExitReason;
use crate::stage::Stage;
use crate::subscription::{
    ConsumerEndpoint, ConsumerRef, ProducerEndpoint, ProducerRef, StageId, SubscriptionId,
};

/// Default timeout for the synchronous handle operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Concrete address of a stage: mailbox sender, monitor hub, identity.
pub(crate) struct StageAddr<S: Stage> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
    hub: Arc<MonitorHub>,
    id: StageId,
}

impl<S: Stage> StageAddr<S> {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Envelope<S>>,
        hub: Arc<MonitorHub>,
        id: StageId,
    ) -> Self {
        StageAddr { tx, hub, id }
    }

    pub(crate) fn id(&self) -> StageId {
        self.id
    }

    pub(crate) fn hub(&self) -> &Arc<MonitorHub> {
        &self.hub
    }

    pub(crate) fn send(&self, envelope: Envelope<S>) -> bool {
        self.tx.send(envelope).is_ok()
    }

    /// A sink that turns this stage's monitor firings into mailbox `Down`
    /// envelopes.
    pub(crate) fn down_sink(&self) -> DownSink {
        let tx = self.tx.clone();
        Box::new(move |monitor, reason| {
            let _ = tx.send(Envelope::Down { monitor, reason });
        })
    }

    pub(crate) fn producer_ref(&self) -> ProducerRef<S::Out, S::Notice> {
        ProducerRef::new(Arc::new(self.clone()))
    }

    pub(crate) fn consumer_ref(&self) -> ConsumerRef<S::In, S::InNotice> {
        ConsumerRef::new(Arc::new(self.clone()))
    }
}

impl<S: Stage> Clone for StageAddr<S> {
    fn clone(&self) -> Self {
        StageAddr {
            tx: self.tx.clone(),
            hub: Arc::clone(&self.hub),
            id: self.id,
        }
    }
}

impl<S: Stage> ProducerEndpoint<S::Out, S::Notice> for StageAddr<S> {
    fn deliver(&self, msg: ProducerMsg<S::Out, S::Notice>) -> bool {
        self.send(Envelope::Produce(msg))
    }

    fn watch(&self, sink: DownSink) -> MonitorId {
        self.hub.watch(sink)
    }

    fn unwatch(&self, monitor: MonitorId) {
        self.hub.unwatch(monitor)
    }

    fn stage_id(&self) -> StageId {
        self.id
    }
}

impl<S: Stage> ConsumerEndpoint<S::In, S::InNotice> for StageAddr<S> {
    fn deliver(&self, msg: ConsumerMsg<S::In, S::InNotice>) -> bool {
        self.send(Envelope::Consume(msg))
    }

    fn watch(&self, sink: DownSink) -> MonitorId {
        self.hub.watch(sink)
    }

    fn unwatch(&self, monitor: MonitorId) {
        self.hub.unwatch(monitor)
    }

    fn stage_id(&self) -> StageId {
        self.id
    }
}

/// Owner-side handle to a running stage.
///
/// Dropping the handle does not stop the stage.
pub struct StageHandle<S: Stage> {
    addr: StageAddr<S>,
    token: CancellationToken,
    join: JoinHandle<ExitReason>,
}

impl<S: Stage> StageHandle<S> {
    pub(crate) fn new(
        addr: StageAddr<S>,
        token: CancellationToken,
        join: JoinHandle<ExitReason>,
    ) -> Self {
        StageHandle { addr, token, join }
    }

    /// Identity of the stage, as used in logs.
    pub fn id(&self) -> StageId {
        self.addr.id()
    }

    /// The stage's address for downstream subscribers.
    pub fn producer_ref(&self) -> ProducerRef<S::Out, S::Notice> {
        self.addr.producer_ref()
    }

    /// Synchronous request with the default timeout.
    pub async fn call(&self, request: S::Call) -> Result<S::Reply, StageError> {
        self.call_timeout(request, DEFAULT_TIMEOUT).await
    }

    /// Synchronous request; fails the caller after `limit`.
    pub async fn call_timeout(
        &self,
        request: S::Call,
        limit: Duration,
    ) -> Result<S::Reply, StageError> {
        let (reply, rx) = oneshot::channel();
        if !self.addr.send(Envelope::Call { request, reply }) {
            return Err(StageError::Stopped);
        }
        match timeout(limit, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StageError::NoReply),
            Err(_) => Err(StageError::Timeout { timeout: limit }),
        }
    }

    /// Fire-and-forget message for `handle_cast`.
    pub fn cast(&self, msg: S::Cast) -> Result<(), StageError> {
        if self.addr.send(Envelope::Cast { msg }) {
            Ok(())
        } else {
            Err(StageError::Stopped)
        }
    }

    /// Out-of-band message for `handle_info`.
    pub fn info(&self, msg: S::Info) -> Result<(), StageError> {
        if self.addr.send(Envelope::Info { msg }) {
            Ok(())
        } else {
            Err(StageError::Stopped)
        }
    }

    /// Subscribes this stage to `producer`, returning the new reference
    /// once the `SUBSCRIBE` is on its way (the ack arrives asynchronously).
    pub async fn subscribe(
        &self,
        producer: &ProducerRef<S::In, S::InNotice>,
        opts: SubscriptionOptions,
    ) -> Result<SubscriptionId, StageError> {
        self.subscribe_timeout(producer, opts, DEFAULT_TIMEOUT).await
    }

    /// [`subscribe`](Self::subscribe) with an explicit timeout.
    pub async fn subscribe_timeout(
        &self,
        producer: &ProducerRef<S::In, S::InNotice>,
        opts: SubscriptionOptions,
        limit: Duration,
    ) -> Result<SubscriptionId, StageError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Subscribe {
            to: producer.clone(),
            opts,
            reply,
        };
        if !self.addr.send(Envelope::Command(command)) {
            return Err(StageError::Stopped);
        }
        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StageError::Stopped),
            Err(_) => Err(StageError::Timeout { timeout: limit }),
        }
    }

    /// Cancels one of the stage's subscriptions (either side).
    pub fn cancel(&self, subscription: SubscriptionId, reason: ExitReason) -> Result<(), StageError> {
        let command = Command::Cancel {
            subscription,
            reason,
        };
        if self.addr.send(Envelope::Command(command)) {
            Ok(())
        } else {
            Err(StageError::Stopped)
        }
    }

    /// Queues a notification behind the currently buffered events, or
    /// dispatches it immediately when nothing is buffered. Fails with
    /// [`StageError::NotAProducer`] on a plain consumer.
    pub async fn sync_notify(&self, msg: S::Notice) -> Result<(), StageError> {
        self.sync_notify_timeout(msg, DEFAULT_TIMEOUT).await
    }

    /// [`sync_notify`](Self::sync_notify) with an explicit timeout.
    pub async fn sync_notify_timeout(
        &self,
        msg: S::Notice,
        limit: Duration,
    ) -> Result<(), StageError> {
        let (reply, rx) = oneshot::channel();
        if !self.addr.send(Envelope::Command(Command::Notify { msg, reply })) {
            return Err(StageError::Stopped);
        }
        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StageError::Stopped),
            Err(_) => Err(StageError::Timeout { timeout: limit }),
        }
    }

    /// Asks the stage to stop with `reason` after the messages already
    /// queued ahead are handled.
    pub fn stop(&self, reason: ExitReason) -> Result<(), StageError> {
        if self.addr.send(Envelope::Command(Command::Stop { reason })) {
            Ok(())
        } else {
            Err(StageError::Stopped)
        }
    }

    /// Cancels the stage's shutdown token: the stage exits with
    /// [`ExitReason::Shutdown`] ahead of any queued messages.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// The stage's shutdown token, for tying other stages (or external
    /// tasks) to the same lifetime.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for the stage to terminate and returns its exit reason.
    pub async fn join(self) -> ExitReason {
        match self.join.await {
            Ok(reason) => reason,
            Err(_) => ExitReason::error("stage task was aborted"),
        }
    }
}
