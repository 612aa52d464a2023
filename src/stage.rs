//! # The `Stage` behaviour.
//!
//! A stage is a single task owning mutable state, driven entirely by its
//! mailbox. Implement [`Stage`] and hand the value to
//! [`start`](crate::start); the role (producer, consumer, or both) and the
//! runtime options are declared by [`init`](Stage::init) through a
//! [`StageSpec`].
//!
//! ## Callback contract
//!
//! | Callback | Called on | Emits events? |
//! |---|---|---|
//! | [`init`](Stage::init) | all | no |
//! | [`handle_demand`](Stage::handle_demand) | producers | yes |
//! | [`handle_events`](Stage::handle_events) | consumers, producer-consumers | producer-consumers only |
//! | [`handle_subscribe`](Stage::handle_subscribe) | all | no |
//! | [`handle_cancel`](Stage::handle_cancel) | all | producers, producer-consumers |
//! | [`handle_notice`](Stage::handle_notice) | consumers, producer-consumers | producer-consumers only |
//! | [`handle_call`](Stage::handle_call) / [`handle_cast`](Stage::handle_cast) / [`handle_info`](Stage::handle_info) | all | producers, producer-consumers |
//! | [`terminate`](Stage::terminate) | all | no |
//!
//! Exactly one callback runs at a time for a given stage; each is awaited
//! to completion before the next mailbox message is touched. Events
//! returned from a callback go straight into the outbound dispatch
//! pipeline. A plain consumer returning events gets an error log and the
//! events are discarded.

use std::borrow::Cow;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{BufferConfig, SubscriptionOptions};
use crate::dispatch::{DemandDispatcher, Dispatcher};
use crate::error::StartError;
use crate::reason::{Disconnect, ExitReason};
use crate::subscription::{ProducerRef, Subscription};

/// The role a stage plays in the pipeline. Immutable once started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageType {
    /// Emits events on demand; never subscribes upstream.
    Producer,
    /// Ingests events; never emits downstream.
    Consumer,
    /// Transforms: consumes upstream events, emits downstream events.
    ProducerConsumer,
}

/// Events (or a stop request) returned from a callback.
#[derive(Debug)]
pub enum Emit<T> {
    /// Events to dispatch downstream. May be empty.
    Events(Vec<T>),
    /// Terminate the stage with the given reason.
    Stop(ExitReason),
}

impl<T> Emit<T> {
    /// No events, keep running.
    pub fn none() -> Self {
        Emit::Events(Vec::new())
    }

    /// Events to dispatch, keep running.
    pub fn events(events: impl IntoIterator<Item = T>) -> Self {
        Emit::Events(events.into_iter().collect())
    }

    /// Terminate the stage.
    pub fn stop(reason: ExitReason) -> Self {
        Emit::Stop(reason)
    }
}

/// Outcome of [`Stage::handle_subscribe`].
#[derive(Debug)]
pub enum Subscribed {
    /// Demand is managed by the runtime: ask `max_demand` up front, top the
    /// window back up as batches are consumed.
    Automatic,
    /// Demand is driven entirely by explicit [`Subscription::ask`] calls.
    /// Only meaningful on the consumer side of the handshake.
    Manual,
    /// Refuse the subscription by terminating the stage.
    Stop(ExitReason),
}

/// Outcome of [`Stage::init`].
pub enum Init<S: Stage> {
    /// Start with the given spec.
    Start(StageSpec<S>),
    /// Do not start; the starter sees [`StartError::Stopped`].
    Stop(ExitReason),
    /// Do not start; the starter sees [`StartError::Ignored`].
    Ignore,
}

/// The peer on the other side of a subscription, as seen from a callback.
///
/// `Upstream` links carry the stage's input types, `Downstream` links its
/// output types, so a producer-consumer can tell them apart by variant.
pub enum Peer<'a, S: Stage> {
    /// The peer is a producer this stage subscribed to.
    Upstream(&'a Subscription<S::In, S::InNotice>),
    /// The peer is a consumer subscribed to this stage.
    Downstream(&'a Subscription<S::Out, S::Notice>),
}

impl<S: Stage> Peer<'_, S> {
    /// The subscription reference, whichever side it is.
    pub fn subscription_id(&self) -> crate::subscription::SubscriptionId {
        match self {
            Peer::Upstream(sub) => sub.id(),
            Peer::Downstream(sub) => sub.id(),
        }
    }
}

/// Reply obligation handed to [`Stage::handle_call`].
///
/// Send exactly one reply with [`Replier::send`]; dropping it makes the
/// caller fail with `StageError::NoReply`.
#[derive(Debug)]
pub struct Replier<R> {
    tx: oneshot::Sender<R>,
}

impl<R> Replier<R> {
    pub(crate) fn new(tx: oneshot::Sender<R>) -> Self {
        Replier { tx }
    }

    /// Delivers the reply. Returns false if the caller gave up (timed out
    /// or dropped the call future).
    pub fn send(self, reply: R) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// A stage behaviour.
///
/// Pick the associated types for the role: a producer sets `Out`/`Notice`
/// and leaves `In`/`InNotice` as `()`; a consumer does the opposite; a
/// producer-consumer sets all four. `Call`/`Reply`/`Cast`/`Info` type the
/// stage's request surface and default to `()` by convention.
#[async_trait]
pub trait Stage: Send + 'static {
    /// Events this stage consumes.
    type In: Send + 'static;
    /// Notifications this stage receives from upstream.
    type InNotice: Send + 'static;
    /// Events this stage emits.
    type Out: Send + 'static;
    /// Notifications this stage emits; cloned per consumer.
    type Notice: Send + Clone + 'static;
    /// Synchronous request payload.
    type Call: Send + 'static;
    /// Synchronous reply payload.
    type Reply: Send + 'static;
    /// Fire-and-forget message payload.
    type Cast: Send + 'static;
    /// Out-of-band message payload.
    type Info: Send + 'static;

    /// Declares the stage's role and options.
    ///
    /// Runs inside the stage task before the first message is handled;
    /// [`start`](crate::start) returns once it completes.
    async fn init(&mut self) -> Init<Self>
    where
        Self: Sized;

    /// New demand reached a producer and the buffer could not cover it.
    /// `demand` is the number of events the stage may emit immediately.
    async fn handle_demand(&mut self, demand: usize) -> Emit<Self::Out> {
        tracing::error!(demand, "handle_demand is not implemented for this producer");
        Emit::none()
    }

    /// A batch of events arrived on the subscription `from`.
    ///
    /// Automatic subscriptions never deliver more than
    /// `max_demand - min_demand` events at once.
    async fn handle_events(
        &mut self,
        events: Vec<Self::In>,
        from: &Subscription<Self::In, Self::InNotice>,
    ) -> Emit<Self::Out> {
        let _ = from;
        tracing::error!(
            count = events.len(),
            "handle_events is not implemented for this consumer"
        );
        Emit::none()
    }

    /// A subscription completed its handshake on either side.
    ///
    /// Returning [`Subscribed::Manual`] for an upstream peer switches the
    /// subscription to manual demand; keep a clone of the link and drive it
    /// with [`Subscription::ask`].
    async fn handle_subscribe(
        &mut self,
        peer: Peer<'_, Self>,
        opts: &SubscriptionOptions,
    ) -> Subscribed
    where
        Self: Sized,
    {
        let _ = (peer, opts);
        Subscribed::Automatic
    }

    /// A subscription ended: the peer cancelled, this stage cancelled, or
    /// the peer terminated (`Disconnect::Down`).
    ///
    /// Runs at most once per subscription. If the peer was upstream and the
    /// subscription's cancel policy is permanent, the stage stops with the
    /// same reason after this callback returns.
    async fn handle_cancel(
        &mut self,
        disconnect: Disconnect,
        peer: Peer<'_, Self>,
    ) -> Emit<Self::Out>
    where
        Self: Sized,
    {
        let _ = (disconnect, peer);
        Emit::none()
    }

    /// An in-band notification arrived on the subscription `from`, ordered
    /// relative to the events around it.
    async fn handle_notice(
        &mut self,
        notice: Self::InNotice,
        from: &Subscription<Self::In, Self::InNotice>,
    ) -> Emit<Self::Out> {
        let _ = (notice, from);
        Emit::none()
    }

    /// A synchronous request. Reply through `replier`; dropping it fails
    /// the caller with `NoReply`.
    async fn handle_call(
        &mut self,
        request: Self::Call,
        replier: Replier<Self::Reply>,
    ) -> Emit<Self::Out> {
        let _ = (request, replier);
        Emit::none()
    }

    /// A fire-and-forget message.
    async fn handle_cast(&mut self, msg: Self::Cast) -> Emit<Self::Out> {
        let _ = msg;
        Emit::none()
    }

    /// An out-of-band message sent through the handle.
    async fn handle_info(&mut self, msg: Self::Info) -> Emit<Self::Out> {
        let _ = msg;
        Emit::none()
    }

    /// The stage is terminating with `reason`. Last callback to run; not
    /// invoked when a callback panicked.
    async fn terminate(&mut self, reason: &ExitReason) {
        let _ = reason;
    }
}

/// Runtime options a stage declares from [`Stage::init`].
///
/// Built per role, which keeps invalid combinations out of reach: only
/// producers and producer-consumers carry a buffer and a dispatcher, only
/// consumers and producer-consumers subscribe upstream. Setting an option
/// the role does not support fails the start with
/// [`StartError::BadOpts`].
pub struct StageSpec<S: Stage> {
    pub(crate) stage_type: StageType,
    pub(crate) name: Option<Cow<'static, str>>,
    pub(crate) buffer: BufferConfig,
    pub(crate) dispatcher: Box<dyn Dispatcher<S::Out, S::Notice>>,
    pub(crate) subscribe_to: Vec<(ProducerRef<S::In, S::InNotice>, SubscriptionOptions)>,
    pub(crate) shutdown: Option<CancellationToken>,
    buffer_set: bool,
    dispatcher_set: bool,
}

impl<S: Stage> StageSpec<S> {
    fn new(stage_type: StageType, buffer: BufferConfig) -> Self {
        StageSpec {
            stage_type,
            name: None,
            buffer,
            dispatcher: Box::new(DemandDispatcher::new()),
            subscribe_to: Vec::new(),
            shutdown: None,
            buffer_set: false,
            dispatcher_set: false,
        }
    }

    /// A producer spec: bounded buffer of 10 000 keeping the most recent,
    /// demand-fair dispatcher.
    pub fn producer() -> Self {
        StageSpec::new(StageType::Producer, BufferConfig::default())
    }

    /// A consumer spec: accepts only upstream subscriptions.
    pub fn consumer() -> Self {
        StageSpec::new(StageType::Consumer, BufferConfig::unbounded())
    }

    /// A producer-consumer spec: unbounded buffer, demand-fair dispatcher.
    pub fn producer_consumer() -> Self {
        StageSpec::new(StageType::ProducerConsumer, BufferConfig::unbounded())
    }

    /// Names the stage for logs.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replaces the outbound buffer configuration.
    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self.buffer_set = true;
        self
    }

    /// Replaces the dispatcher.
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher<S::Out, S::Notice>) -> Self {
        self.dispatcher = Box::new(dispatcher);
        self.dispatcher_set = true;
        self
    }

    /// Subscribes to `producer` with `opts` during startup.
    pub fn subscribe_to(
        mut self,
        producer: &ProducerRef<S::In, S::InNotice>,
        opts: SubscriptionOptions,
    ) -> Self {
        self.subscribe_to.push((producer.clone(), opts));
        self
    }

    /// Ties the stage's lifetime to `token`: cancelling it stops the stage
    /// with reason [`ExitReason::Shutdown`].
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StartError> {
        let bad = |reason: &str| {
            Err(StartError::BadOpts {
                reason: reason.to_string(),
            })
        };
        match self.stage_type {
            StageType::Consumer if self.buffer_set => {
                bad("consumers do not buffer outbound events")
            }
            StageType::Consumer if self.dispatcher_set => {
                bad("consumers do not dispatch events")
            }
            StageType::Producer if !self.subscribe_to.is_empty() => {
                bad("producers cannot subscribe upstream")
            }
            _ => Ok(()),
        }
    }
}
