//! # Subscriptions and stage addresses.
//!
//! A subscription is a directed channel from a consumer to a producer,
//! identified by a [`SubscriptionId`] minted by the consumer. Both ends
//! hold the same [`Subscription`] link: the producer's address, the
//! consumer's address, and the id. Addresses are send-only handles; holding
//! one never keeps the peer's state alive.
//!
//! [`ProducerRef`] is the public, cloneable address used to subscribe
//! (`StageSpec::subscribe_to`, `StageHandle::subscribe`). The consumer-side
//! counterpart stays internal.
//!
//! Dispatcher implementations deliver through the link: [`Subscription::send_events`]
//! and [`Subscription::send_notice`] on the producer side; user callbacks
//! drive manual demand with [`Subscription::ask`] and [`Subscription::cancel`]
//! on the consumer side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SubscriptionOptions;
use crate::message::{ConsumerMsg, ProducerMsg};
use crate::monitor::{DownSink, MonitorId};
use crate::reason::ExitReason;

static NEXT_STAGE: AtomicU64 = AtomicU64::new(0);
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(0);

/// Process-wide unique stage identity, used in logs and for address
/// comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageId(u64);

impl StageId {
    pub(crate) fn next() -> Self {
        StageId(NEXT_STAGE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage-{}", self.0)
    }
}

/// Process-wide unique subscription reference, chosen by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Producer-directed half of a stage address.
///
/// `T` is the event type flowing on the subscription, `N` the notification
/// type.
pub(crate) trait ProducerEndpoint<T, N>: Send + Sync {
    fn deliver(&self, msg: ProducerMsg<T, N>) -> bool;
    fn watch(&self, sink: DownSink) -> MonitorId;
    fn unwatch(&self, monitor: MonitorId);
    fn stage_id(&self) -> StageId;
}

/// Consumer-directed half of a stage address.
pub(crate) trait ConsumerEndpoint<T, N>: Send + Sync {
    fn deliver(&self, msg: ConsumerMsg<T, N>) -> bool;
    fn watch(&self, sink: DownSink) -> MonitorId;
    fn unwatch(&self, monitor: MonitorId);
    fn stage_id(&self) -> StageId;
}

/// Cloneable, send-only address of a producer of `T` events and `N`
/// notifications.
pub struct ProducerRef<T, N> {
    inner: Arc<dyn ProducerEndpoint<T, N>>,
}

impl<T, N> ProducerRef<T, N> {
    pub(crate) fn new(inner: Arc<dyn ProducerEndpoint<T, N>>) -> Self {
        ProducerRef { inner }
    }

    /// Identity of the addressed stage.
    pub fn stage_id(&self) -> StageId {
        self.inner.stage_id()
    }

    pub(crate) fn deliver(&self, msg: ProducerMsg<T, N>) -> bool {
        self.inner.deliver(msg)
    }

    pub(crate) fn watch(&self, sink: DownSink) -> MonitorId {
        self.inner.watch(sink)
    }

    pub(crate) fn unwatch(&self, monitor: MonitorId) {
        self.inner.unwatch(monitor)
    }
}

impl<T, N> Clone for ProducerRef<T, N> {
    fn clone(&self) -> Self {
        ProducerRef {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, N> fmt::Debug for ProducerRef<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProducerRef").field(&self.stage_id()).finish()
    }
}

pub(crate) struct ConsumerRef<T, N> {
    inner: Arc<dyn ConsumerEndpoint<T, N>>,
}

impl<T, N> ConsumerRef<T, N> {
    pub(crate) fn new(inner: Arc<dyn ConsumerEndpoint<T, N>>) -> Self {
        ConsumerRef { inner }
    }

    pub(crate) fn stage_id(&self) -> StageId {
        self.inner.stage_id()
    }

    pub(crate) fn deliver(&self, msg: ConsumerMsg<T, N>) -> bool {
        self.inner.deliver(msg)
    }

    pub(crate) fn watch(&self, sink: DownSink) -> MonitorId {
        self.inner.watch(sink)
    }

    pub(crate) fn unwatch(&self, monitor: MonitorId) {
        self.inner.unwatch(monitor)
    }
}

impl<T, N> Clone for ConsumerRef<T, N> {
    fn clone(&self) -> Self {
        ConsumerRef {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One producer→consumer subscription link: both addresses plus the unique
/// reference. Cheap to clone; user callbacks receive it as `from` and may
/// keep a copy (manual demand does exactly that).
pub struct Subscription<T, N> {
    producer: ProducerRef<T, N>,
    consumer: ConsumerRef<T, N>,
    id: SubscriptionId,
}

impl<T, N> Subscription<T, N> {
    pub(crate) fn new(
        producer: ProducerRef<T, N>,
        consumer: ConsumerRef<T, N>,
        id: SubscriptionId,
    ) -> Self {
        Subscription {
            producer,
            consumer,
            id,
        }
    }

    /// The unique subscription reference.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Identity of the producing stage.
    pub fn producer_id(&self) -> StageId {
        self.producer.stage_id()
    }

    /// Identity of the consuming stage.
    pub fn consumer_id(&self) -> StageId {
        self.consumer.stage_id()
    }

    /// Asks the producer for `count` more events on this subscription.
    ///
    /// This is the manual-demand primitive: subscriptions in manual mode
    /// receive events only after an explicit ask. Asking for zero is a
    /// no-op. Returns false if the producer is no longer running.
    pub fn ask(&self, count: usize) -> bool {
        if count == 0 {
            return true;
        }
        self.producer.deliver(ProducerMsg::Ask {
            from: self.clone(),
            count,
        })
    }

    /// Requests cancellation of this subscription from the producer.
    ///
    /// The producer tears the subscription down, confirms with a `CANCEL`
    /// carrying the same reason, and the consumer's `handle_cancel` runs
    /// when that confirmation arrives.
    pub fn cancel(&self, reason: ExitReason) -> bool {
        self.producer.deliver(ProducerMsg::Cancel {
            from: self.clone(),
            reason,
        })
    }

    /// Delivers a batch of events to the consumer.
    ///
    /// For dispatcher implementations: events must stay within the demand
    /// the consumer has asked for on this subscription. Empty batches are
    /// not sent.
    pub fn send_events(&self, events: Vec<T>) -> bool {
        if events.is_empty() {
            return true;
        }
        self.consumer.deliver(ConsumerMsg::Events {
            from: self.clone(),
            events,
        })
    }

    /// Delivers a notification to the consumer.
    pub fn send_notice(&self, msg: N) -> bool {
        self.consumer.deliver(ConsumerMsg::Notice {
            from: self.clone(),
            msg,
        })
    }

    pub(crate) fn send_subscribe(&self, opts: SubscriptionOptions) -> bool {
        self.producer.deliver(ProducerMsg::Subscribe {
            from: self.clone(),
            opts,
        })
    }

    pub(crate) fn send_ack(&self) -> bool {
        self.consumer.deliver(ConsumerMsg::Ack { from: self.clone() })
    }

    pub(crate) fn send_cancel(&self, reason: ExitReason) -> bool {
        self.consumer.deliver(ConsumerMsg::Cancel {
            from: self.clone(),
            reason,
        })
    }

    pub(crate) fn producer(&self) -> &ProducerRef<T, N> {
        &self.producer
    }

    pub(crate) fn consumer(&self) -> &ConsumerRef<T, N> {
        &self.consumer
    }
}

impl<T, N> Clone for Subscription<T, N> {
    fn clone(&self) -> Self {
        Subscription {
            producer: self.producer.clone(),
            consumer: self.consumer.clone(),
            id: self.id,
        }
    }
}

impl<T, N> fmt::Debug for Subscription<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("producer", &self.producer.stage_id())
            .field("consumer", &self.consumer.stage_id())
            .finish()
    }
}
