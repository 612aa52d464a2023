//! # Wire protocol and mailbox envelope.
//!
//! Stages communicate exclusively through these messages. Every protocol
//! message carries the full [`Subscription`] link as `from`, so the
//! receiver can always answer — in particular with
//! `CANCEL { UnknownSubscription }` when the reference is stale.
//!
//! ## Message flow
//! ```text
//! consumer ── Subscribe{opts} ──► producer      (consumer monitors first)
//! consumer ◄──── Ack ───────────  producer      (producer monitors back)
//! consumer ── Ask{count} ───────► producer      (count > 0)
//! consumer ◄── Events{batch} ───  producer      (within asked demand)
//! consumer ◄── Notice{msg} ─────  producer      (in-band, ordered)
//! either   ◄── Cancel{reason} ──  other side
//! ```
//!
//! [`Envelope`] is the union a stage's mailbox actually receives: protocol
//! messages in both directions, monitor `Down` notifications, and the
//! call/cast/info/command surface.

use tokio::sync::oneshot;

use crate::config::SubscriptionOptions;
use crate::error::StageError;
use crate::monitor::MonitorId;
use crate::reason::ExitReason;
use crate::stage::Stage;
use crate::subscription::{ProducerRef, Subscription, SubscriptionId};

/// Messages directed at the producer side of a subscription.
pub(crate) enum ProducerMsg<T, N> {
    /// Opens a subscription. The sender has already monitored the producer.
    Subscribe {
        from: Subscription<T, N>,
        opts: SubscriptionOptions,
    },
    /// Grants `count` more events of demand.
    Ask {
        from: Subscription<T, N>,
        count: usize,
    },
    /// Requests teardown of the subscription.
    Cancel {
        from: Subscription<T, N>,
        reason: ExitReason,
    },
}

/// Messages directed at the consumer side of a subscription.
pub(crate) enum ConsumerMsg<T, N> {
    /// Confirms a `Subscribe`; demand may flow from here on.
    Ack { from: Subscription<T, N> },
    /// Confirms or initiates teardown of the subscription.
    Cancel {
        from: Subscription<T, N>,
        reason: ExitReason,
    },
    /// A non-empty batch of events, within previously asked demand.
    Events {
        from: Subscription<T, N>,
        events: Vec<T>,
    },
    /// An out-of-band message, ordered relative to surrounding events.
    Notice { from: Subscription<T, N>, msg: N },
}

/// Everything a stage mailbox can receive.
pub(crate) enum Envelope<S: Stage> {
    /// Producer-directed protocol traffic (this stage as producer).
    Produce(ProducerMsg<S::Out, S::Notice>),
    /// Consumer-directed protocol traffic (this stage as consumer).
    Consume(ConsumerMsg<S::In, S::InNotice>),
    /// A monitored peer terminated.
    Down {
        monitor: MonitorId,
        reason: ExitReason,
    },
    /// Synchronous request; the reply obligation is handed to the callback.
    Call {
        request: S::Call,
        reply: oneshot::Sender<S::Reply>,
    },
    /// Fire-and-forget message.
    Cast { msg: S::Cast },
    /// Out-of-band user message.
    Info { msg: S::Info },
    /// Management operations issued through the handle.
    Command(Command<S>),
}

/// Management operations routed through the stage's own mailbox so they
/// serialize with everything else.
pub(crate) enum Command<S: Stage> {
    /// Subscribe this stage to a producer (`sync_subscribe`).
    Subscribe {
        to: ProducerRef<S::In, S::InNotice>,
        opts: SubscriptionOptions,
        reply: oneshot::Sender<Result<SubscriptionId, StageError>>,
    },
    /// Cancel one of this stage's subscriptions, on either side.
    Cancel {
        subscription: SubscriptionId,
        reason: ExitReason,
    },
    /// Queue or dispatch a notification (`sync_notify`).
    Notify {
        msg: S::Notice,
        reply: oneshot::Sender<Result<(), StageError>>,
    },
    /// Stop the stage with the given reason.
    Stop { reason: ExitReason },
}
