//! # Event dispatchers.
//!
//! A dispatcher is the plug-in a producer uses to route events to its
//! consumers. It owns the per-consumer demand bookkeeping: the stage hands
//! it every subscribe / ask / cancel, and in return it reports how much
//! freshly granted demand the stage should now try to satisfy (drain the
//! buffer, then `handle_demand` or the transform queue).
//!
//! ## Built-in implementations
//! - [`DemandDispatcher`] — sends each batch to the consumer with the
//!   highest outstanding demand. The default.
//! - [`BroadcastDispatcher`] — sends every event to every consumer, pacing
//!   at the slowest consumer's demand.
//! - [`PartitionDispatcher`] — routes each event to one partition by hash;
//!   each consumer claims a partition at subscribe time.
//!
//! ## Contract
//! - `subscribe` / `cancel` / `ask` return the demand newly available for
//!   dispatching as a consequence of that change (0 if none).
//! - `dispatch` delivers what current demand allows via
//!   [`Subscription::send_events`] and returns the rest; the stage buffers
//!   the returned events. Relative event order must be preserved.
//! - `notify` delivers one notification to every subscribed consumer.
//! - A dispatcher never invents demand: the sum of granted counters never
//!   exceeds the sum of asks it has absorbed.

use crate::config::SubscriptionOptions;
use crate::error::StageError;
use crate::subscription::Subscription;

mod broadcast;
mod demand;
mod partition;

pub use broadcast::BroadcastDispatcher;
pub use demand::DemandDispatcher;
pub use partition::PartitionDispatcher;

/// Routing and demand bookkeeping for one producer's consumers.
///
/// `T` is the event type, `N` the notification type. Implementations hold
/// whatever state they need; the stage owns the instance and calls it from
/// its own task only.
pub trait Dispatcher<T, N>: Send + 'static {
    /// A consumer subscribed. Errors reject the subscription: the stage
    /// logs, cancels the consumer and carries on.
    fn subscribe(
        &mut self,
        opts: &SubscriptionOptions,
        from: &Subscription<T, N>,
    ) -> Result<usize, StageError>;

    /// A consumer went away (cancel or down). Returns demand freed up for
    /// the remaining consumers, if the policy creates any.
    fn cancel(&mut self, from: &Subscription<T, N>) -> usize;

    /// A consumer asked for `demand` more events.
    fn ask(&mut self, demand: usize, from: &Subscription<T, N>) -> usize;

    /// Routes `events`, delivering what demand allows, returning the rest
    /// in their original order.
    fn dispatch(&mut self, events: Vec<T>) -> Vec<T>;

    /// Delivers a notification to every subscribed consumer.
    fn notify(&mut self, msg: N);
}
