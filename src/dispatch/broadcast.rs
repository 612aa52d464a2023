//! # Broadcast dispatcher.
//!
//! Clones every event to every consumer. The pace is set by the slowest
//! consumer: events are dispatched only up to the minimum outstanding
//! demand across all subscribers, so no consumer is ever sent more than it
//! asked for. A newly subscribed consumer starts with zero demand and
//! therefore pauses the broadcast until its first ask arrives.
//!
//! The granted counters reported to the stage track the *minimum* demand:
//! an ask (or the departure of the slowest consumer) grants exactly the
//! amount by which the minimum rose.

use crate::config::SubscriptionOptions;
use crate::error::StageError;
use crate::subscription::{Subscription, SubscriptionId};

use super::Dispatcher;

/// Delivers every event to every consumer, pacing at the slowest one.
pub struct BroadcastDispatcher<T, N> {
    /// Outstanding demand per consumer.
    subscribers: Vec<(usize, Subscription<T, N>)>,
}

impl<T, N> BroadcastDispatcher<T, N> {
    pub fn new() -> Self {
        BroadcastDispatcher {
            subscribers: Vec::new(),
        }
    }

    fn minimum(&self) -> usize {
        self.subscribers
            .iter()
            .map(|(demand, _)| *demand)
            .min()
            .unwrap_or(0)
    }

    fn position(&self, id: SubscriptionId) -> Option<usize> {
        self.subscribers.iter().position(|(_, sub)| sub.id() == id)
    }
}

impl<T, N> Default for BroadcastDispatcher<T, N> {
    fn default() -> Self {
        BroadcastDispatcher::new()
    }
}

impl<T, N> Dispatcher<T, N> for BroadcastDispatcher<T, N>
where
    T: Clone + Send + 'static,
    N: Clone + Send + 'static,
{
    fn subscribe(
        &mut self,
        opts: &SubscriptionOptions,
        from: &Subscription<T, N>,
    ) -> Result<usize, StageError> {
        opts.resolve()?;
        self.subscribers.push((0, from.clone()));
        // The new subscriber has no demand yet, so the minimum is now 0.
        Ok(0)
    }

    fn cancel(&mut self, from: &Subscription<T, N>) -> usize {
        let Some(at) = self.position(from.id()) else {
            return 0;
        };
        let before = self.minimum();
        self.subscribers.remove(at);
        if self.subscribers.is_empty() {
            return 0;
        }
        // Removing the slowest consumer can raise the shared minimum.
        self.minimum().saturating_sub(before)
    }

    fn ask(&mut self, demand: usize, from: &Subscription<T, N>) -> usize {
        let Some(at) = self.position(from.id()) else {
            return 0;
        };
        let before = self.minimum();
        self.subscribers[at].0 += demand;
        self.minimum().saturating_sub(before)
    }

    fn dispatch(&mut self, mut events: Vec<T>) -> Vec<T> {
        if self.subscribers.is_empty() {
            return events;
        }
        let len = self.minimum().min(events.len());
        if len == 0 {
            return events;
        }
        let batch: Vec<T> = events.drain(..len).collect();
        for (demand, sub) in &mut self.subscribers {
            *demand -= len;
            sub.send_events(batch.clone());
        }
        events
    }

    fn notify(&mut self, msg: N) {
        for (_, sub) in &self.subscribers {
            sub.send_notice(msg.clone());
        }
    }
}
