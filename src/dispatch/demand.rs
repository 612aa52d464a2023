//! # Demand-fair dispatcher.
//!
//! Sends each batch of events to the consumer with the highest outstanding
//! demand, splitting batches across consumers as demand runs out. This is
//! the default dispatcher and the right choice for work-queue pipelines
//! where each event should be processed exactly once.
//!
//! Mixing different `max_demand` values across subscribers skews the
//! highest-demand heuristic, so the first subscriber's `max_demand` is
//! remembered and later mismatches draw a warning.

use tracing::warn;

use crate::config::SubscriptionOptions;
use crate::error::StageError;
use crate::subscription::{Subscription, SubscriptionId};

use super::Dispatcher;

/// Default dispatcher: highest outstanding demand wins each batch.
pub struct DemandDispatcher<T, N> {
    /// Outstanding demand per consumer, sorted descending by demand.
    demands: Vec<(usize, Subscription<T, N>)>,
    /// `max_demand` of the first subscriber, for mismatch warnings.
    expected_max: Option<usize>,
}

impl<T, N> DemandDispatcher<T, N> {
    pub fn new() -> Self {
        DemandDispatcher {
            demands: Vec::new(),
            expected_max: None,
        }
    }

    fn position(&self, id: SubscriptionId) -> Option<usize> {
        self.demands.iter().position(|(_, sub)| sub.id() == id)
    }

    /// Re-inserts an entry keeping the vector sorted descending by demand.
    fn insert_sorted(&mut self, entry: (usize, Subscription<T, N>)) {
        let at = self.demands.partition_point(|(d, _)| *d >= entry.0);
        self.demands.insert(at, entry);
    }
}

impl<T, N> Default for DemandDispatcher<T, N> {
    fn default() -> Self {
        DemandDispatcher::new()
    }
}

impl<T, N> Dispatcher<T, N> for DemandDispatcher<T, N>
where
    T: Send + 'static,
    N: Clone + Send + 'static,
{
    fn subscribe(
        &mut self,
        opts: &SubscriptionOptions,
        from: &Subscription<T, N>,
    ) -> Result<usize, StageError> {
        let bounds = opts.resolve()?;
        match self.expected_max {
            None => self.expected_max = Some(bounds.max),
            Some(expected) if expected != bounds.max => warn!(
                expected,
                got = bounds.max,
                subscription = %from.id(),
                "subscribers should use the same max_demand for fair dispatching"
            ),
            Some(_) => {}
        }
        self.demands.push((0, from.clone()));
        Ok(0)
    }

    fn cancel(&mut self, from: &Subscription<T, N>) -> usize {
        if let Some(at) = self.position(from.id()) {
            self.demands.remove(at);
        }
        0
    }

    fn ask(&mut self, demand: usize, from: &Subscription<T, N>) -> usize {
        let Some(at) = self.position(from.id()) else {
            return 0;
        };
        let (current, sub) = self.demands.remove(at);
        self.insert_sorted((current + demand, sub));
        demand
    }

    fn dispatch(&mut self, mut events: Vec<T>) -> Vec<T> {
        loop {
            if events.is_empty() {
                return events;
            }
            // Sorted descending: if the head has no demand, nobody has.
            let Some((demand, _)) = self.demands.first() else {
                return events;
            };
            if *demand == 0 {
                return events;
            }
            let (demand, sub) = self.demands.remove(0);
            let len = demand.min(events.len());
            let batch: Vec<T> = events.drain(..len).collect();
            sub.send_events(batch);
            self.insert_sorted((demand - len, sub));
        }
    }

    fn notify(&mut self, msg: N) {
        for (_, sub) in &self.demands {
            sub.send_notice(msg.clone());
        }
    }
}
