//! # Producer-consumer event bridge.
//!
//! A transforming stage has no `handle_demand`; downstream demand and
//! upstream events meet here instead. The bridge is always in one of two
//! shapes:
//!
//! - an integer of outstanding downstream demand (no events waiting), or
//! - a non-empty FIFO of upstream batches waiting for demand.
//!
//! Demand drains the queue, splitting the head batch when it is larger
//! than the remaining count; events consume demand or join the queue.
//! Nothing is ever dropped and no demand is invented: absorbed events are
//! handed out exactly once, in arrival order per upstream.

use std::collections::VecDeque;

use crate::subscription::Subscription;

/// One upstream batch waiting for downstream demand.
pub(crate) struct QueuedBatch<T, N> {
    pub events: Vec<T>,
    pub from: Subscription<T, N>,
}

enum State<T, N> {
    Demand(usize),
    Queue(VecDeque<QueuedBatch<T, N>>),
}

pub(crate) struct PcBridge<T, N> {
    state: State<T, N>,
}

impl<T, N> PcBridge<T, N> {
    pub fn new() -> Self {
        PcBridge {
            state: State::Demand(0),
        }
    }

    /// Downstream granted `count` more events. Returns the batches that
    /// can be delivered to `handle_events` right now, in order.
    pub fn add_demand(&mut self, count: usize) -> Vec<QueuedBatch<T, N>> {
        let queue = match &mut self.state {
            State::Demand(demand) => {
                *demand += count;
                return Vec::new();
            }
            State::Queue(queue) => queue,
        };

        let mut remaining = count;
        let mut due = Vec::new();
        while remaining > 0 {
            let Some(mut batch) = queue.pop_front() else {
                break;
            };
            if batch.events.len() <= remaining {
                remaining -= batch.events.len();
                due.push(batch);
            } else {
                let tail = batch.events.split_off(remaining);
                queue.push_front(QueuedBatch {
                    events: tail,
                    from: batch.from.clone(),
                });
                due.push(batch);
                remaining = 0;
            }
        }
        if queue.is_empty() {
            self.state = State::Demand(remaining);
        }
        due
    }

    /// An upstream batch arrived. Returns the portion coverable by
    /// outstanding demand (to deliver now); the rest is queued.
    pub fn absorb(&mut self, events: Vec<T>, from: Subscription<T, N>) -> Option<QueuedBatch<T, N>> {
        match &mut self.state {
            State::Demand(demand) if *demand > 0 => {
                let take = (*demand).min(events.len());
                *demand -= take;
                let mut head = events;
                let tail = if head.len() > take {
                    Some(head.split_off(take))
                } else {
                    None
                };
                if let Some(tail) = tail {
                    let mut queue = VecDeque::new();
                    queue.push_back(QueuedBatch {
                        events: tail,
                        from: from.clone(),
                    });
                    self.state = State::Queue(queue);
                }
                Some(QueuedBatch { events: head, from })
            }
            State::Demand(_) => {
                let mut queue = VecDeque::new();
                queue.push_back(QueuedBatch { events, from });
                self.state = State::Queue(queue);
                None
            }
            State::Queue(queue) => {
                queue.push_back(QueuedBatch { events, from });
                None
            }
        }
    }

    /// Outstanding downstream demand, zero while events are queued.
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        match &self.state {
            State::Demand(demand) => *demand,
            State::Queue(_) => 0,
        }
    }

    /// Events currently waiting for demand.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        match &self.state {
            State::Demand(_) => 0,
            State::Queue(queue) => queue.iter().map(|batch| batch.events.len()).sum(),
        }
    }
}
