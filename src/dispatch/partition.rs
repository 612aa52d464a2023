//! # Partition dispatcher.
//!
//! Routes each event to one of a fixed number of partitions, each claimed
//! by at most one consumer (`SubscriptionOptions::partition`). The
//! partition of an event is `hash(event) % partitions` with the standard
//! hasher, or a user function supplied via
//! [`PartitionDispatcher::with_hash`].
//!
//! Events for a partition whose consumer has no demand (or no consumer
//! yet) wait in a per-partition queue inside the dispatcher; an ask drains
//! that queue before granting fresh demand to the stage. Keeping the
//! stalled events per partition preserves each partition's event order no
//! matter how unevenly the consumers ask.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use crate::config::SubscriptionOptions;
use crate::error::StageError;
use crate::subscription::{Subscription, SubscriptionId};

use super::Dispatcher;

type HashFn<T> = Box<dyn Fn(&T) -> usize + Send>;

struct Partition<T, N> {
    subscriber: Option<(usize, Subscription<T, N>)>,
    waiting: VecDeque<T>,
}

impl<T, N> Partition<T, N> {
    fn new() -> Self {
        Partition {
            subscriber: None,
            waiting: VecDeque::new(),
        }
    }
}

/// Routes events to partitioned consumers by hash.
pub struct PartitionDispatcher<T, N> {
    hash: HashFn<T>,
    partitions: Vec<Partition<T, N>>,
}

impl<T, N> PartitionDispatcher<T, N> {
    /// `partitions` slots, events placed by the standard hasher.
    pub fn new(partitions: usize) -> Self
    where
        T: Hash,
    {
        PartitionDispatcher::with_hash(partitions, |event: &T| {
            let mut hasher = DefaultHasher::new();
            event.hash(&mut hasher);
            hasher.finish() as usize
        })
    }

    /// `partitions` slots, events placed by `hash` (taken modulo the
    /// partition count).
    pub fn with_hash(partitions: usize, hash: impl Fn(&T) -> usize + Send + 'static) -> Self {
        let mut slots = Vec::with_capacity(partitions);
        slots.resize_with(partitions, Partition::new);
        PartitionDispatcher {
            hash: Box::new(hash),
            partitions: slots,
        }
    }

    fn partition_of(&self, id: SubscriptionId) -> Option<usize> {
        self.partitions.iter().position(|partition| {
            partition
                .subscriber
                .as_ref()
                .is_some_and(|(_, sub)| sub.id() == id)
        })
    }
}

impl<T, N> Dispatcher<T, N> for PartitionDispatcher<T, N>
where
    T: Send + 'static,
    N: Clone + Send + 'static,
{
    fn subscribe(
        &mut self,
        opts: &SubscriptionOptions,
        from: &Subscription<T, N>,
    ) -> Result<usize, StageError> {
        opts.resolve()?;
        let Some(partition) = opts.partition else {
            return Err(StageError::bad_opts(
                "subscriptions to a partitioned producer must pick a partition",
            ));
        };
        if partition >= self.partitions.len() {
            return Err(StageError::bad_opts(format!(
                "partition {partition} is out of range (0..{})",
                self.partitions.len()
            )));
        }
        if self.partitions[partition].subscriber.is_some() {
            return Err(StageError::bad_opts(format!(
                "partition {partition} already has a subscriber"
            )));
        }
        self.partitions[partition].subscriber = Some((0, from.clone()));
        Ok(0)
    }

    fn cancel(&mut self, from: &Subscription<T, N>) -> usize {
        if let Some(at) = self.partition_of(from.id()) {
            // Events waiting for this partition stay queued for the next
            // subscriber; they were produced and must not be dropped.
            self.partitions[at].subscriber = None;
        }
        0
    }

    fn ask(&mut self, demand: usize, from: &Subscription<T, N>) -> usize {
        let Some(at) = self.partition_of(from.id()) else {
            return 0;
        };
        let partition = &mut self.partitions[at];
        let Some((outstanding, sub)) = partition.subscriber.as_mut() else {
            return 0;
        };
        *outstanding += demand;
        let drained = (*outstanding).min(partition.waiting.len());
        if drained > 0 {
            let batch: Vec<T> = partition.waiting.drain(..drained).collect();
            *outstanding -= drained;
            sub.send_events(batch);
        }
        // Demand covered from the waiting queue is spent; only the rest is
        // fresh capacity for the stage.
        demand - drained.min(demand)
    }

    fn dispatch(&mut self, events: Vec<T>) -> Vec<T> {
        let count = self.partitions.len();
        if count == 0 {
            return events;
        }
        let mut batches: Vec<Vec<T>> = Vec::with_capacity(count);
        batches.resize_with(count, Vec::new);

        for event in events {
            let at = (self.hash)(&event) % count;
            let partition = &mut self.partitions[at];
            match partition.subscriber.as_mut() {
                Some((outstanding, _)) if *outstanding > 0 && partition.waiting.is_empty() => {
                    *outstanding -= 1;
                    batches[at].push(event);
                }
                _ => partition.waiting.push_back(event),
            }
        }

        for (at, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            if let Some((_, sub)) = &self.partitions[at].subscriber {
                sub.send_events(batch);
            }
        }
        Vec::new()
    }

    fn notify(&mut self, msg: N) {
        for partition in &self.partitions {
            if let Some((_, sub)) = &partition.subscriber {
                sub.send_notice(msg.clone());
            }
        }
    }
}
