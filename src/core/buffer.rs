//! # Producer-local event buffer with in-order notifications.
//!
//! Holds events a producer emitted beyond current downstream demand, plus
//! notifications anchored between specific events. Two representations:
//!
//! - **Unbounded**: one queue of tagged slots; notifications ride in-line,
//!   so ordering is intrinsic.
//! - **Bounded**: a ring of events plus a *wheel* — a map from ring
//!   position to the notifications anchored right after the event at that
//!   position. When eviction drops an event, its anchored notifications
//!   are surfaced immediately (returned as `ready`) instead of being lost.
//!
//! ## Rules
//! - `len` counts events only; `count <= capacity` always holds.
//! - `keep = First`: overflow discards the *new* events (prefix survives).
//! - `keep = Last`: overflow evicts the *oldest* events (suffix survives).
//! - `take` stops at a notification boundary so the caller can dispatch
//!   the events, then the notifications, in the exact enqueue order.

use std::collections::{HashMap, VecDeque};

use crate::config::{BufferConfig, BufferKeep, Capacity};

enum Slot<T, N> {
    Event(T),
    Notice(N),
}

enum Repr<T, N> {
    Unbounded {
        queue: VecDeque<Slot<T, N>>,
        events: usize,
    },
    Bounded {
        queue: VecDeque<T>,
        wheel: HashMap<usize, Vec<N>>,
        head: usize,
        capacity: usize,
        keep: BufferKeep,
    },
}

/// Result of [`EventBuffer::store`].
pub(crate) struct Stored<N> {
    /// Events discarded by the keep policy.
    pub dropped: usize,
    /// Notifications whose anchor events were evicted; dispatch now.
    pub ready: Vec<N>,
}

/// Result of [`EventBuffer::take`].
pub(crate) struct Taken<T, N> {
    /// Events, in enqueue order.
    pub events: Vec<T>,
    /// Notifications anchored right after the last taken event.
    pub notices: Vec<N>,
}

pub(crate) struct EventBuffer<T, N> {
    repr: Repr<T, N>,
}

impl<T, N> EventBuffer<T, N> {
    pub fn new(config: &BufferConfig) -> Self {
        let repr = match config.capacity {
            Capacity::Unbounded => Repr::Unbounded {
                queue: VecDeque::new(),
                events: 0,
            },
            Capacity::Bounded(capacity) => Repr::Bounded {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                wheel: HashMap::new(),
                head: 0,
                capacity,
                keep: config.keep,
            },
        };
        EventBuffer { repr }
    }

    /// Number of buffered events (notifications not counted).
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Unbounded { events, .. } => *events,
            Repr::Bounded { queue, .. } => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends events according to the keep policy.
    pub fn store(&mut self, incoming: Vec<T>) -> Stored<N> {
        match &mut self.repr {
            Repr::Unbounded { queue, events } => {
                *events += incoming.len();
                queue.extend(incoming.into_iter().map(Slot::Event));
                Stored {
                    dropped: 0,
                    ready: Vec::new(),
                }
            }
            Repr::Bounded {
                queue,
                wheel,
                head,
                capacity,
                keep,
            } => {
                if *capacity == 0 {
                    return Stored {
                        dropped: incoming.len(),
                        ready: Vec::new(),
                    };
                }
                match keep {
                    BufferKeep::First => {
                        let room = *capacity - queue.len();
                        let accepted = room.min(incoming.len());
                        let dropped = incoming.len() - accepted;
                        queue.extend(incoming.into_iter().take(accepted));
                        Stored {
                            dropped,
                            ready: Vec::new(),
                        }
                    }
                    BufferKeep::Last => {
                        queue.extend(incoming);
                        let mut dropped = 0;
                        let mut ready = Vec::new();
                        while queue.len() > *capacity {
                            queue.pop_front();
                            if let Some(notices) = wheel.remove(head) {
                                ready.extend(notices);
                            }
                            *head = (*head + 1) % *capacity;
                            dropped += 1;
                        }
                        Stored { dropped, ready }
                    }
                }
            }
        }
    }

    /// Anchors a notification after the currently last buffered event.
    ///
    /// Callers dispatch directly when the buffer is empty; an empty-buffer
    /// anchor has no event to attach to.
    pub fn put_notice(&mut self, notice: N) {
        debug_assert!(!self.is_empty(), "notices anchor to a buffered event");
        match &mut self.repr {
            Repr::Unbounded { queue, .. } => queue.push_back(Slot::Notice(notice)),
            Repr::Bounded {
                queue,
                wheel,
                head,
                capacity,
                ..
            } => {
                if queue.is_empty() || *capacity == 0 {
                    return;
                }
                let position = (*head + queue.len() - 1) % *capacity;
                wheel.entry(position).or_default().push(notice);
            }
        }
    }

    /// Removes up to `limit` events, stopping early at a notification
    /// boundary. The returned notifications follow the returned events in
    /// the logical stream; a call may return notifications alone when the
    /// boundary sits at the front.
    pub fn take(&mut self, limit: usize) -> Taken<T, N> {
        let mut events = Vec::new();
        let mut notices = Vec::new();
        match &mut self.repr {
            Repr::Unbounded {
                queue,
                events: count,
            } => loop {
                match queue.front() {
                    Some(Slot::Notice(_)) => {
                        let Some(Slot::Notice(notice)) = queue.pop_front() else {
                            unreachable!()
                        };
                        notices.push(notice);
                    }
                    Some(Slot::Event(_)) => {
                        if !notices.is_empty() || events.len() == limit {
                            break;
                        }
                        let Some(Slot::Event(event)) = queue.pop_front() else {
                            unreachable!()
                        };
                        *count -= 1;
                        events.push(event);
                    }
                    None => break,
                }
            },
            Repr::Bounded {
                queue,
                wheel,
                head,
                capacity,
                ..
            } => {
                while events.len() < limit {
                    let Some(event) = queue.pop_front() else {
                        break;
                    };
                    events.push(event);
                    let at_boundary = wheel.remove(head).map(|found| notices.extend(found));
                    *head = (*head + 1) % *capacity;
                    if at_boundary.is_some() {
                        break;
                    }
                }
            }
        }
        Taken { events, notices }
    }
}
