//! # Peer liveness monitoring.
//!
//! Every stage owns a [`MonitorHub`] that is shared with everyone holding
//! its address. Watching a hub registers a down-sink; when the stage
//! terminates, each registered sink fires exactly once with the exit
//! reason. Watching a hub whose stage has already terminated fires the
//! sink immediately with the stored reason, so there is no window in which
//! a death can be missed.
//!
//! ## Rules
//! - A sink fires at most once; `unwatch` before the exit suppresses it.
//! - Exit fan-out order across watchers is unspecified.
//! - `unwatch` after the exit is a no-op (the down notification for that
//!   monitor may already be in the watcher's mailbox and is dropped there).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::reason::ExitReason;

static NEXT_MONITOR: AtomicU64 = AtomicU64::new(0);

/// Identifies one watch registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

impl MonitorId {
    fn next() -> Self {
        MonitorId(NEXT_MONITOR.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback invoked with the monitor id and exit reason when the watched
/// stage terminates.
pub(crate) type DownSink = Box<dyn FnOnce(MonitorId, ExitReason) + Send>;

enum HubState {
    Alive(HashMap<MonitorId, DownSink>),
    Exited(ExitReason),
}

/// Shared record of one stage's liveness.
pub(crate) struct MonitorHub {
    state: Mutex<HubState>,
}

impl MonitorHub {
    pub(crate) fn new() -> Self {
        MonitorHub {
            state: Mutex::new(HubState::Alive(HashMap::new())),
        }
    }

    /// Registers a down-sink. Fires it immediately if the stage has
    /// already terminated.
    pub(crate) fn watch(&self, sink: DownSink) -> MonitorId {
        let id = MonitorId::next();
        let exited = {
            let mut state = self.state.lock().expect("monitor lock poisoned");
            match &mut *state {
                HubState::Alive(watchers) => {
                    watchers.insert(id, sink);
                    return id;
                }
                HubState::Exited(reason) => reason.clone(),
            }
        };
        sink(id, exited);
        id
    }

    /// Removes a registration. No-op once the stage has exited.
    pub(crate) fn unwatch(&self, id: MonitorId) {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        if let HubState::Alive(watchers) = &mut *state {
            watchers.remove(&id);
        }
    }

    /// Records the exit and fires every registered sink.
    pub(crate) fn down(&self, reason: ExitReason) {
        let watchers = {
            let mut state = self.state.lock().expect("monitor lock poisoned");
            match std::mem::replace(&mut *state, HubState::Exited(reason.clone())) {
                HubState::Alive(watchers) => watchers,
                // Keep the first recorded reason.
                HubState::Exited(first) => {
                    *state = HubState::Exited(first);
                    return;
                }
            }
        };
        for (id, sink) in watchers {
            sink(id, reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sink(tx: mpsc::Sender<(MonitorId, ExitReason)>) -> DownSink {
        Box::new(move |id, reason| {
            let _ = tx.send((id, reason));
        })
    }

    #[test]
    fn watch_then_down_fires_once() {
        let hub = MonitorHub::new();
        let (tx, rx) = mpsc::channel();
        let id = hub.watch(sink(tx));
        hub.down(ExitReason::Normal);
        assert_eq!(rx.recv().unwrap(), (id, ExitReason::Normal));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn watching_a_dead_hub_fires_immediately() {
        let hub = MonitorHub::new();
        hub.down(ExitReason::error("boom"));
        let (tx, rx) = mpsc::channel();
        hub.watch(sink(tx));
        let (_, reason) = rx.recv().unwrap();
        assert_eq!(reason, ExitReason::error("boom"));
    }

    #[test]
    fn unwatch_suppresses_the_sink() {
        let hub = MonitorHub::new();
        let (tx, rx) = mpsc::channel();
        let id = hub.watch(sink(tx));
        hub.unwatch(id);
        hub.down(ExitReason::Shutdown);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_down_keeps_the_first_reason() {
        let hub = MonitorHub::new();
        hub.down(ExitReason::error("first"));
        hub.down(ExitReason::Normal);
        let (tx, rx) = mpsc::channel();
        hub.watch(sink(tx));
        let (_, reason) = rx.recv().unwrap();
        assert_eq!(reason, ExitReason::error("first"));
    }
}
