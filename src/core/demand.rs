//! # Per-subscription demand window.
//!
//! Tracks how many events a producer still owes us on one automatic
//! subscription. The window starts full (`pending = max`), shrinks as
//! batches arrive, and is topped back up with a single ask the moment it
//! sinks to `min` or below. Batches beyond the window (a producer
//! overshooting what was asked) clamp the accounting at zero; the caller
//! logs the excess.

/// Demand window of one automatic subscription. `0 <= min < max` and
/// `pending <= max` hold throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DemandWindow {
    pending: usize,
    min: usize,
    max: usize,
}

/// Accounting result for one arrived batch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
    /// Events delivered beyond the asked demand.
    pub excess: usize,
    /// Top-up ask to send after the user callback, if the window refilled.
    pub ask: Option<usize>,
}

impl DemandWindow {
    /// A full window; the initial `ask(max)` is assumed sent.
    pub fn new(min: usize, max: usize) -> Self {
        debug_assert!(min < max);
        DemandWindow {
            pending: max,
            min,
            max,
        }
    }

    /// Largest batch the user callback may see: one refill window.
    pub fn max_batch(&self) -> usize {
        self.max - self.min
    }

    /// Accounts for an arrived batch of `len` events.
    pub fn on_batch(&mut self, len: usize) -> BatchOutcome {
        let excess = len.saturating_sub(self.pending);
        self.pending -= len - excess;
        let ask = if self.pending <= self.min {
            let ask = self.max - self.pending;
            self.pending = self.max;
            Some(ask)
        } else {
            None
        };
        BatchOutcome { excess, ask }
    }
}

/// Splits a batch into chunks of at most `limit` events, preserving order.
pub(crate) fn split_events<T>(events: Vec<T>, limit: usize) -> Vec<Vec<T>> {
    debug_assert!(limit >= 1);
    if events.len() <= limit {
        return vec![events];
    }
    let mut chunks = Vec::with_capacity(events.len() / limit + 1);
    let mut rest = events;
    while rest.len() > limit {
        let tail = rest.split_off(limit);
        chunks.push(rest);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_open_above_min() {
        let mut window = DemandWindow::new(5, 10);
        let outcome = window.on_batch(3);
        assert_eq!(outcome, BatchOutcome { excess: 0, ask: None });
        assert_eq!(window.pending, 7);
    }

    #[test]
    fn refills_at_or_below_min() {
        let mut window = DemandWindow::new(5, 10);
        // 10 - 5 = 5 <= min: refill back to max with one ask of 5.
        let outcome = window.on_batch(5);
        assert_eq!(outcome, BatchOutcome { excess: 0, ask: Some(5) });
        assert_eq!(window.pending, 10);
    }

    #[test]
    fn min_zero_refills_only_when_drained() {
        let mut window = DemandWindow::new(0, 4);
        assert_eq!(window.on_batch(3).ask, None);
        assert_eq!(window.on_batch(1).ask, Some(4));
    }

    #[test]
    fn excess_is_clamped_and_reported() {
        let mut window = DemandWindow::new(0, 4);
        let outcome = window.on_batch(7);
        assert_eq!(outcome.excess, 3);
        // Clamped to zero and refilled in the same step.
        assert_eq!(outcome.ask, Some(4));
        assert_eq!(window.pending, 4);
    }

    #[test]
    fn split_preserves_order_and_sizes() {
        let chunks = split_events((1..=7).collect::<Vec<_>>(), 3);
        assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[test]
    fn split_leaves_small_batches_alone() {
        let chunks = split_events(vec![1, 2], 5);
        assert_eq!(chunks, vec![vec![1, 2]]);
    }
}
