//! # Subscription and buffer configuration.
//!
//! Two knobs govern the flow of events:
//!
//! - [`SubscriptionOptions`] shape one producer→consumer subscription:
//!   the demand window (`min_demand`/`max_demand`) and what happens to the
//!   consumer when the producer goes away ([`CancelPolicy`]).
//! - [`BufferConfig`] shapes the producer-local buffer that absorbs events
//!   emitted beyond current downstream demand: its [`Capacity`] and which
//!   end overflows ([`BufferKeep`]).
//!
//! ## Defaults
//! - `max_demand = 1000`, `min_demand = max_demand / 2`
//! - `cancel = CancelPolicy::Permanent`
//! - producers buffer up to 10 000 events keeping the most recent
//! - producer-consumers buffer without bound

use crate::error::StageError;

/// Default `max_demand` when the subscriber does not pick one.
pub const DEFAULT_MAX_DEMAND: usize = 1000;

/// Default producer buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// What happens to a consumer when its producer terminates or cancels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Losing the producer terminates the consumer with the same reason.
    #[default]
    Permanent,
    /// Losing the producer only runs `handle_cancel`; the stage continues.
    Temporary,
}

/// Per-subscription options, validated when the subscription is made.
///
/// `min_demand` and `max_demand` bound the demand window: the consumer asks
/// for `max_demand` events up front and tops the window back up whenever the
/// outstanding count sinks to `min_demand` or below. User callbacks never
/// see a batch larger than `max_demand - min_demand`.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionOptions {
    /// Consumer fate on producer loss.
    pub cancel: CancelPolicy,
    /// Lower demand bound; defaults to `max_demand / 2`.
    /// Must be strictly lower than `max_demand`.
    pub min_demand: Option<usize>,
    /// Upper demand bound; defaults to 1000. Must be at least 1.
    pub max_demand: Option<usize>,
    /// Target partition, for producers running a partition dispatcher.
    /// Ignored by the other dispatchers.
    pub partition: Option<usize>,
}

impl SubscriptionOptions {
    /// Options with a temporary cancel policy, other fields default.
    pub fn temporary() -> Self {
        SubscriptionOptions {
            cancel: CancelPolicy::Temporary,
            ..Default::default()
        }
    }

    /// Options with the given demand window, other fields default.
    pub fn with_demand(min: usize, max: usize) -> Self {
        SubscriptionOptions {
            min_demand: Some(min),
            max_demand: Some(max),
            ..Default::default()
        }
    }

    /// Resolves defaults and checks the demand bounds.
    pub(crate) fn resolve(&self) -> Result<DemandBounds, StageError> {
        let max = self.max_demand.unwrap_or(DEFAULT_MAX_DEMAND);
        if max == 0 {
            return Err(StageError::bad_opts("max_demand must be at least 1"));
        }
        let min = self.min_demand.unwrap_or(max / 2);
        if min >= max {
            return Err(StageError::bad_opts(format!(
                "min_demand ({min}) must be lower than max_demand ({max})"
            )));
        }
        Ok(DemandBounds { min, max })
    }
}

/// Resolved demand window bounds (`0 <= min < max`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DemandBounds {
    pub min: usize,
    pub max: usize,
}

/// Buffer capacity: a hard event bound, or none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many events are retained.
    Bounded(usize),
    /// The buffer grows as needed.
    Unbounded,
}

/// Which events survive when a bounded buffer overflows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BufferKeep {
    /// New events are discarded; the earliest-buffered survive.
    First,
    /// The oldest events are evicted; the most recent survive.
    #[default]
    Last,
}

/// Configuration of the producer-local event buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// Event bound.
    pub capacity: Capacity,
    /// Overflow policy, relevant only for bounded capacity.
    pub keep: BufferKeep,
}

impl BufferConfig {
    /// A bounded buffer with the default keep policy.
    pub fn bounded(capacity: usize) -> Self {
        BufferConfig {
            capacity: Capacity::Bounded(capacity),
            keep: BufferKeep::default(),
        }
    }

    /// An unbounded buffer.
    pub fn unbounded() -> Self {
        BufferConfig {
            capacity: Capacity::Unbounded,
            keep: BufferKeep::default(),
        }
    }

    /// Replaces the keep policy.
    pub fn keep(mut self, keep: BufferKeep) -> Self {
        self.keep = keep;
        self
    }
}

impl Default for BufferConfig {
    /// The producer default: `Bounded(10_000)`, keeping the most recent.
    fn default() -> Self {
        BufferConfig::bounded(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let bounds = SubscriptionOptions::default().resolve().unwrap();
        assert_eq!(bounds.max, DEFAULT_MAX_DEMAND);
        assert_eq!(bounds.min, DEFAULT_MAX_DEMAND / 2);
    }

    #[test]
    fn min_defaults_to_half_of_custom_max() {
        let opts = SubscriptionOptions {
            max_demand: Some(10),
            ..Default::default()
        };
        let bounds = opts.resolve().unwrap();
        assert_eq!(bounds, DemandBounds { min: 5, max: 10 });
    }

    #[test]
    fn zero_max_demand_is_rejected() {
        let opts = SubscriptionOptions {
            max_demand: Some(0),
            ..Default::default()
        };
        assert!(matches!(opts.resolve(), Err(StageError::BadOpts { .. })));
    }

    #[test]
    fn min_must_stay_below_max() {
        let opts = SubscriptionOptions::with_demand(10, 10);
        assert!(matches!(opts.resolve(), Err(StageError::BadOpts { .. })));
        let opts = SubscriptionOptions::with_demand(0, 1);
        assert!(opts.resolve().is_ok());
    }
}
