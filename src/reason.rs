//! # Exit reasons and disconnect notifications.
//!
//! Every stage terminates with an [`ExitReason`]. The reason travels in
//! three places:
//!
//! - monitors observe it as the payload of a `DOWN` notification;
//! - `CANCEL` protocol messages carry one as the cancellation reason;
//! - a consumer with a permanent subscription re-uses the producer's exit
//!   reason as its own when the producer goes away.
//!
//! [`ExitReason::Normal`] and [`ExitReason::Shutdown`] are "clean": a stage
//! exiting with either is unremarkable. Anything else is logged at error
//! level when the stage terminates.

use std::fmt;
use std::sync::Arc;

/// Why a stage terminated, or why a subscription was cancelled.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Orderly exit; nothing to report.
    Normal,
    /// Exit caused by a shutdown request (cancellation token or supervisor).
    Shutdown,
    /// A permanent subscription targeted a producer that is not running.
    NoProc,
    /// A producer rejected a `SUBSCRIBE` whose reference it already knows.
    DuplicatedSubscription,
    /// A protocol message referenced a subscription the peer does not know.
    UnknownSubscription,
    /// Any other failure, including panics inside callbacks.
    Error(Arc<str>),
}

impl ExitReason {
    /// Builds an [`ExitReason::Error`] from any string-ish message.
    pub fn error(message: impl Into<Arc<str>>) -> Self {
        ExitReason::Error(message.into())
    }

    /// True for reasons that do not indicate a failure.
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitReason::Normal | ExitReason::Shutdown)
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExitReason::Normal => "normal",
            ExitReason::Shutdown => "shutdown",
            ExitReason::NoProc => "no_proc",
            ExitReason::DuplicatedSubscription => "duplicated_subscription",
            ExitReason::UnknownSubscription => "unknown_subscription",
            ExitReason::Error(_) => "error",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Error(msg) => write!(f, "error: {msg}"),
            other => f.write_str(other.as_label()),
        }
    }
}

/// How a subscription ended, as seen by `handle_cancel`.
///
/// `Cancel` means the peer (or the local stage) tore the subscription down
/// explicitly; `Down` means the peer terminated and the monitor fired. Both
/// carry the underlying reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disconnect {
    /// An explicit `CANCEL` was exchanged.
    Cancel(ExitReason),
    /// The peer terminated; its exit reason is attached.
    Down(ExitReason),
}

impl Disconnect {
    /// The underlying cancellation or exit reason.
    pub fn reason(&self) -> &ExitReason {
        match self {
            Disconnect::Cancel(reason) | Disconnect::Down(reason) => reason,
        }
    }

    /// Consumes the notification, returning the reason.
    pub fn into_reason(self) -> ExitReason {
        match self {
            Disconnect::Cancel(reason) | Disconnect::Down(reason) => reason,
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Cancel(reason) => write!(f, "cancel ({reason})"),
            Disconnect::Down(reason) => write!(f, "down ({reason})"),
        }
    }
}
