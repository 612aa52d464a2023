//! # Error types used by the stagevisor runtime.
//!
//! This module defines two main error enums:
//!
//! - [`StartError`] errors raised while spawning a stage.
//! - [`StageError`] errors raised by operations against a running stage.
//!
//! Both types provide an `as_label` helper for logs and metrics.
//!
//! Exit *reasons* are a separate concept: a stage that terminates does so
//! with an [`ExitReason`](crate::ExitReason), which peers observe through
//! monitors. The enums here are for the caller-facing `Result` surface only.

use std::time::Duration;

use thiserror::Error;

use crate::reason::ExitReason;

/// # Errors produced while starting a stage.
///
/// These surface from [`start`](crate::start) before the stage enters its
/// message loop.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StartError {
    /// The stage options were invalid (wrong option for the declared role,
    /// or demand bounds out of range).
    #[error("invalid stage options: {reason}")]
    BadOpts {
        /// Human-readable description of the offending option.
        reason: String,
    },

    /// `init` refused to start and returned a stop reason.
    #[error("stage refused to start: {reason}")]
    Stopped {
        /// The reason returned from `init`.
        reason: ExitReason,
    },

    /// `init` asked to be ignored; no stage was started.
    #[error("stage start was ignored")]
    Ignored,
}

impl StartError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StartError::BadOpts { .. } => "start_bad_opts",
            StartError::Stopped { .. } => "start_stopped",
            StartError::Ignored => "start_ignored",
        }
    }
}

/// # Errors produced by operations on a running stage.
///
/// Raised by the [`StageHandle`](crate::StageHandle) surface (calls,
/// subscriptions, notifications). A failed operation never affects the
/// stage itself; timeouts fail the caller only.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StageError {
    /// Subscription options failed validation.
    #[error("invalid subscription options: {reason}")]
    BadOpts {
        /// Human-readable description of the offending option.
        reason: String,
    },

    /// The operation requires a producer (e.g. notifications were sent to
    /// a plain consumer).
    #[error("stage is not a producer")]
    NotAProducer,

    /// The producer targeted by a subscription is not running.
    #[error("the target producer is not running")]
    NoProc,

    /// The stage has terminated and no longer accepts messages.
    #[error("stage has terminated")]
    Stopped,

    /// The stage processed a call without replying.
    #[error("stage did not reply")]
    NoReply,

    /// A synchronous operation did not complete in time.
    ///
    /// The stage is unaffected; only the caller observes the failure.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

impl StageError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            StageError::BadOpts { .. } => "bad_opts",
            StageError::NotAProducer => "not_a_producer",
            StageError::NoProc => "no_proc",
            StageError::Stopped => "stopped",
            StageError::NoReply => "no_reply",
            StageError::Timeout { .. } => "timeout",
        }
    }

    pub(crate) fn bad_opts(reason: impl Into<String>) -> Self {
        StageError::BadOpts {
            reason: reason.into(),
        }
    }
}
