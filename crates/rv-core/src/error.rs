//! Error types for the verification engine
//!
//! Only configuration errors, an empty catalog and blocking preflight issues
//! escape a run as [`RunError`]. Everything that happens after the first
//! recovery is submitted is captured per workload as [`RecoveryError`] and
//! surfaces through the run summary instead.

use crate::preflight::PreflightReport;
use crate::session::SessionState;
use rv_api::ApiError;
use std::time::Duration;

/// Run-level failure, raised before any side effect
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Invalid scope or missing strategy parameters
    #[error("configuration error: {0}")]
    Config(String),

    /// No backup job matched the scope
    #[error("no backup jobs matched the scope")]
    NoJobs,

    /// Jobs matched but not a single restore point exists
    #[error("no restore points found across {jobs} job(s)")]
    NoRestorePoints { jobs: usize },

    /// Preflight found blocking issues
    #[error("preflight blocked the run: {}", .0.blocking_summary())]
    PreflightBlocked(PreflightReport),

    /// Remote failure before recovery started
    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

impl RunError {
    /// Check if the error was caused by configuration
    #[inline]
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Why a single workload's recovery failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecoveryError {
    /// Recovered instance never showed up in inventory
    #[error("instance {name} did not appear in inventory within {waited:?}")]
    InstanceNotFound { name: String, waited: Duration },

    /// The isolated network is already one of the instance's networks
    #[error("isolated network {network} is the instance's original network")]
    NetworkNotIsolated { network: String },

    /// Power-off was requested but never confirmed
    #[error("power-off of {name} not confirmed within {waited:?}")]
    PowerOffUnconfirmed { name: String, waited: Duration },

    /// Power-on was requested but never confirmed
    #[error("power-on of {name} not confirmed within {waited:?}")]
    PowerOnUnconfirmed { name: String, waited: Duration },

    /// Adapter rewrite failed or did not stick
    #[error("network rewrite of {name} failed: {reason}")]
    NetworkRewriteFailed { name: String, reason: String },

    /// Instance is attached to something other than the isolated network
    #[error("instance {name} is attached to non-isolated networks {networks:?}")]
    ForeignAttachment { name: String, networks: Vec<String> },

    /// Full-copy restore without a resolved storage target
    #[error("no storage target resolved for full restore")]
    NoStorageTarget,

    /// Async restore job ended without success
    #[error("restore job {job} ended {state}: {message}")]
    RestoreJobFailed {
        job: String,
        state: String,
        message: String,
    },

    /// Async restore job did not finish in time
    #[error("restore job {job} still running after {waited:?}")]
    RestoreJobTimedOut { job: String, waited: Duration },

    /// The per-workload ceiling expired
    #[error("workload exceeded its {0:?} ceiling")]
    WorkloadTimedOut(Duration),

    /// The worker panicked
    #[error("worker aborted: {0}")]
    WorkerPanicked(String),

    /// Illegal session transition
    #[error("state machine: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Remote failure
    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

/// Failure of a bounded poll loop
#[derive(Debug, Clone, thiserror::Error)]
pub enum PollError {
    /// Deadline passed without the condition becoming true
    #[error("timed out after {waited:?} waiting for {what}")]
    TimedOut { what: String, waited: Duration },

    /// A non-retryable remote failure ended the poll early
    #[error("api error while polling: {0}")]
    Api(ApiError),
}

/// Illegal session state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from:?} -> {to:?}")]
pub struct StateMachineError {
    /// State the session was in
    pub from: SessionState,
    /// Requested state
    pub to: SessionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_display() {
        let err = RunError::Config("max_concurrent_vms must be at least 1".into());
        assert!(err.to_string().contains("configuration error"));
        assert!(err.is_config());
        assert!(!RunError::NoJobs.is_config());
    }

    #[test]
    fn recovery_error_display_names_instance() {
        let err = RecoveryError::PowerOffUnconfirmed {
            name: "DB01-verify".into(),
            waited: Duration::from_secs(120),
        };
        assert!(err.to_string().contains("DB01-verify"));
    }

    #[test]
    fn illegal_transition_display() {
        let err = StateMachineError {
            from: SessionState::Pending,
            to: SessionState::Running,
        };
        assert_eq!(err.to_string(), "illegal transition Pending -> Running");
    }
}
