//! Recovery sessions and their state machine
//!
//! ```text
//! Pending ─▶ Submitted ─▶ AwaitingNetworkSafety ─▶ Running ─▶ VerificationInProgress
//!    │           │                 │                  │                 │
//!    └──────▶ Failed ◀─────────────┴──────────────────┴─────────────────┘
//!
//! {Submitted .. VerificationInProgress, Failed} ─▶ CleanedUp | CleanupFailed
//! ```
//!
//! A session is owned by exactly one worker until it is handed to cleanup;
//! the record outlives the instance for reporting.

use crate::error::{RecoveryError, StateMachineError};
use crate::types::{IsolatedNetwork, RecoveryStrategy, SessionId};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rv_api::{AsyncJobRef, MountHandle, RestorePoint};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a recovery session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, nothing submitted yet
    Pending,
    /// Recovery request sent
    Submitted,
    /// Instance found, isolation not yet established
    AwaitingNetworkSafety,
    /// Powered on inside the isolated network
    Running,
    /// Test battery running
    VerificationInProgress,
    /// Torn down
    CleanedUp,
    /// Recovery or verification failed
    Failed,
    /// Teardown did not complete
    CleanupFailed,
}

impl SessionState {
    /// Every state, in declaration order
    pub const ALL: [SessionState; 8] = [
        Self::Pending,
        Self::Submitted,
        Self::AwaitingNetworkSafety,
        Self::Running,
        Self::VerificationInProgress,
        Self::CleanedUp,
        Self::Failed,
        Self::CleanupFailed,
    ];

    /// States in which a recovered instance may exist
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::AwaitingNetworkSafety | Self::Running | Self::VerificationInProgress
        )
    }

    /// No further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleanedUp | Self::CleanupFailed)
    }
}

/// Allowed successors of `from`
#[must_use]
pub fn allowed_transitions(from: SessionState) -> Vec<SessionState> {
    use SessionState::*;
    match from {
        Pending => vec![Submitted, Failed],
        Submitted => vec![AwaitingNetworkSafety, Failed, CleanedUp, CleanupFailed],
        AwaitingNetworkSafety => vec![Running, Failed, CleanedUp, CleanupFailed],
        Running => vec![VerificationInProgress, Failed, CleanedUp, CleanupFailed],
        VerificationInProgress => vec![Failed, CleanedUp, CleanupFailed],
        Failed => vec![CleanedUp, CleanupFailed],
        CleanedUp | CleanupFailed => vec![],
    }
}

/// Validate a state transition
///
/// # Errors
/// [`StateMachineError`] when `to` is not a successor of `from`
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError { from, to })
    }
}

/// Timestamped state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Outcome of teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRecord {
    /// Every teardown step worked
    pub succeeded: bool,
    /// Instance was still present after the primary call and was removed directly
    pub forced: bool,
    /// Errors from failed steps
    pub errors: Vec<String>,
    /// Restore job that never reached a final state and may still create an instance
    #[serde(default)]
    pub abandoned_job: Option<String>,
    /// When cleanup finished
    pub at: DateTime<Utc>,
}

/// Mutable per-workload recovery record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    /// Session id
    pub id: SessionId,
    /// Restore point being recovered
    pub restore_point: RestorePoint,
    /// Recovery strategy
    pub strategy: RecoveryStrategy,
    /// Isolated network it must end up on
    pub network: IsolatedNetwork,
    /// Temporary name, unique across runs
    pub instance_name: String,
    /// Inventory id once discovered
    pub instance_id: Option<String>,
    /// Mount handle, mount-based recoveries only
    pub mount: Option<MountHandle>,
    /// Set once the mount has been stopped, by abort or by cleanup
    pub mount_released: bool,
    /// Restore job, full-copy restores only
    pub restore_job: Option<AsyncJobRef>,
    /// Set once polling saw the restore job reach a final state
    pub restore_job_finished: bool,
    /// Current state
    pub state: SessionState,
    /// First failure, if any
    pub error: Option<String>,
    /// Every transition, oldest first
    pub history: Vec<StateChange>,
    /// When the recovery was submitted
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the instance was confirmed running
    pub running_at: Option<DateTime<Utc>>,
    /// Teardown outcome
    pub cleanup: Option<CleanupRecord>,
}

impl RecoverySession {
    /// Create a pending session
    #[must_use]
    pub fn new(
        restore_point: RestorePoint,
        strategy: RecoveryStrategy,
        network: IsolatedNetwork,
    ) -> Self {
        let instance_name = temporary_instance_name(&restore_point.workload.name, Utc::now());
        Self {
            id: SessionId::new(),
            restore_point,
            strategy,
            network,
            instance_name,
            instance_id: None,
            mount: None,
            mount_released: false,
            restore_job: None,
            restore_job_finished: false,
            state: SessionState::Pending,
            error: None,
            history: Vec::new(),
            submitted_at: None,
            running_at: None,
            cleanup: None,
        }
    }

    /// Workload name
    #[inline]
    #[must_use]
    pub fn workload_name(&self) -> &str {
        &self.restore_point.workload.name
    }

    /// Move to `to`, recording the change
    ///
    /// # Errors
    /// [`StateMachineError`] on an illegal transition; the state is unchanged
    pub fn transition(&mut self, to: SessionState) -> Result<(), StateMachineError> {
        validate_transition(self.state, to)?;
        let now = Utc::now();
        match to {
            SessionState::Submitted => self.submitted_at = Some(now),
            SessionState::Running => self.running_at = Some(now),
            _ => {}
        }
        self.history.push(StateChange {
            from: self.state,
            to,
            at: now,
        });
        self.state = to;
        Ok(())
    }

    /// Record a failure and move to `Failed` when that is still legal
    pub fn fail(&mut self, error: &RecoveryError) {
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
        if validate_transition(self.state, SessionState::Failed).is_ok() {
            let _ = self.transition(SessionState::Failed);
        }
    }

    /// Whether the session got far enough to need teardown
    #[must_use]
    pub fn reached_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }

    /// Id of a submitted restore job whose outcome was never observed
    #[must_use]
    pub fn unfinished_restore_job(&self) -> Option<&str> {
        self.restore_job
            .as_ref()
            .filter(|_| !self.restore_job_finished)
            .map(|j| j.id.as_str())
    }

    /// Whether recovery produced a running instance
    #[must_use]
    pub fn recovered(&self) -> bool {
        self.running_at.is_some() && self.error.is_none()
    }

    /// Submit-to-running duration
    #[must_use]
    pub fn recovery_duration(&self) -> Option<Duration> {
        match (self.submitted_at, self.running_at) {
            (Some(s), Some(r)) => (r - s).to_std().ok(),
            _ => None,
        }
    }

    /// Whether teardown completed
    #[must_use]
    pub fn cleaned_up(&self) -> bool {
        self.state == SessionState::CleanedUp
    }
}

/// `<workload>-verify-<yyyymmddHHMMSS>-<6 random chars>`
#[must_use]
pub fn temporary_instance_name(workload: &str, at: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-verify-{}-{}", workload, at.format("%Y%m%d%H%M%S"), suffix)
}
