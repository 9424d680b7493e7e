//! Core types for the verification engine
//!
//! Defines the fundamental types shared by every stage:
//! - run and session identifiers
//! - recovery strategy selection
//! - the resolved isolated network
//! - verification results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

pub use rv_api::{RestorePoint, Workload};

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique recovery session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a workload is brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Mount the restore point and run it from backup storage.
    ///
    /// The mount cannot target a network, so the instance is rewired while
    /// powered off before it is ever started.
    InstantRecovery,
    /// Copy disks to a storage target with a network remap applied at
    /// creation time.
    FullRestore,
}

impl RecoveryStrategy {
    /// Recovery control operations the strategy drives
    #[must_use]
    pub fn recovery_operations(self) -> &'static [&'static str] {
        match self {
            Self::InstantRecovery => &["start_instant_recovery", "stop_instant_recovery"],
            Self::FullRestore => &["restore_point_metadata", "submit_full_restore", "job_status"],
        }
    }

    /// Whether the recovery control endpoint must be reachable
    #[inline]
    #[must_use]
    pub fn requires_recovery_endpoint(self) -> bool {
        !self.recovery_operations().is_empty()
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstantRecovery => f.write_str("instant-recovery"),
            Self::FullRestore => f.write_str("full-restore"),
        }
    }
}

/// Verification network, resolved once per run and shared read-only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolatedNetwork {
    /// Inventory id
    pub id: String,
    /// VLAN or segment identifier, if reported
    pub segment_id: Option<String>,
    /// Display name
    pub name: String,
}

impl From<rv_api::Network> for IsolatedNetwork {
    fn from(n: rv_api::Network) -> Self {
        Self {
            id: n.id,
            segment_id: n.segment_id,
            name: n.name,
        }
    }
}

/// Verification test category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    /// Power state and guest heartbeat
    Heartbeat,
    /// Address assignment
    Network,
    /// ICMP reachability
    Ping,
    /// TCP connect
    Port,
    /// Name resolution
    Dns,
    /// HTTP status check
    Http,
    /// User supplied probe
    Custom,
}

/// One executed test, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Catalog id of the workload
    pub workload_id: String,
    /// Display name of the workload
    pub workload_name: String,
    /// Kind of test
    pub category: TestCategory,
    /// Test name, e.g. `TCP Port 443`
    pub name: String,
    /// Outcome
    pub passed: bool,
    /// What was observed
    pub detail: String,
    /// Time spent, serialized as milliseconds
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// When it finished
    pub timestamp: DateTime<Utc>,
}

impl VerificationResult {
    /// Record a test outcome for `workload`
    #[must_use]
    pub fn new(
        workload: &Workload,
        category: TestCategory,
        name: impl Into<String>,
        passed: bool,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            workload_id: workload.id.clone(),
            workload_name: workload.name.clone(),
            category,
            name: name.into(),
            passed,
            detail: detail.into(),
            duration,
            timestamp: Utc::now(),
        }
    }
}

/// Serialize `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    /// Deserialize
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|o| o.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_endpoint_dependency() {
        assert!(RecoveryStrategy::FullRestore.requires_recovery_endpoint());
        assert!(RecoveryStrategy::InstantRecovery.requires_recovery_endpoint());
        assert!(RecoveryStrategy::InstantRecovery
            .recovery_operations()
            .contains(&"stop_instant_recovery"));
    }

    #[test]
    fn result_serializes_duration_as_millis() {
        let w = Workload {
            id: "w1".into(),
            name: "DB01".into(),
            job_id: "j1".into(),
            cluster: None,
            os_hint: None,
        };
        let r = VerificationResult::new(
            &w,
            TestCategory::Port,
            "TCP 1433",
            true,
            "open",
            Duration::from_millis(42),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["duration"], 42);
        assert_eq!(v["category"], "port");
    }
}
