//! Typed records exchanged with the remote control planes
//!
//! Vendor state strings are normalized into closed enumerations here and
//! nowhere else. Anything unrecognized or missing becomes an explicit
//! `Unknown` case rather than a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Backup job activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobRunState {
    /// Not running
    Idle,
    /// Currently running
    Running,
    /// Disabled by an operator
    Disabled,
    /// Unrecognized or missing
    Unknown,
}

impl JobRunState {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("idle" | "stopped" | "inactive") => Self::Idle,
            Some("running" | "working" | "starting" | "stopping") => Self::Running,
            Some("disabled") => Self::Disabled,
            _ => Self::Unknown,
        }
    }
}

/// Result of a backup job's last run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobResult {
    /// Last run succeeded
    Success,
    /// Last run finished with warnings
    Warning,
    /// Last run failed
    Failed,
    /// Never ran
    None,
    /// Unrecognized or missing
    Unknown,
}

impl JobResult {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("success" | "succeeded") => Self::Success,
            Some("warning") => Self::Warning,
            Some("failed" | "error" | "failure") => Self::Failed,
            Some("none" | "") => Self::None,
            _ => Self::Unknown,
        }
    }
}

/// Restore point consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consistency {
    /// Quiesced through guest application integration
    ApplicationConsistent,
    /// Disk state only
    CrashConsistent,
    /// Unrecognized or missing
    Unknown,
}

impl Consistency {
    /// Decode a vendor string or flag
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("applicationconsistent" | "appconsistent" | "application" | "true") => {
                Self::ApplicationConsistent
            }
            Some("crashconsistent" | "crash" | "false") => Self::CrashConsistent,
            _ => Self::Unknown,
        }
    }
}

/// Control plane cluster health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterHealth {
    /// Fully operational
    Healthy,
    /// Operational with reduced redundancy
    Degraded,
    /// Close to failing
    Critical,
    /// Not operational
    Failed,
    /// Unrecognized or missing
    Unknown,
}

impl ClusterHealth {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("healthy" | "ok" | "normal" | "good") => Self::Healthy,
            Some("degraded" | "warning") => Self::Degraded,
            Some("critical") => Self::Critical,
            Some("failed" | "down" | "error") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Instance power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    /// Powered on
    On,
    /// Powered off
    Off,
    /// Unrecognized or missing
    Unknown,
}

impl PowerState {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("on" | "poweredon" | "running") => Self::On,
            Some("off" | "poweredoff" | "stopped" | "shutdown") => Self::Off,
            _ => Self::Unknown,
        }
    }

    /// Wire representation sent in power requests
    #[inline]
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Guest agent heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeartbeatState {
    /// Guest agent reporting
    Ok,
    /// Guest agent silent
    Absent,
    /// Unrecognized or missing
    Unknown,
}

impl HeartbeatState {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("ok" | "green" | "running" | "true") => Self::Ok,
            Some("absent" | "red" | "notrunning" | "false") => Self::Absent,
            _ => Self::Unknown,
        }
    }
}

/// Async job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsyncJobState {
    /// Queued or in progress
    Running,
    /// Completed, see the result
    Finished,
    /// Stopped before completion
    Cancelled,
    /// Unrecognized or missing
    Unknown,
}

impl AsyncJobState {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("running" | "starting" | "working" | "queued" | "pending" | "waiting") => {
                Self::Running
            }
            Some("finished" | "completed" | "stopped") => Self::Finished,
            Some("cancelled" | "canceled" | "aborted") => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    /// Whether polling can stop
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Async job result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsyncJobResult {
    /// Completed successfully
    Success,
    /// Completed with warnings
    Warning,
    /// Failed
    Error,
    /// No result yet
    None,
    /// Unrecognized or missing
    Unknown,
}

impl AsyncJobResult {
    /// Decode a vendor string
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(normalize).as_deref() {
            Some("success" | "succeeded") => Self::Success,
            Some("warning") => Self::Warning,
            Some("error" | "failed" | "failure") => Self::Error,
            Some("none" | "") => Self::None,
            _ => Self::Unknown,
        }
    }
}

/// Backup job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Catalog id
    pub id: String,
    /// Display name
    pub name: String,
    /// Current activity
    pub state: JobRunState,
    /// Outcome of the last run
    pub last_result: JobResult,
}

/// Protected workload, read-only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Workload {
    /// Catalog id
    pub id: String,
    /// Display name
    pub name: String,
    /// Job that protects it
    pub job_id: String,
    /// Host cluster
    pub cluster: Option<String>,
    /// Guest OS hint
    pub os_hint: Option<String>,
}

/// Immutable recoverable state of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePoint {
    /// Catalog id
    pub id: String,
    /// Workload it restores
    pub workload: Workload,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Application or crash consistency
    pub consistency: Consistency,
    /// Approximate size
    pub size_bytes: Option<u64>,
    /// Job that produced it
    pub job_name: String,
}

impl RestorePoint {
    /// Age at `now`
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Hypervisor cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Inventory id
    pub id: String,
    /// Display name
    pub name: String,
    /// Reported health
    pub health: ClusterHealth,
    /// Hosts in the cluster
    pub node_count: u32,
}

/// Network segment known to the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network {
    /// Inventory id
    pub id: String,
    /// Display name
    pub name: String,
    /// VLAN or segment identifier
    pub segment_id: Option<String>,
}

/// Storage target for full-copy restores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTarget {
    /// Inventory id
    pub id: String,
    /// Display name
    pub name: String,
    /// Cluster it belongs to
    pub cluster_id: Option<String>,
    /// Free capacity
    pub free_bytes: Option<u64>,
}

/// Instance as seen in hypervisor inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Inventory id
    pub id: String,
    /// Display name
    pub name: String,
    /// Current power state
    pub power: PowerState,
    /// Guest agent heartbeat
    pub heartbeat: HeartbeatState,
    /// Network ids every adapter is attached to
    pub networks: Vec<String>,
    /// Guest reported addresses
    pub addresses: Vec<IpAddr>,
}

impl Instance {
    /// Every adapter sits on `network_id` (vacuously true without adapters)
    #[must_use]
    pub fn attached_only_to(&self, network_id: &str) -> bool {
        self.networks.iter().all(|n| n == network_id)
    }

    /// Preferred address for probing, IPv4 first
    #[must_use]
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4() && !a.is_loopback() && !a.is_unspecified())
            .or_else(|| {
                self.addresses
                    .iter()
                    .find(|a| !a.is_loopback() && !a.is_unspecified())
            })
            .copied()
    }
}

/// Handle for a running mount-based recovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountHandle {
    /// Recovery session id on the backup side
    pub session_id: String,
}

/// Network adapter recorded in restore point metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// MAC address, when recorded
    pub mac_address: Option<String>,
    /// Original network
    pub network_id: String,
}

/// Disk recorded in restore point metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Disk id
    pub id: String,
    /// Provisioned size
    pub size_bytes: Option<u64>,
}

/// Restore point metadata needed by full-copy restores
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestorePointMetadata {
    /// Network adapters of the source
    pub adapters: Vec<AdapterInfo>,
    /// Disks of the source
    pub disks: Vec<DiskInfo>,
    /// Cluster the source ran on
    pub cluster_hint: Option<String>,
}

/// One entry of a network remap table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMapping {
    /// Network in the restore point
    pub source_network_id: String,
    /// Network to attach instead
    pub target_network_id: String,
}

/// Full-copy restore request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullRestoreRequest {
    /// Restore point to copy
    pub restore_point_id: String,
    /// Name of the new instance
    pub instance_name: String,
    /// Cluster to place it on
    pub cluster_id: Option<String>,
    /// Where the disks are copied
    pub storage_target_id: String,
    /// Remap applied at creation
    pub network_mappings: Vec<NetworkMapping>,
    /// Start the instance once restored
    pub power_on_after_restore: bool,
}

/// Reference to an asynchronous job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AsyncJobRef {
    /// Job id
    pub id: String,
}

/// Polled status of an asynchronous job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncJobStatus {
    /// Lifecycle state
    pub state: AsyncJobState,
    /// Outcome, meaningful once finished
    pub result: AsyncJobResult,
    /// Vendor message, if any
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_strings_normalize() {
        assert_eq!(PowerState::from_wire(Some("PoweredOn")), PowerState::On);
        assert_eq!(PowerState::from_wire(Some("powered_off")), PowerState::Off);
        assert_eq!(PowerState::from_wire(Some("suspended")), PowerState::Unknown);
        assert_eq!(PowerState::from_wire(None), PowerState::Unknown);
        assert_eq!(AsyncJobState::from_wire(Some("Finished")), AsyncJobState::Finished);
        assert_eq!(AsyncJobResult::from_wire(Some("Success")), AsyncJobResult::Success);
        assert_eq!(ClusterHealth::from_wire(Some("CRITICAL")), ClusterHealth::Critical);
        assert_eq!(
            Consistency::from_wire(Some("Crash-Consistent")),
            Consistency::CrashConsistent
        );
        assert_eq!(JobResult::from_wire(Some("Failed")), JobResult::Failed);
    }

    #[test]
    fn missing_fields_are_unknown_not_default() {
        assert_eq!(ClusterHealth::from_wire(None), ClusterHealth::Unknown);
        assert_eq!(AsyncJobState::from_wire(None), AsyncJobState::Unknown);
        assert!(!AsyncJobState::Unknown.is_terminal());
        assert_eq!(HeartbeatState::from_wire(Some("")), HeartbeatState::Unknown);
    }

    #[test]
    fn instance_address_prefers_ipv4() {
        let inst = Instance {
            id: "1".into(),
            name: "vm".into(),
            power: PowerState::On,
            heartbeat: HeartbeatState::Ok,
            networks: vec!["iso".into()],
            addresses: vec![
                "fe80::1".parse().unwrap(),
                "127.0.0.1".parse().unwrap(),
                "10.0.0.5".parse().unwrap(),
            ],
        };
        assert_eq!(inst.primary_address(), Some("10.0.0.5".parse().unwrap()));
        assert!(inst.attached_only_to("iso"));
        assert!(!inst.attached_only_to("prod"));
    }
}
