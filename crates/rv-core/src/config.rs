//! Run configuration
//!
//! Loaded from TOML. Every field has a default so a minimal file only names
//! the isolated network:
//!
//! ```toml
//! isolated_network = "verify-vlan-999"
//! strategy = "instant_recovery"
//! max_concurrent_vms = 3
//!
//! [scope]
//! jobs = ["SQL*"]
//!
//! [[groups]]
//! order = 1
//! workloads = ["DB01"]
//!
//! [tests]
//! ping = true
//! ports = [1433]
//! ```

use crate::error::RunError;
use crate::types::RecoveryStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which jobs and workloads a run covers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    /// Job name patterns; empty means all jobs
    pub jobs: Vec<String>,
    /// Workload name patterns; empty means all workloads
    pub workloads: Vec<String>,
}

/// One explicit recovery tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Tiers run in ascending order
    pub order: u32,
    /// Workload names in this tier
    pub workloads: Vec<String>,
}

/// Verification battery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// ICMP reachability
    pub ping: bool,
    /// TCP ports that must accept connections
    pub ports: Vec<u16>,
    /// Name resolution of the workload name
    pub dns: bool,
    /// URLs expected to answer 2xx/3xx; `{ip}` is replaced by the address
    pub urls: Vec<String>,
    /// How long to wait for power-on and heartbeat
    pub boot_timeout_secs: u64,
    /// How long to wait for an address
    pub address_timeout_secs: u64,
    /// Timeout of each individual probe
    pub probe_timeout_secs: u64,
}

impl TestConfig {
    /// Boot wait
    #[inline]
    #[must_use]
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Address wait
    #[inline]
    #[must_use]
    pub fn address_timeout(&self) -> Duration {
        Duration::from_secs(self.address_timeout_secs)
    }

    /// Single probe timeout
    #[inline]
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            ping: true,
            ports: Vec::new(),
            dns: false,
            urls: Vec::new(),
            boot_timeout_secs: 300,
            address_timeout_secs: 300,
            probe_timeout_secs: 10,
        }
    }
}

/// Bounded waits, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Wait for a mounted instance to appear in inventory
    pub discovery_secs: u64,
    /// Wait for power state confirmation
    pub power_secs: u64,
    /// Wait for a full-copy restore job
    pub restore_job_secs: u64,
    /// Delay between poll iterations
    pub poll_interval_secs: u64,
    /// Ceiling for one workload's recovery and verification
    pub workload_secs: u64,
    /// Wait for the instance to leave inventory after cleanup
    pub cleanup_grace_secs: u64,
}

impl Timeouts {
    /// Discovery wait
    #[inline]
    #[must_use]
    pub fn discovery(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }

    /// Power confirmation wait
    #[inline]
    #[must_use]
    pub fn power(&self) -> Duration {
        Duration::from_secs(self.power_secs)
    }

    /// Restore job wait
    #[inline]
    #[must_use]
    pub fn restore_job(&self) -> Duration {
        Duration::from_secs(self.restore_job_secs)
    }

    /// Poll interval
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Workload ceiling
    #[inline]
    #[must_use]
    pub fn workload(&self) -> Duration {
        Duration::from_secs(self.workload_secs)
    }

    /// Cleanup grace
    #[inline]
    #[must_use]
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery_secs: 300,
            power_secs: 120,
            restore_job_secs: 3600,
            poll_interval_secs: 10,
            workload_secs: 7200,
            cleanup_grace_secs: 60,
        }
    }
}

/// Everything one run needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Which jobs and workloads to verify
    pub scope: Scope,
    /// How workloads are recovered
    pub strategy: RecoveryStrategy,
    /// Recoveries in flight at once within a group
    pub max_concurrent_vms: usize,
    /// Restore points older than this raise an advisory
    pub max_restore_point_age_days: u32,
    /// Name of the verification network in hypervisor inventory
    pub isolated_network: String,
    /// Cluster to restore into; falls back to the restore point's hint
    pub target_cluster: Option<String>,
    /// Storage target name, required for full restores
    pub storage_target: Option<String>,
    /// Target recovery time per workload
    pub rto_target_minutes: Option<u32>,
    /// Whether this run was started by a scheduler rather than a person
    pub automated: bool,
    /// Explicit recovery tiers; empty means one group
    pub groups: Vec<GroupSpec>,
    /// Verification battery settings
    pub tests: TestConfig,
    /// Bounds on every wait
    pub timeouts: Timeouts,
}

impl RunConfig {
    /// Create default configuration for an isolated network
    #[inline]
    #[must_use]
    pub fn new(isolated_network: impl Into<String>) -> Self {
        Self {
            isolated_network: isolated_network.into(),
            ..Self::default()
        }
    }

    /// With strategy
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// With concurrency cap
    #[inline]
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_vms = max;
        self
    }

    /// With verification battery
    #[inline]
    #[must_use]
    pub fn with_tests(mut self, tests: TestConfig) -> Self {
        self.tests = tests;
        self
    }

    /// Parse TOML
    ///
    /// # Errors
    /// `RunError::Config` on syntax or type errors
    pub fn from_toml_str(text: &str) -> Result<Self, RunError> {
        toml::from_str(text).map_err(|e| RunError::Config(e.to_string()))
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// `RunError::Config` when the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, RunError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject invalid settings before any side effect
    ///
    /// # Errors
    /// `RunError::Config` naming the first offending field
    pub fn validate(&self) -> Result<(), RunError> {
        let fail = |msg: String| Err(RunError::Config(msg));

        if self.max_concurrent_vms == 0 {
            return fail("max_concurrent_vms must be at least 1".into());
        }
        if self.isolated_network.trim().is_empty() {
            return fail("isolated_network must name a network".into());
        }
        if self.strategy == RecoveryStrategy::FullRestore
            && self.storage_target.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return fail("storage_target is required for full_restore".into());
        }
        if self.rto_target_minutes == Some(0) {
            return fail("rto_target_minutes must be positive when set".into());
        }
        if self.tests.ports.contains(&0) {
            return fail("tests.ports must not contain port 0".into());
        }
        if let Some(bad) = self.tests.urls.iter().find(|u| !looks_like_url(u)) {
            return fail(format!("tests.urls entry `{bad}` is not an http(s) URL"));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("timeouts.discovery_secs", t.discovery_secs),
            ("timeouts.power_secs", t.power_secs),
            ("timeouts.restore_job_secs", t.restore_job_secs),
            ("timeouts.poll_interval_secs", t.poll_interval_secs),
            ("timeouts.workload_secs", t.workload_secs),
            ("tests.address_timeout_secs", self.tests.address_timeout_secs),
            ("tests.boot_timeout_secs", self.tests.boot_timeout_secs),
            ("tests.probe_timeout_secs", self.tests.probe_timeout_secs),
        ] {
            if value == 0 {
                return fail(format!("{name} must be positive"));
            }
        }

        let mut orders: Vec<u32> = self.groups.iter().map(|g| g.order).collect();
        orders.sort_unstable();
        if orders.windows(2).any(|w| w[0] == w[1]) {
            return fail("groups must have distinct order values".into());
        }

        Ok(())
    }

    /// RTO target as a duration
    #[must_use]
    pub fn rto_target(&self) -> Option<Duration> {
        self.rto_target_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            strategy: RecoveryStrategy::InstantRecovery,
            max_concurrent_vms: 3,
            max_restore_point_age_days: 7,
            isolated_network: String::new(),
            target_cluster: None,
            storage_target: None,
            rto_target_minutes: None,
            automated: false,
            groups: Vec::new(),
            tests: TestConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

fn looks_like_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    rest.is_some_and(|r| !r.is_empty())
}
