//! Preflight validation
//!
//! Every check runs independently and contributes zero or more issues; the
//! report merges them all. Blocking issues cancel the run before any
//! recovery is submitted, advisories are surfaced and never block.

use crate::types::{IsolatedNetwork, RecoveryStrategy};
use chrono::{DateTime, Utc};
use regex::Regex;
use rv_api::{
    ApiError, BackupJob, Cluster, ClusterHealth, Consistency, JobResult, JobRunState, RestorePoint,
    StorageTarget,
};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Concurrent recoveries one cluster node is assumed to absorb
pub const RECOVERIES_PER_NODE: u32 = 3;

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Stops the run before any recovery
    Blocking,
    /// Reported, never blocks
    Advisory,
}

/// Which check raised an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightCheck {
    /// Control plane cluster health
    ClusterHealth,
    /// Concurrency against cluster size
    Capacity,
    /// Verification network identity and naming
    IsolatedNetwork,
    /// Crash-consistent restore points
    Consistency,
    /// Restore point age
    Recency,
    /// Backup job activity and last result
    JobState,
    /// Storage target for full-copy restores
    StorageTarget,
    /// Recovery control endpoint reachability
    RecoveryEndpoint,
}

/// One finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightIssue {
    /// Check that raised it
    pub check: PreflightCheck,
    /// Blocking or advisory
    pub severity: Severity,
    /// What the issue is about: cluster, network, workload or job name
    pub subject: String,
    /// Human readable explanation
    pub message: String,
}

impl PreflightIssue {
    fn blocking(check: PreflightCheck, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check,
            severity: Severity::Blocking,
            subject: subject.into(),
            message: message.into(),
        }
    }

    fn advisory(check: PreflightCheck, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check,
            severity: Severity::Advisory,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Merged preflight outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Issues that stop the run
    pub blocking: Vec<PreflightIssue>,
    /// Issues that are only reported
    pub advisory: Vec<PreflightIssue>,
}

impl PreflightReport {
    /// Zero blocking issues
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.blocking.is_empty()
    }

    /// One line per blocking issue, `; `-joined
    #[must_use]
    pub fn blocking_summary(&self) -> String {
        self.blocking
            .iter()
            .map(|i| format!("{}: {}", i.subject, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn push(&mut self, issue: PreflightIssue) {
        match issue.severity {
            Severity::Blocking => self.blocking.push(issue),
            Severity::Advisory => self.advisory.push(issue),
        }
    }
}

/// Everything the checks look at, gathered by the engine beforehand
#[derive(Debug, Clone, Copy)]
pub struct PreflightInput<'a> {
    /// Cluster inventory
    pub clusters: &'a [Cluster],
    /// Cluster the run restores into, when configured
    pub target_cluster: Option<&'a str>,
    /// `None` when the configured network name did not resolve
    pub network: Option<&'a IsolatedNetwork>,
    /// Configured network name, for messages
    pub network_name: &'a str,
    /// Selected restore points
    pub restore_points: &'a [RestorePoint],
    /// Jobs in scope
    pub jobs: &'a [BackupJob],
    /// Configured concurrency cap
    pub max_concurrent: usize,
    /// Configured maximum restore point age
    pub max_age_days: u32,
    /// Selected strategy
    pub strategy: RecoveryStrategy,
    /// `None` when not configured or not found
    pub storage_target: Option<&'a StorageTarget>,
    /// Configured storage target name, for messages
    pub storage_target_name: Option<&'a str>,
    /// Outcome of the recovery endpoint probe
    pub recovery_probe: Result<(), &'a ApiError>,
    /// Reference time for recency
    pub now: DateTime<Utc>,
}

/// Run every check and merge the results
#[must_use]
pub fn validate(input: &PreflightInput<'_>) -> PreflightReport {
    let mut report = PreflightReport::default();
    let checks: [fn(&PreflightInput<'_>) -> Vec<PreflightIssue>; 8] = [
        check_cluster_health,
        check_capacity,
        check_network,
        check_consistency,
        check_recency,
        check_job_state,
        check_storage_target,
        check_recovery_endpoint,
    ];
    for check in checks {
        for issue in check(input) {
            report.push(issue);
        }
    }

    tracing::info!(
        "Preflight: {} blocking, {} advisory",
        report.blocking.len(),
        report.advisory.len()
    );
    for issue in &report.advisory {
        tracing::warn!("preflight advisory [{}] {}", issue.subject, issue.message);
    }
    for issue in &report.blocking {
        tracing::error!("preflight blocking [{}] {}", issue.subject, issue.message);
    }
    report
}

fn relevant_clusters<'a>(input: &PreflightInput<'a>) -> Vec<&'a Cluster> {
    match input.target_cluster {
        Some(name) => input
            .clusters
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(name) || c.id == name)
            .collect(),
        None => input.clusters.iter().collect(),
    }
}

fn check_cluster_health(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    use PreflightCheck::ClusterHealth as C;

    let clusters = relevant_clusters(input);
    if clusters.is_empty() {
        let subject = input.target_cluster.unwrap_or("clusters");
        return vec![PreflightIssue::advisory(C, subject, "no cluster found in hypervisor inventory")];
    }
    clusters
        .into_iter()
        .filter_map(|c| match c.health {
            ClusterHealth::Critical | ClusterHealth::Failed => Some(PreflightIssue::blocking(
                C,
                &c.name,
                format!("cluster health is {:?}", c.health),
            )),
            ClusterHealth::Degraded => Some(PreflightIssue::advisory(C, &c.name, "cluster health is degraded")),
            ClusterHealth::Unknown => Some(PreflightIssue::advisory(C, &c.name, "cluster health is unknown")),
            ClusterHealth::Healthy => None,
        })
        .collect()
}

fn check_capacity(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    let nodes: u32 = relevant_clusters(input).iter().map(|c| c.node_count).sum();
    let capacity = nodes.saturating_mul(RECOVERIES_PER_NODE) as usize;
    if input.max_concurrent > capacity {
        vec![PreflightIssue::advisory(
            PreflightCheck::Capacity,
            "max_concurrent_vms",
            format!(
                "{} concurrent recoveries exceed the estimated capacity of {capacity} ({nodes} node(s))",
                input.max_concurrent
            ),
        )]
    } else {
        Vec::new()
    }
}

fn production_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^|[^a-z0-9])(prod|production|prd)([^a-z0-9]|$)")
            .expect("production name regex is valid")
    })
}

/// Whether a network name reads like a production segment
#[must_use]
pub fn looks_like_production(name: &str) -> bool {
    production_name().is_match(name)
}

fn check_network(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    use PreflightCheck::IsolatedNetwork as C;

    let Some(network) = input.network.filter(|n| !n.id.trim().is_empty()) else {
        return vec![PreflightIssue::blocking(
            C,
            input.network_name,
            "isolated network not found in hypervisor inventory",
        )];
    };

    let mut issues = Vec::new();
    if network.segment_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
        issues.push(PreflightIssue::advisory(C, &network.name, "isolated network has no segment id"));
    }
    if looks_like_production(&network.name) {
        issues.push(PreflightIssue::advisory(
            C,
            &network.name,
            "isolated network name resembles a production network",
        ));
    }
    issues
}

fn check_consistency(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    input
        .restore_points
        .iter()
        .filter_map(|rp| {
            let message = match rp.consistency {
                Consistency::CrashConsistent => "restore point is crash-consistent",
                Consistency::Unknown => "restore point consistency is unknown",
                Consistency::ApplicationConsistent => return None,
            };
            Some(PreflightIssue::advisory(PreflightCheck::Consistency, &rp.workload.name, message))
        })
        .collect()
}

fn check_recency(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    let max_age = chrono::Duration::days(i64::from(input.max_age_days));
    input
        .restore_points
        .iter()
        .filter(|rp| rp.age_at(input.now) > max_age)
        .map(|rp| {
            PreflightIssue::advisory(
                PreflightCheck::Recency,
                &rp.workload.name,
                format!(
                    "latest restore point is {} day(s) old (limit {})",
                    rp.age_at(input.now).num_days(),
                    input.max_age_days
                ),
            )
        })
        .collect()
}

fn check_job_state(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();
    for job in input.jobs {
        if job.state == JobRunState::Running {
            issues.push(PreflightIssue::advisory(
                PreflightCheck::JobState,
                &job.name,
                "backup job is currently running",
            ));
        }
        if job.last_result == JobResult::Failed {
            issues.push(PreflightIssue::advisory(
                PreflightCheck::JobState,
                &job.name,
                "last backup job run failed",
            ));
        }
    }
    issues
}

fn check_storage_target(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    if input.strategy != RecoveryStrategy::FullRestore || input.storage_target.is_some() {
        return Vec::new();
    }
    let subject = input.storage_target_name.unwrap_or("storage_target");
    vec![PreflightIssue::blocking(
        PreflightCheck::StorageTarget,
        subject,
        "storage target not found in hypervisor inventory",
    )]
}

fn check_recovery_endpoint(input: &PreflightInput<'_>) -> Vec<PreflightIssue> {
    let Err(err) = input.recovery_probe else {
        return Vec::new();
    };
    let message = format!("recovery endpoint unreachable: {err}");
    let issue = if input.strategy.requires_recovery_endpoint() {
        PreflightIssue::blocking(PreflightCheck::RecoveryEndpoint, "recovery", message)
    } else {
        PreflightIssue::advisory(PreflightCheck::RecoveryEndpoint, "recovery", message)
    };
    vec![issue]
}
