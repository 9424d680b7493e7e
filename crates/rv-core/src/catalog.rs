//! Restore point discovery
//!
//! Enumerates jobs in scope, their workloads, and picks the latest restore
//! point per workload. A workload without restore points is skipped with a
//! warning; only an empty scope fails the run.

use crate::config::Scope;
use crate::context::RunContext;
use crate::error::RunError;
use regex::Regex;
use rv_api::{BackupCatalogApi, BackupJob, RestorePoint, Workload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    /// Jobs that matched the scope
    pub jobs: Vec<BackupJob>,
    /// Latest restore point per workload, in discovery order
    pub restore_points: Vec<RestorePoint>,
    /// Workloads in scope, with or without restore points
    pub known_workloads: usize,
    /// Workload names skipped for lack of restore points
    pub skipped: Vec<String>,
}

/// Case-insensitive name filter with `*` wildcards
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    patterns: Vec<Regex>,
}

impl NameFilter {
    /// Build from patterns; an empty list matches everything
    ///
    /// # Errors
    /// Returns `RunError::Config` if a pattern cannot be compiled
    pub fn new(patterns: &[String]) -> Result<Self, RunError> {
        let patterns: Vec<Regex> = patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| {
                let glob = regex::escape(p).replace(r"\*", ".*");
                Regex::new(&format!("(?i)^{glob}$"))
                    .map_err(|e| RunError::Config(format!("invalid name filter {p:?}: {e}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// Check a name against the filter
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(name))
    }
}

/// Pick the most recent point; equal timestamps keep the greatest id
#[must_use]
pub fn latest(points: Vec<RestorePoint>) -> Option<RestorePoint> {
    points
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

/// Restore points gathered for one workload across every job that protects it
struct Candidates {
    workload: Workload,
    points: Vec<RestorePoint>,
    listing_failed: bool,
}

/// Discover the latest restore point of every workload in scope
///
/// A workload protected by several jobs is considered once, with the
/// restore points of all of them. Listing failures below the job level skip
/// what they affect with a warning.
///
/// # Errors
/// - `RunError::Config` when a scope pattern is invalid
/// - `RunError::NoJobs` when no job matches
/// - `RunError::NoRestorePoints` when jobs match but none has a restore point
/// - `RunError::Api` when the job list itself cannot be read
pub async fn discover(
    catalog: &dyn BackupCatalogApi,
    scope: &Scope,
    ctx: &RunContext,
) -> Result<Discovery, RunError> {
    let job_filter = NameFilter::new(&scope.jobs)?;
    let workload_filter = NameFilter::new(&scope.workloads)?;

    let jobs: Vec<BackupJob> = catalog
        .list_jobs()
        .await?
        .into_iter()
        .filter(|j| job_filter.matches(&j.name))
        .collect();
    if jobs.is_empty() {
        return Err(RunError::NoJobs);
    }
    tracing::info!("Discovering restore points across {} job(s)", jobs.len());

    let mut order: Vec<Candidates> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for job in &jobs {
        let workloads = match catalog.list_workloads(job).await {
            Ok(workloads) => workloads,
            Err(e) => {
                ctx.warn(format!("could not list workloads of job {}: {e}; job skipped", job.name));
                continue;
            }
        };

        for workload in workloads {
            if !workload_filter.matches(&workload.name) {
                continue;
            }
            let slot = *index.entry(workload.id.clone()).or_insert_with(|| {
                order.push(Candidates {
                    workload: workload.clone(),
                    points: Vec::new(),
                    listing_failed: false,
                });
                order.len() - 1
            });

            match catalog.list_restore_points(job, &workload).await {
                Ok(points) => order[slot].points.extend(points),
                Err(e) => {
                    ctx.warn(format!(
                        "could not list restore points of {} in job {}: {e}",
                        workload.name, job.name
                    ));
                    order[slot].listing_failed = true;
                }
            }
        }
    }

    let known_workloads = order.len();
    let mut restore_points = Vec::new();
    let mut skipped = Vec::new();

    for candidates in order {
        let name = candidates.workload.name;
        match latest(candidates.points) {
            Some(rp) => {
                tracing::debug!("{}: latest restore point {} at {}", name, rp.id, rp.created_at);
                ctx.record_for(
                    &name,
                    "catalog.selected",
                    format!("{} {}", rp.id, rp.created_at.to_rfc3339()),
                );
                restore_points.push(rp);
            }
            None if candidates.listing_failed => {
                ctx.warn(format!("restore points of {name} unavailable; skipped"));
                skipped.push(name);
            }
            None => {
                ctx.warn(format!("workload {name} has no restore points; skipped"));
                skipped.push(name);
            }
        }
    }

    if restore_points.is_empty() {
        return Err(RunError::NoRestorePoints { jobs: jobs.len() });
    }

    Ok(Discovery {
        jobs,
        restore_points,
        known_workloads,
        skipped,
    })
}
