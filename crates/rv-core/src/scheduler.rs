//! Execution planning
//!
//! Turns the discovered restore points and the optional tier definition into
//! an ordered list of groups. Groups run one after another; members of a
//! group run concurrently up to the configured cap. Every restore point ends
//! up in exactly one group.

use crate::config::GroupSpec;
use rv_api::RestorePoint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Workloads that recover together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGroup {
    /// Human readable name
    pub label: String,
    /// `None` for the trailing catch-all group
    pub order: Option<u32>,
    /// Restore points recovered together
    pub members: Vec<RestorePoint>,
}

impl ExecutionGroup {
    /// Member workload names
    #[must_use]
    pub fn workload_names(&self) -> Vec<&str> {
        self.members.iter().map(|rp| rp.workload.name.as_str()).collect()
    }
}

/// Ordered groups plus anything skipped while resolving them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePlan {
    /// Groups in execution order
    pub groups: Vec<ExecutionGroup>,
    /// Named workloads that could not be resolved
    pub warnings: Vec<String>,
}

impl SchedulePlan {
    /// Total number of scheduled restore points
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    /// Nothing scheduled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compute the execution plan
///
/// Without tiers the result is one group holding every restore point.
/// With tiers, groups follow ascending `order`; names that match no restore
/// point are skipped with a warning, a workload claimed by an earlier tier is
/// not scheduled again, and whatever no tier claimed forms a trailing group.
#[must_use]
pub fn plan(restore_points: &[RestorePoint], tiers: &[GroupSpec]) -> SchedulePlan {
    if tiers.is_empty() {
        if restore_points.is_empty() {
            return SchedulePlan::default();
        }
        return SchedulePlan {
            groups: vec![ExecutionGroup {
                label: "all".into(),
                order: None,
                members: restore_points.to_vec(),
            }],
            warnings: Vec::new(),
        };
    }

    let mut tiers: Vec<&GroupSpec> = tiers.iter().collect();
    tiers.sort_by_key(|t| t.order);

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();
    let mut warnings = Vec::new();

    for tier in tiers {
        let mut members = Vec::new();
        for name in &tier.workloads {
            let Some(rp) = restore_points
                .iter()
                .find(|rp| rp.workload.name.eq_ignore_ascii_case(name))
            else {
                warnings.push(format!(
                    "group {}: workload {name} has no discovered restore point; skipped",
                    tier.order
                ));
                continue;
            };
            if !claimed.insert(rp.id.as_str()) {
                warnings.push(format!(
                    "group {}: workload {name} already scheduled; ignored",
                    tier.order
                ));
                continue;
            }
            members.push(rp.clone());
        }
        if !members.is_empty() {
            groups.push(ExecutionGroup {
                label: format!("group-{}", tier.order),
                order: Some(tier.order),
                members,
            });
        }
    }

    let rest: Vec<RestorePoint> = restore_points
        .iter()
        .filter(|rp| !claimed.contains(rp.id.as_str()))
        .cloned()
        .collect();
    if !rest.is_empty() {
        groups.push(ExecutionGroup {
            label: "ungrouped".into(),
            order: None,
            members: rest,
        });
    }

    for w in &warnings {
        tracing::warn!("{}", w);
    }
    tracing::info!(
        "Planned {} group(s): {}",
        groups.len(),
        groups
            .iter()
            .map(|g| format!("{}={}", g.label, g.members.len()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    SchedulePlan { groups, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use rv_api::{Consistency, Workload};

    fn rp(name: &str) -> RestorePoint {
        RestorePoint {
            id: format!("rp-{name}"),
            workload: Workload {
                id: format!("w-{name}"),
                name: name.into(),
                job_id: "j".into(),
                cluster: None,
                os_hint: None,
            },
            created_at: Utc::now(),
            consistency: Consistency::ApplicationConsistent,
            size_bytes: None,
            job_name: "nightly".into(),
        }
    }

    fn tier(order: u32, names: &[&str]) -> GroupSpec {
        GroupSpec {
            order,
            workloads: names.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn no_tiers_means_one_group() {
        let points = vec![rp("a"), rp("b"), rp("c")];
        let plan = plan(&points, &[]);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].workload_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn tiers_sorted_with_trailing_group() {
        let points = vec![rp("db01"), rp("app01"), rp("web01"), rp("misc")];
        let plan = plan(
            &points,
            &[tier(2, &["APP01", "web01"]), tier(1, &["db01"])],
        );
        let labels: Vec<&str> = plan.groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["group-1", "group-2", "ungrouped"]);
        assert_eq!(plan.groups[2].workload_names(), vec!["misc"]);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn unknown_and_duplicate_names_warn() {
        let points = vec![rp("db01"), rp("app01")];
        let plan = plan(
            &points,
            &[tier(1, &["db01", "ghost"]), tier(2, &["db01", "app01"])],
        );
        assert_eq!(plan.warnings.len(), 2);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.groups.len(), 2);
    }

    #[test]
    fn tier_with_only_missing_workloads_is_dropped() {
        let points = vec![rp("a")];
        let plan = plan(&points, &[tier(1, &["ghost"])]);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].label, "ungrouped");
    }
}
