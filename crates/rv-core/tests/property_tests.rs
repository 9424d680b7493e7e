use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use rv_api::{Consistency, RestorePoint, Workload};
use rv_core::catalog::discover;
use rv_core::scheduler::plan;
use rv_core::session::{allowed_transitions, validate_transition};
use rv_core::{GroupSpec, RunConfig, RunContext, Scope, SessionState};
use rv_test_utils::FakeLab;
use std::collections::HashSet;

fn point(i: usize) -> RestorePoint {
    RestorePoint {
        id: format!("rp-{i}"),
        workload: Workload {
            id: format!("w-{i}"),
            name: format!("VM{i:02}"),
            job_id: "job-1".into(),
            cluster: None,
            os_hint: None,
        },
        created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        consistency: Consistency::ApplicationConsistent,
        size_bytes: None,
        job_name: "Nightly".into(),
    }
}

fn any_state() -> impl Strategy<Value = SessionState> {
    prop::sample::select(SessionState::ALL.to_vec())
}

proptest! {
    #[test]
    fn prop_groups_partition_restore_points(
        count in 0usize..12,
        tiers in prop::collection::vec((0u32..5, prop::collection::vec(0usize..15, 0..6)), 0..4),
    ) {
        let points: Vec<RestorePoint> = (0..count).map(point).collect();
        let mut seen_orders = HashSet::new();
        let specs: Vec<GroupSpec> = tiers
            .into_iter()
            .filter(|(order, _)| seen_orders.insert(*order))
            .map(|(order, members)| GroupSpec {
                order,
                workloads: members.into_iter().map(|i| format!("vm{i:02}")).collect(),
            })
            .collect();

        let plan = plan(&points, &specs);

        let mut scheduled: Vec<&str> = plan
            .groups
            .iter()
            .flat_map(|g| g.members.iter().map(|rp| rp.id.as_str()))
            .collect();
        let total = scheduled.len();
        scheduled.sort_unstable();
        scheduled.dedup();
        prop_assert_eq!(scheduled.len(), total, "a restore point was scheduled twice");
        prop_assert_eq!(total, points.len(), "a restore point was dropped");
        prop_assert!(plan.groups.iter().all(|g| !g.members.is_empty()));

        let orders: Vec<u32> = plan.groups.iter().filter_map(|g| g.order).collect();
        let mut sorted = orders.clone();
        sorted.sort_unstable();
        prop_assert_eq!(orders, sorted);
    }

    #[test]
    fn prop_transitions_match_table(from in any_state(), to in any_state()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_terminal_states_are_final(to in any_state()) {
        prop_assert!(validate_transition(SessionState::CleanedUp, to).is_err());
        prop_assert!(validate_transition(SessionState::CleanupFailed, to).is_err());
    }
}

#[test]
fn every_active_state_can_reach_cleanup() {
    for state in SessionState::ALL.into_iter().filter(|s| s.is_active()) {
        assert!(validate_transition(state, SessionState::CleanedUp).is_ok(), "{state:?}");
        assert!(validate_transition(state, SessionState::CleanupFailed).is_ok(), "{state:?}");
    }
    assert!(validate_transition(SessionState::Pending, SessionState::CleanedUp).is_err());
}

#[tokio::test(start_paused = true)]
async fn discovery_is_idempotent() {
    let lab = FakeLab::new()
        .with_workload("Nightly", "DB01")
        .with_restore_point("DB01", ChronoDuration::days(3), Consistency::ApplicationConsistent)
        .with_restore_point("DB01", ChronoDuration::hours(2), Consistency::CrashConsistent)
        .with_restore_point("DB01", ChronoDuration::days(1), Consistency::ApplicationConsistent)
        .with_workload("Weekly", "APP01")
        .with_restore_point("APP01", ChronoDuration::days(6), Consistency::ApplicationConsistent)
        .with_workload("Weekly", "EMPTY01");
    let ctx = RunContext::new(RunConfig::new("verify-lab"), true);
    let scope = Scope::default();

    let first = discover(&lab, &scope, &ctx).await.unwrap();
    let second = discover(&lab, &scope, &ctx).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.restore_points.len(), 2);
    assert_eq!(first.known_workloads, 3);
    assert_eq!(first.skipped, vec!["EMPTY01".to_string()]);
    let db01 = first
        .restore_points
        .iter()
        .find(|rp| rp.workload.name == "DB01")
        .unwrap();
    assert_eq!(db01.consistency, Consistency::CrashConsistent);
}

#[tokio::test(start_paused = true)]
async fn scope_filters_jobs_and_workloads_case_insensitively() {
    let lab = FakeLab::new()
        .with_protected_workload("SQL Nightly", "DB01")
        .with_protected_workload("SQL Nightly", "DB02")
        .with_protected_workload("File Servers", "FS01");
    let ctx = RunContext::new(RunConfig::new("verify-lab"), true);
    let scope = Scope {
        jobs: vec!["sql*".into()],
        workloads: vec!["*01".into()],
    };

    let found = discover(&lab, &scope, &ctx).await.unwrap();

    let names: Vec<&str> = found.restore_points.iter().map(|rp| rp.workload.name.as_str()).collect();
    assert_eq!(names, vec!["DB01"]);
    assert_eq!(found.jobs.len(), 1);
}
