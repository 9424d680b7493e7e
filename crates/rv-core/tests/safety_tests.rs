//! Network isolation and teardown guarantees under injected failures.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rv_api::{JobResult, JobRunState, Workload};
use rv_core::{CustomProbe, RecoveryStrategy, RunSummary, SessionState, TestCategory};
use rv_test_utils::{
    engine, lab_config, lab_with_workloads, Fault, FakeLab, FakeProbe, ISOLATED_NETWORK,
    PROD_NETWORK,
};
use std::net::IpAddr;
use std::sync::Arc;

async fn run_instant(lab: &Arc<FakeLab>) -> RunSummary {
    let probe = Arc::new(FakeProbe::new());
    engine(lab, &probe)
        .run(lab_config(RecoveryStrategy::InstantRecovery))
        .await
        .unwrap()
}

async fn run_full(lab: &Arc<FakeLab>) -> RunSummary {
    let probe = Arc::new(FakeProbe::new());
    engine(lab, &probe)
        .run(lab_config(RecoveryStrategy::FullRestore))
        .await
        .unwrap()
}

fn cleanup_events(summary: &RunSummary, workload: &str) -> usize {
    summary
        .journal
        .iter()
        .filter(|e| {
            e.workload == workload
                && (e.action == "cleanup.finished" || e.action == "cleanup.failed")
        })
        .count()
}

#[tokio::test(start_paused = true)]
async fn mount_is_released_for_every_failure_point() {
    let cases: &[&[Fault]] = &[
        &[Fault::InstanceNeverAppears],
        &[Fault::BootsPoweredOn, Fault::PowerOffIgnored],
        &[Fault::BootsPoweredOn, Fault::PowerOffFails],
        &[Fault::RewriteFails],
        &[Fault::RewriteIgnored],
        &[Fault::PanicOnRewrite],
        &[Fault::PowerOnIgnored],
    ];

    for faults in cases {
        let lab = faults
            .iter()
            .fold(FakeLab::new().with_protected_workload("Nightly", "DB01"), |lab, f| {
                lab.with_fault("DB01", *f)
            });
        let lab = Arc::new(lab);

        let summary = run_instant(&lab).await;

        let report = summary.workload("DB01").unwrap();
        assert!(!report.passed, "{faults:?}");
        assert!(report.error.is_some(), "{faults:?}");
        assert!(lab.mounts_released("DB01"), "{faults:?}: mount left running");
        assert_eq!(lab.mount_stop_calls("DB01"), 1, "{faults:?}");
        assert!(lab.live_instances().is_empty(), "{faults:?}");
        assert_eq!(cleanup_events(&summary, "DB01"), 1, "{faults:?}");
        assert_eq!(report.state, SessionState::CleanedUp, "{faults:?}");
        assert_eq!(report.tests_run, 0, "{faults:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn never_powered_on_outside_the_isolated_network() {
    for fault in [
        Fault::RewriteFails,
        Fault::RewriteIgnored,
        Fault::PowerOffIgnored,
        Fault::PowerOffFails,
    ] {
        let lab = Arc::new(
            lab_with_workloads(2)
                .with_global_fault(Fault::BootsPoweredOn)
                .with_fault("VM02", fault),
        );

        let summary = run_instant(&lab).await;

        assert!(lab.unsafe_power_ons().is_empty(), "{fault:?}: {:?}", lab.unsafe_power_ons());
        assert!(summary.workload("VM01").unwrap().passed, "{fault:?}");
        assert!(!summary.workload("VM02").unwrap().passed, "{fault:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn isolated_network_as_source_is_refused() {
    let lab = Arc::new(
        FakeLab::new()
            .with_protected_workload("Nightly", "LAB01")
            .with_source_networks("LAB01", &[ISOLATED_NETWORK]),
    );

    let summary = run_instant(&lab).await;

    let report = summary.workload("LAB01").unwrap();
    assert!(report.error.as_deref().unwrap().contains("original network"));
    assert!(lab.mounts_released("LAB01"));
}

#[tokio::test(start_paused = true)]
async fn failed_mount_stop_is_retried_by_cleanup() {
    let lab = Arc::new(
        FakeLab::new()
            .with_protected_workload("Nightly", "DB01")
            .with_fault("DB01", Fault::RewriteFails)
            .with_fault("DB01", Fault::StopMountFails),
    );

    let summary = run_instant(&lab).await;

    let report = summary.workload("DB01").unwrap();
    assert_eq!(lab.mount_stop_calls("DB01"), 2);
    assert_eq!(report.state, SessionState::CleanupFailed);
    let cleanup = report.cleanup.as_ref().unwrap();
    assert!(!cleanup.succeeded);
    assert!(cleanup.forced);
    // Forced removal still took the instance down
    assert!(lab.live_instances().is_empty());
    assert_eq!(summary.cleanup_failures, 1);
    assert!(summary.warnings.iter().any(|w| w.contains("failed cleanup")));
}

#[tokio::test(start_paused = true)]
async fn leftover_instance_is_forced_out_after_grace() {
    let lab = Arc::new(
        FakeLab::new()
            .with_protected_workload("Nightly", "DB01")
            .with_fault("DB01", Fault::StopMountLeavesInstance),
    );

    let summary = run_instant(&lab).await;

    let report = summary.workload("DB01").unwrap();
    assert!(report.passed);
    assert_eq!(report.state, SessionState::CleanedUp);
    let cleanup = report.cleanup.as_ref().unwrap();
    assert!(cleanup.succeeded);
    assert!(cleanup.forced);
    assert_eq!(lab.delete_calls("DB01"), 1);
    assert!(lab.live_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_restore_is_isolated_from_first_sight() {
    let lab = Arc::new(
        lab_with_workloads(2).with_source_networks("VM02", &[PROD_NETWORK, "net-backup"]),
    );

    let summary = run_full(&lab).await;

    assert!(summary.overall_success);
    for name in ["VM01", "VM02"] {
        let seen = lab.observed_attachments(name);
        assert!(!seen.is_empty(), "{name}");
        for networks in &seen {
            assert!(
                networks.iter().all(|n| n == ISOLATED_NETWORK),
                "{name} seen on {networks:?}"
            );
        }
        assert_eq!(lab.delete_calls(name), 1);
    }
    assert!(lab.unsafe_power_ons().is_empty());
    assert!(lab.live_instances().is_empty());

    let requests = lab.restore_requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert!(!request.power_on_after_restore);
        assert_eq!(request.storage_target_id, "st-1");
        assert!(request
            .network_mappings
            .iter()
            .all(|m| m.target_network_id == ISOLATED_NETWORK));
    }
    let vm02 = requests
        .iter()
        .find(|r| r.instance_name.starts_with("VM02-verify-"))
        .unwrap();
    assert_eq!(vm02.network_mappings.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn ignored_remap_is_caught_before_power_on() {
    let lab = Arc::new(
        FakeLab::new()
            .with_restore_job_polls(5)
            .with_protected_workload("Nightly", "DB01")
            .with_fault("DB01", Fault::RestoreIgnoresRemap),
    );

    let summary = run_full(&lab).await;

    let report = summary.workload("DB01").unwrap();
    assert!(report.error.as_deref().unwrap().contains("non-isolated"));
    assert_eq!(report.tests_run, 0);
    assert!(lab.unsafe_power_ons().is_empty());
    assert_eq!(lab.delete_calls("DB01"), 1);
    assert!(lab.live_instances().is_empty());
    assert_eq!(report.state, SessionState::CleanedUp);
}

#[tokio::test(start_paused = true)]
async fn restore_job_failures_still_clean_up() {
    for fault in [Fault::RestoreJobFails, Fault::RestoreJobHangs] {
        let lab = Arc::new(
            FakeLab::new()
                .with_protected_workload("Nightly", "DB01")
                .with_fault("DB01", fault),
        );

        let summary = run_full(&lab).await;

        let report = summary.workload("DB01").unwrap();
        assert!(!report.recovered, "{fault:?}");
        assert_eq!(report.state, SessionState::CleanedUp, "{fault:?}");
        assert_eq!(cleanup_events(&summary, "DB01"), 1, "{fault:?}");
        let error = report.error.as_deref().unwrap();
        let abandoned = report.cleanup.as_ref().unwrap().abandoned_job.clone();
        match fault {
            Fault::RestoreJobFails => {
                assert!(error.contains("injected restore failure"), "{error}");
                assert_eq!(abandoned, None);
            }
            _ => {
                assert!(error.contains("still running"), "{error}");
                let job = abandoned.unwrap();
                assert!(summary.warnings.iter().any(|w| w.contains(&job)));
                assert!(summary
                    .journal
                    .iter()
                    .any(|e| e.action == "restore.abandoned" && e.detail == job));
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn restore_job_cut_off_by_ceiling_is_reported() {
    let lab = Arc::new(
        FakeLab::new()
            .with_restore_job_polls(100)
            .with_protected_workload("Nightly", "DB01"),
    );
    let probe = Arc::new(FakeProbe::new());
    let mut config = lab_config(RecoveryStrategy::FullRestore);
    config.timeouts.workload_secs = 40;

    let summary = engine(&lab, &probe).run(config).await.unwrap();

    let report = summary.workload("DB01").unwrap();
    assert!(report.error.as_deref().unwrap().contains("ceiling"));
    assert_eq!(report.state, SessionState::CleanedUp);
    let job = report.cleanup.as_ref().unwrap().abandoned_job.clone().unwrap();
    assert!(summary.warnings.iter().any(|w| w.contains(&job) && w.contains("DB01")));
}

#[tokio::test(start_paused = true)]
async fn undeletable_instance_is_reported_not_raised() {
    let lab = Arc::new(lab_with_workloads(2).with_fault("VM01", Fault::DeleteFails));

    let summary = run_full(&lab).await;

    let vm01 = summary.workload("VM01").unwrap();
    assert!(vm01.passed);
    assert_eq!(vm01.state, SessionState::CleanupFailed);
    assert_eq!(summary.workload("VM02").unwrap().state, SessionState::CleanedUp);
    assert_eq!(summary.cleanup_failures, 1);
    assert_eq!(lab.live_instances().len(), 1);
    assert!(summary.overall_success);
}

#[tokio::test(start_paused = true)]
async fn workload_ceiling_fails_one_workload_and_keeps_partial_results() {
    let lab = Arc::new(lab_with_workloads(2).with_fault("VM02", Fault::NoAddress));
    let probe = Arc::new(FakeProbe::new());
    let mut config = lab_config(RecoveryStrategy::InstantRecovery);
    config.timeouts.workload_secs = 40;

    let summary = engine(&lab, &probe).run(config).await.unwrap();

    let vm02 = summary.workload("VM02").unwrap();
    assert!(vm02.error.as_deref().unwrap().contains("ceiling"));
    assert_eq!(vm02.state, SessionState::CleanedUp);
    let partial = summary.results_for("VM02");
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].category, TestCategory::Heartbeat);
    assert!(summary.workload("VM01").unwrap().passed);
    assert!(lab.mounts_released("VM02"));
}

#[tokio::test(start_paused = true)]
async fn busy_job_and_degraded_inputs_only_warn() {
    let lab = Arc::new(
        FakeLab::new()
            .with_job("Nightly", JobRunState::Running, JobResult::Failed)
            .with_protected_workload("Nightly", "DB01"),
    );

    let summary = run_instant(&lab).await;

    assert!(summary.preflight.passed());
    assert_eq!(summary.preflight.advisory.len(), 2);
    assert!(summary.overall_success);
}

struct AppProbe {
    panic: bool,
}

#[async_trait]
impl CustomProbe for AppProbe {
    fn name(&self) -> &str {
        "Application Health"
    }

    async fn check(&self, workload: &Workload, address: IpAddr) -> anyhow::Result<String> {
        if self.panic {
            panic!("probe crashed on {}", workload.name);
        }
        Ok(format!("{} healthy at {address}", workload.name))
    }
}

#[tokio::test(start_paused = true)]
async fn custom_probe_runs_last_and_panics_are_contained() {
    for panic in [false, true] {
        let lab = Arc::new(lab_with_workloads(1));
        let probe = Arc::new(FakeProbe::new());
        let summary = engine(&lab, &probe)
            .with_custom_probe(Arc::new(AppProbe { panic }))
            .run(lab_config(RecoveryStrategy::InstantRecovery))
            .await
            .unwrap();

        let results = summary.results_for("VM01");
        let last = results.last().unwrap();
        assert_eq!(last.category, TestCategory::Custom);
        assert_eq!(last.name, "Application Health");
        assert_eq!(last.passed, !panic);
        if panic {
            assert!(last.detail.contains("probe crashed"));
        }
        assert_eq!(summary.workload("VM01").unwrap().state, SessionState::CleanedUp);
    }
}
