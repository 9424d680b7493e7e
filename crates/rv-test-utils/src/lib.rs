//! Testing utilities for RVX workspace
//!
//! An in-memory lab standing in for the backup, hypervisor and recovery
//! control planes, a scripted network probe, and config fixtures.

#![allow(missing_docs)]

pub mod lab;
pub mod probe;

pub use lab::{Fault, FakeLab, ISOLATED_NETWORK, ISOLATED_NETWORK_NAME, PROD_NETWORK, STORAGE_TARGET};
pub use probe::{FakeProbe, ProbeCall};

use rv_core::{RecoveryStrategy, RunConfig, TestConfig, Timeouts, VerificationEngine};
use std::sync::Arc;

/// Short waits so paused-clock tests stay quick
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        discovery_secs: 60,
        power_secs: 30,
        restore_job_secs: 300,
        poll_interval_secs: 5,
        workload_secs: 1800,
        cleanup_grace_secs: 30,
    }
}

/// Ping plus one port, short waits
pub fn fast_tests() -> TestConfig {
    TestConfig {
        ping: true,
        ports: vec![443],
        dns: false,
        urls: Vec::new(),
        boot_timeout_secs: 60,
        address_timeout_secs: 60,
        probe_timeout_secs: 5,
    }
}

/// Config targeting the lab's isolated network
pub fn lab_config(strategy: RecoveryStrategy) -> RunConfig {
    let mut config = RunConfig::new(ISOLATED_NETWORK_NAME)
        .with_strategy(strategy)
        .with_tests(fast_tests());
    config.timeouts = fast_timeouts();
    if strategy == RecoveryStrategy::FullRestore {
        config.storage_target = Some(STORAGE_TARGET.to_string());
    }
    config
}

/// Engine wired to one lab for all three capabilities
pub fn engine(lab: &Arc<FakeLab>, probe: &Arc<FakeProbe>) -> VerificationEngine {
    VerificationEngine::new(lab.clone(), lab.clone(), lab.clone(), probe.clone())
}

/// Lab with `count` protected workloads named `VM01`.. in job `Nightly`
pub fn lab_with_workloads(count: usize) -> FakeLab {
    (1..=count).fold(FakeLab::new(), |lab, i| {
        lab.with_protected_workload("Nightly", &format!("VM{i:02}"))
    })
}
