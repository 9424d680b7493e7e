//! RVX Core - recovery verification engine
//!
//! Proves that backups restore, boot and answer:
//! - [`catalog`]: latest restore point per workload
//! - [`preflight`]: blocking and advisory readiness checks
//! - [`scheduler`]: ordered, concurrency-bounded execution groups
//! - [`executor`]: per-workload recovery into an isolated network
//! - [`verification`]: heartbeat, address, ping, port, DNS, HTTP and custom checks
//! - [`cleanup`]: guaranteed teardown
//! - [`aggregate`]: verdicts and the weighted compliance score
//!
//! # Example
//!
//! ```rust,ignore
//! use rv_core::{RunConfig, SystemProbe, VerificationEngine};
//! use std::sync::Arc;
//!
//! # async fn example(catalog: Arc<dyn rv_api::BackupCatalogApi>,
//! #     hypervisor: Arc<dyn rv_api::HypervisorApi>,
//! #     recovery: Arc<dyn rv_api::RecoveryApi>) -> anyhow::Result<()> {
//! let engine = VerificationEngine::new(catalog, hypervisor, recovery, Arc::new(SystemProbe::new()?));
//! let summary = engine.run(RunConfig::new("verify-vlan-999")).await?;
//! println!("success={} score={}", summary.overall_success, summary.score.overall_score);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod aggregate;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod poll;
pub mod preflight;
pub mod scheduler;
pub mod session;
pub mod types;
pub mod verification;

pub use aggregate::{ComplianceScore, RunSummary, ScoreInputs, WorkloadReport};
pub use catalog::Discovery;
pub use config::{GroupSpec, RunConfig, Scope, TestConfig, Timeouts};
pub use context::{EvidenceJournal, RunContext};
pub use engine::VerificationEngine;
pub use error::{PollError, RecoveryError, RunError, StateMachineError};
pub use executor::{RecoveryExecutor, RecoveryTarget};
pub use preflight::{PreflightCheck, PreflightIssue, PreflightReport, Severity};
pub use scheduler::{ExecutionGroup, SchedulePlan};
pub use session::{RecoverySession, SessionState};
pub use types::{IsolatedNetwork, RecoveryStrategy, RunId, SessionId, TestCategory, VerificationResult};
pub use verification::probe::{CustomProbe, NetworkProbe, ProbeError, SystemProbe};
pub use verification::VerificationRunner;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
