//! Verification engine
//!
//! The entry points [`VerificationEngine::run`] and
//! [`VerificationEngine::dry_run`]. A run goes through these stages:
//! 1. validate configuration
//! 2. discover restore points
//! 3. resolve the isolated network, clusters and storage target
//! 4. preflight; blocking issues stop here
//! 5. plan execution groups
//! 6. per group, recover, verify and clean up up to `max_concurrent_vms`
//!    workloads at a time; the next group starts once all have finished
//! 7. aggregate
//!
//! Dry runs stop after step 5.

use crate::aggregate::{aggregate, AggregateInput, RunSummary};
use crate::catalog::{self, Discovery};
use crate::cleanup::CleanupManager;
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::{RecoveryError, RunError};
use crate::executor::{RecoveryExecutor, RecoveryTarget};
use crate::preflight::{self, PreflightInput, PreflightReport};
use crate::scheduler::{self, SchedulePlan};
use crate::session::{CleanupRecord, RecoverySession, SessionState};
use crate::types::{IsolatedNetwork, VerificationResult};
use crate::verification::probe::{CustomProbe, NetworkProbe};
use crate::verification::{panic_message, VerificationRunner};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use rv_api::{BackupCatalogApi, HypervisorApi, RecoveryApi, RestorePoint};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::Instrument;

/// Everything computed before the first side effect
#[derive(Debug)]
struct Prepared {
    discovery: Discovery,
    preflight: PreflightReport,
    plan: SchedulePlan,
    target: Option<RecoveryTarget>,
}

/// Recovery verification engine
pub struct VerificationEngine {
    catalog: Arc<dyn BackupCatalogApi>,
    hypervisor: Arc<dyn HypervisorApi>,
    recovery: Arc<dyn RecoveryApi>,
    probe: Arc<dyn NetworkProbe>,
    custom: Option<Arc<dyn CustomProbe>>,
}

impl VerificationEngine {
    /// Create an engine over the three remote capabilities
    #[must_use]
    pub fn new(
        catalog: Arc<dyn BackupCatalogApi>,
        hypervisor: Arc<dyn HypervisorApi>,
        recovery: Arc<dyn RecoveryApi>,
        probe: Arc<dyn NetworkProbe>,
    ) -> Self {
        Self {
            catalog,
            hypervisor,
            recovery,
            probe,
            custom: None,
        }
    }

    /// With an application-level check run last in every battery
    #[inline]
    #[must_use]
    pub fn with_custom_probe(mut self, probe: Arc<dyn CustomProbe>) -> Self {
        self.custom = Some(probe);
        self
    }

    /// Recover, verify and clean up every workload in scope
    ///
    /// Per-workload failures are captured in the summary; the run itself
    /// only fails before any recovery is submitted.
    ///
    /// # Errors
    /// - `RunError::Config` for invalid configuration
    /// - `RunError::NoJobs` / `RunError::NoRestorePoints` for an empty scope
    /// - `RunError::PreflightBlocked` when preflight finds blocking issues
    /// - `RunError::Api` when inventory cannot be read
    pub async fn run(&self, config: RunConfig) -> Result<RunSummary, RunError> {
        let ctx = RunContext::new(config, false);
        tracing::info!("Starting verification run {}", ctx.run_id);
        ctx.record("run.started", ctx.config.strategy.to_string());

        let prepared = self.prepare(&ctx).await?;
        if !prepared.preflight.passed() {
            ctx.record("run.blocked", prepared.preflight.blocking_summary());
            return Err(RunError::PreflightBlocked(prepared.preflight));
        }
        let Some(target) = prepared.target.as_ref() else {
            return Err(RunError::Config(format!(
                "isolated network {} could not be resolved",
                ctx.config.isolated_network
            )));
        };

        let mut sessions = Vec::new();
        let mut results = Vec::new();
        let cap = ctx.config.max_concurrent_vms;

        for (index, group) in prepared.plan.groups.iter().enumerate() {
            tracing::info!(
                "Group {}/{} `{}`: {} workload(s), up to {} concurrent",
                index + 1,
                prepared.plan.groups.len(),
                group.label,
                group.members.len(),
                cap
            );
            ctx.record("group.started", group.label.clone());

            let outcomes: Vec<(RecoverySession, Vec<VerificationResult>)> =
                futures::stream::iter(group.members.iter().cloned())
                    .map(|rp| self.run_workload(&ctx, target, rp))
                    .buffer_unordered(cap)
                    .collect()
                    .await;

            ctx.record("group.finished", group.label.clone());
            for (session, session_results) in outcomes {
                results.extend(session_results);
                sessions.push(session);
            }
        }

        let summary = aggregate(AggregateInput {
            ctx: &ctx,
            discovery: &prepared.discovery,
            preflight: prepared.preflight.clone(),
            plan: &prepared.plan,
            sessions,
            results,
        });
        tracing::info!(
            "Run {} finished: success={} score={}",
            summary.run_id,
            summary.overall_success,
            summary.score.overall_score
        );
        Ok(summary)
    }

    /// Discovery, preflight and planning only; never submits a recovery
    ///
    /// Blocking preflight issues are reported in the summary rather than
    /// raised; `overall_success` mirrors preflight success.
    ///
    /// # Errors
    /// Configuration, empty scope and inventory errors as for [`Self::run`]
    pub async fn dry_run(&self, config: RunConfig) -> Result<RunSummary, RunError> {
        let ctx = RunContext::new(config, true);
        tracing::info!("Starting dry run {}", ctx.run_id);
        ctx.record("run.started", "dry run");

        let prepared = self.prepare(&ctx).await?;
        Ok(aggregate(AggregateInput {
            ctx: &ctx,
            discovery: &prepared.discovery,
            preflight: prepared.preflight.clone(),
            plan: &prepared.plan,
            sessions: Vec::new(),
            results: Vec::new(),
        }))
    }

    async fn prepare(&self, ctx: &RunContext) -> Result<Prepared, RunError> {
        let config = &ctx.config;
        config.validate()?;

        let discovery = catalog::discover(self.catalog.as_ref(), &config.scope, ctx).await?;
        tracing::info!(
            "Discovered {} restore point(s) for {} workload(s)",
            discovery.restore_points.len(),
            discovery.known_workloads
        );

        let network: Option<IsolatedNetwork> = self
            .hypervisor
            .list_networks()
            .await?
            .into_iter()
            .find(|n| {
                n.id == config.isolated_network
                    || n.name.eq_ignore_ascii_case(&config.isolated_network)
            })
            .map(IsolatedNetwork::from);

        let clusters = self.hypervisor.list_clusters().await?;
        let cluster_id = config.target_cluster.as_deref().and_then(|name| {
            clusters
                .iter()
                .find(|c| c.id == name || c.name.eq_ignore_ascii_case(name))
                .map(|c| c.id.clone())
        });

        let storage_target = match config.storage_target.as_deref() {
            Some(name) => self
                .hypervisor
                .list_storage_targets()
                .await?
                .into_iter()
                .find(|s| s.id == name || s.name.eq_ignore_ascii_case(name)),
            None => None,
        };

        let probe = self.recovery.probe().await;
        if let Err(e) = &probe {
            tracing::warn!("Recovery endpoint probe failed: {}", e);
        }

        let preflight = preflight::validate(&PreflightInput {
            clusters: &clusters,
            target_cluster: config.target_cluster.as_deref(),
            network: network.as_ref(),
            network_name: &config.isolated_network,
            restore_points: &discovery.restore_points,
            jobs: &discovery.jobs,
            max_concurrent: config.max_concurrent_vms,
            max_age_days: config.max_restore_point_age_days,
            strategy: config.strategy,
            storage_target: storage_target.as_ref(),
            storage_target_name: config.storage_target.as_deref(),
            recovery_probe: probe.as_ref().map(|_| ()),
            now: Utc::now(),
        });
        ctx.record(
            "preflight.finished",
            format!(
                "blocking={} advisory={}",
                preflight.blocking.len(),
                preflight.advisory.len()
            ),
        );
        for issue in &preflight.advisory {
            ctx.warn(format!("preflight: {}: {}", issue.subject, issue.message));
        }

        let plan = scheduler::plan(&discovery.restore_points, &config.groups);

        let target = network.map(|network| RecoveryTarget {
            network,
            storage_target,
            cluster_id,
        });

        Ok(Prepared {
            discovery,
            preflight,
            plan,
            target,
        })
    }

    /// Recover, verify and clean up one workload
    ///
    /// Never fails: every outcome ends up on the returned session. Cleanup
    /// runs whenever the session reached `Submitted`, including after a
    /// timeout or a panic in the worker.
    async fn run_workload(
        &self,
        ctx: &RunContext,
        target: &RecoveryTarget,
        restore_point: RestorePoint,
    ) -> (RecoverySession, Vec<VerificationResult>) {
        let mut session =
            RecoverySession::new(restore_point, ctx.config.strategy, target.network.clone());
        let span = tracing::info_span!(
            "workload",
            name = %session.workload_name(),
            session = %session.id,
            strategy = %session.strategy,
        );

        async move {
            let mut results = Vec::new();
            let ceiling = ctx.config.timeouts.workload();
            let executor = RecoveryExecutor::new(
                self.hypervisor.as_ref(),
                self.recovery.as_ref(),
                target,
                ctx,
            );
            let verifier = VerificationRunner::new(
                self.hypervisor.as_ref(),
                self.probe.as_ref(),
                self.custom.as_deref(),
                ctx,
            );

            let work = async {
                let instance = executor.recover(&mut session).await?;
                session.transition(SessionState::VerificationInProgress)?;
                verifier.verify(&session, &instance, &mut results).await;
                Ok::<_, RecoveryError>(())
            };
            let outcome =
                tokio::time::timeout(ceiling, AssertUnwindSafe(work).catch_unwind()).await;

            let failure = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e),
                Ok(Err(panic)) => {
                    Some(RecoveryError::WorkerPanicked(panic_message(panic.as_ref())))
                }
                Err(_) => Some(RecoveryError::WorkloadTimedOut(ceiling)),
            };
            match failure {
                Some(e) => {
                    tracing::error!("{}: {}", session.workload_name(), e);
                    ctx.record_for(session.workload_name(), "workload.failed", e.to_string());
                    ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
                    session.fail(&e);
                }
                None => {
                    ctx.counters.recovered.fetch_add(1, Ordering::SeqCst);
                }
            }

            if session.reached_submitted() {
                self.cleanup(ctx, &mut session).await;
                ctx.counters.leave_active();
            }
            (session, results)
        }
        .instrument(span)
        .await
    }

    async fn cleanup(&self, ctx: &RunContext, session: &mut RecoverySession) {
        let manager = CleanupManager::new(self.hypervisor.as_ref(), self.recovery.as_ref(), ctx);
        let outcome = AssertUnwindSafe(manager.cleanup(session)).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = format!("cleanup panicked: {}", panic_message(panic.as_ref()));
            tracing::error!("{}: {}", session.workload_name(), message);
            ctx.counters.cleanup_failed.fetch_add(1, Ordering::SeqCst);
            ctx.record_for(session.workload_name(), "cleanup.failed", message.clone());
            if !session.state.is_terminal() {
                let _ = session.transition(SessionState::CleanupFailed);
            }
            session.cleanup = Some(CleanupRecord {
                succeeded: false,
                forced: false,
                errors: vec![message],
                abandoned_job: session.unfinished_restore_job().map(str::to_string),
                at: Utc::now(),
            });
        }
    }
}
