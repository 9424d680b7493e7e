//! Teardown of recovered instances
//!
//! Runs once for every session that reached `Submitted`, whatever happened
//! afterwards. Mount-based sessions stop the mount; full-copy sessions are
//! powered off and deleted. Either way the instance is then expected to leave
//! inventory within the grace period, otherwise it is powered off and deleted
//! directly. Failures are recorded on the session and never propagate.

use crate::config::Timeouts;
use crate::context::RunContext;
use crate::error::PollError;
use crate::executor::set_power_confirmed;
use crate::poll::poll_until;
use crate::session::{CleanupRecord, RecoverySession, SessionState};
use crate::types::RecoveryStrategy;
use chrono::Utc;
use rv_api::{ApiError, HypervisorApi, Instance, PowerState, RecoveryApi};
use std::sync::atomic::Ordering;

/// Strategy-aware teardown
pub struct CleanupManager<'a> {
    hypervisor: &'a dyn HypervisorApi,
    recovery: &'a dyn RecoveryApi,
    timeouts: Timeouts,
    ctx: &'a RunContext,
}

impl<'a> CleanupManager<'a> {
    /// Create a manager bound to one run
    #[must_use]
    pub fn new(
        hypervisor: &'a dyn HypervisorApi,
        recovery: &'a dyn RecoveryApi,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            hypervisor,
            recovery,
            timeouts: ctx.config.timeouts,
            ctx,
        }
    }

    /// Tear down `session` and return its terminal state
    ///
    /// Sessions that never reached `Submitted` have nothing remote to remove
    /// and are returned unchanged.
    pub async fn cleanup(&self, session: &mut RecoverySession) -> SessionState {
        if !session.reached_submitted() || session.state.is_terminal() {
            return session.state;
        }

        let name = session.workload_name().to_string();
        let mut errors = Vec::new();

        match session.strategy {
            RecoveryStrategy::InstantRecovery => self.stop_mount(session, &mut errors).await,
            RecoveryStrategy::FullRestore => match self.remaining(session).await {
                Ok(Some(instance)) => self.remove(&instance, &mut errors).await,
                Ok(None) => {}
                Err(e) => errors.push(format!("lookup failed: {e}")),
            },
        }

        let forced = match self.await_removal(session).await {
            Ok(None) => false,
            Ok(Some(instance)) => {
                tracing::warn!(
                    "{}: {} still present after cleanup, forcing removal",
                    name,
                    instance.name
                );
                self.remove(&instance, &mut errors).await;
                match self.remaining(session).await {
                    Ok(Some(_)) => errors.push(format!(
                        "instance {} still present after forced removal",
                        instance.name
                    )),
                    Ok(None) => {}
                    Err(e) => errors.push(format!("lookup after forced removal failed: {e}")),
                }
                true
            }
            Err(e) => {
                errors.push(format!("removal check failed: {e}"));
                false
            }
        };

        let abandoned_job = session.unfinished_restore_job().map(str::to_string);
        if let Some(job) = &abandoned_job {
            self.ctx.warn(format!(
                "restore job {job} for {name} never finished and may still create {}",
                session.instance_name
            ));
            self.ctx.record_for(&name, "restore.abandoned", job.clone());
        }

        let succeeded = errors.is_empty();
        let target = if succeeded {
            SessionState::CleanedUp
        } else {
            SessionState::CleanupFailed
        };
        if let Err(e) = session.transition(target) {
            errors.push(e.to_string());
        }

        if succeeded {
            tracing::info!("{}: cleaned up{}", name, if forced { " (forced)" } else { "" });
            self.ctx.record_for(&name, "cleanup.finished", if forced { "forced" } else { "clean" });
        } else {
            tracing::error!("{}: cleanup failed: {}", name, errors.join("; "));
            self.ctx.counters.cleanup_failed.fetch_add(1, Ordering::SeqCst);
            self.ctx.record_for(&name, "cleanup.failed", errors.join("; "));
        }

        session.cleanup = Some(CleanupRecord {
            succeeded,
            forced,
            errors,
            abandoned_job,
            at: Utc::now(),
        });
        session.state
    }

    async fn stop_mount(&self, session: &mut RecoverySession, errors: &mut Vec<String>) {
        let Some(mount) = session.mount.clone() else {
            return;
        };
        if session.mount_released {
            return;
        }
        match self.recovery.stop_instant_recovery(&mount).await {
            Ok(()) => {
                session.mount_released = true;
                self.ctx.record_for(session.workload_name(), "mount.stopped", "cleanup");
            }
            Err(e) => errors.push(format!("stop mount {}: {e}", mount.session_id)),
        }
    }

    /// Power off, then delete; both attempted even if the first fails
    async fn remove(&self, instance: &Instance, errors: &mut Vec<String>) {
        if instance.power != PowerState::Off {
            if let Err(e) = set_power_confirmed(
                self.hypervisor,
                &instance.id,
                PowerState::Off,
                self.timeouts.power(),
                self.timeouts.poll_interval(),
            )
            .await
            {
                errors.push(format!("power off {}: {e}", instance.name));
            }
        }
        if let Err(e) = self.hypervisor.delete_instance(&instance.id).await {
            errors.push(format!("delete {}: {e}", instance.name));
        }
    }

    /// The session's instance if it is still in inventory
    async fn remaining(&self, session: &RecoverySession) -> Result<Option<Instance>, ApiError> {
        match &session.instance_id {
            Some(id) => self.hypervisor.get_instance(id).await,
            None => self.hypervisor.find_instance(&session.instance_name).await,
        }
    }

    /// Wait up to the grace period for the instance to disappear
    ///
    /// Returns the instance when it is still there afterwards.
    async fn await_removal(&self, session: &RecoverySession) -> Result<Option<Instance>, ApiError> {
        let gone = poll_until(
            &format!("removal of {}", session.instance_name),
            self.timeouts.cleanup_grace(),
            self.timeouts.poll_interval(),
            || async { Ok::<_, ApiError>(self.remaining(session).await?.is_none().then_some(())) },
        )
        .await;
        match gone {
            Ok(()) => Ok(None),
            Err(PollError::Api(e)) => Err(e),
            Err(PollError::TimedOut { .. }) => self.remaining(session).await,
        }
    }
}
