//! Recovery execution
//!
//! Drives one [`RecoverySession`] from `Pending` to `Running` with the
//! configured strategy. The network isolation invariant is enforced here:
//! - mount-based sessions are discovered, powered off, rewired and only then
//!   powered on; every abort stops the mount before returning
//! - full-copy sessions are created with every adapter remapped and are
//!   checked for foreign attachments before power-on
//!
//! Errors are returned to the caller, which records them on the session and
//! hands the session to cleanup.

mod full_copy;
mod instant;

use crate::config::Timeouts;
use crate::context::RunContext;
use crate::error::{PollError, RecoveryError};
use crate::poll::poll_until;
use crate::session::{RecoverySession, SessionState};
use crate::types::{IsolatedNetwork, RecoveryStrategy};
use rv_api::{ApiError, HypervisorApi, Instance, PowerState, RecoveryApi, StorageTarget};
use std::time::Duration;

/// Where recovered instances go; resolved once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTarget {
    /// Isolated network every instance is attached to
    pub network: IsolatedNetwork,
    /// Required by full-copy restores
    pub storage_target: Option<StorageTarget>,
    /// Overrides the restore point's cluster hint
    pub cluster_id: Option<String>,
}

/// Per-workload recovery driver
pub struct RecoveryExecutor<'a> {
    hypervisor: &'a dyn HypervisorApi,
    recovery: &'a dyn RecoveryApi,
    target: &'a RecoveryTarget,
    timeouts: Timeouts,
    ctx: &'a RunContext,
}

impl<'a> RecoveryExecutor<'a> {
    /// Create an executor bound to one run
    #[must_use]
    pub fn new(
        hypervisor: &'a dyn HypervisorApi,
        recovery: &'a dyn RecoveryApi,
        target: &'a RecoveryTarget,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            hypervisor,
            recovery,
            target,
            timeouts: ctx.config.timeouts,
            ctx,
        }
    }

    /// Recover `session` into the isolated network
    ///
    /// On success the session is `Running` and the powered-on instance is
    /// returned. On failure the session is left where the failure happened;
    /// the caller marks it failed and runs cleanup.
    ///
    /// # Errors
    /// [`RecoveryError`] describing the first failed step
    pub async fn recover(&self, session: &mut RecoverySession) -> Result<Instance, RecoveryError> {
        tracing::info!(
            "Recovering {} as {} ({})",
            session.workload_name(),
            session.instance_name,
            session.strategy
        );
        match session.strategy {
            RecoveryStrategy::InstantRecovery => instant::recover(self, session).await,
            RecoveryStrategy::FullRestore => full_copy::recover(self, session).await,
        }
    }

    /// Mark the point after which a remote side effect may exist
    fn mark_submitted(&self, session: &mut RecoverySession) -> Result<(), RecoveryError> {
        session.transition(SessionState::Submitted)?;
        self.ctx.counters.enter_active();
        Ok(())
    }

    fn record(&self, session: &RecoverySession, action: &str, detail: impl Into<String>) {
        self.ctx.record_for(session.workload_name(), action, detail);
    }

    /// Bounded wait for an instance to appear in inventory by name
    async fn locate(&self, name: &str) -> Result<Instance, RecoveryError> {
        let waited = self.timeouts.discovery();
        poll_until(
            &format!("instance {name} in inventory"),
            waited,
            self.timeouts.poll_interval(),
            || self.hypervisor.find_instance(name),
        )
        .await
        .map_err(|e| match e {
            PollError::TimedOut { .. } => RecoveryError::InstanceNotFound {
                name: name.to_string(),
                waited,
            },
            PollError::Api(api) => RecoveryError::Api(api),
        })
    }

    /// Request a power state and wait for confirmation
    async fn power(&self, instance: &Instance, state: PowerState) -> Result<Instance, RecoveryError> {
        let waited = self.timeouts.power();
        set_power_confirmed(self.hypervisor, &instance.id, state, waited, self.timeouts.poll_interval())
            .await
            .map_err(|e| match (e, state) {
                (PollError::TimedOut { .. }, PowerState::On) => RecoveryError::PowerOnUnconfirmed {
                    name: instance.name.clone(),
                    waited,
                },
                (PollError::TimedOut { .. }, _) => RecoveryError::PowerOffUnconfirmed {
                    name: instance.name.clone(),
                    waited,
                },
                (PollError::Api(api), _) => RecoveryError::Api(api),
            })
    }
}

/// Request `state` unless already there, then poll until inventory agrees
///
/// # Errors
/// `PollError` on timeout or a fatal remote error
pub(crate) async fn set_power_confirmed(
    hypervisor: &dyn HypervisorApi,
    id: &str,
    state: PowerState,
    timeout: Duration,
    interval: Duration,
) -> Result<Instance, PollError> {
    let current = hypervisor.get_instance(id).await.map_err(PollError::Api)?;
    if let Some(instance) = current.filter(|i| i.power == state) {
        return Ok(instance);
    }
    hypervisor.set_power(id, state).await.map_err(PollError::Api)?;

    poll_until(
        &format!("power {} of {id}", state.as_wire()),
        timeout,
        interval,
        || async move {
            let instance = hypervisor.get_instance(id).await?;
            Ok::<_, ApiError>(match instance {
                Some(i) if i.power == state => Some(i),
                _ => None,
            })
        },
    )
    .await
}

/// Attached networks, for journal entries
pub(crate) fn describe_networks(instance: &Instance) -> String {
    if instance.networks.is_empty() {
        "no adapters".to_string()
    } else {
        instance.networks.join(",")
    }
}
