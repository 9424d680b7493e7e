//! Full-copy restore with network remap
//!
//! The restore request carries a remap of every source adapter onto the
//! isolated network, so the instance is created isolated. Attachments are
//! still checked once it appears, and it is only powered on when every
//! adapter sits on the isolated network.

use super::{describe_networks, RecoveryExecutor};
use crate::error::{PollError, RecoveryError};
use crate::poll::poll_until;
use crate::session::{RecoverySession, SessionState};
use rv_api::{
    AdapterInfo, AsyncJobResult, AsyncJobState, AsyncJobStatus, FullRestoreRequest, Instance,
    NetworkMapping, PowerState,
};

/// One mapping per distinct source network, all pointing at `target`
#[must_use]
pub(crate) fn remap_table(adapters: &[AdapterInfo], target: &str) -> Vec<NetworkMapping> {
    let mut mappings: Vec<NetworkMapping> = Vec::new();
    for adapter in adapters {
        if mappings.iter().any(|m| m.source_network_id == adapter.network_id) {
            continue;
        }
        mappings.push(NetworkMapping {
            source_network_id: adapter.network_id.clone(),
            target_network_id: target.to_string(),
        });
    }
    mappings
}

pub(super) async fn recover(
    exec: &RecoveryExecutor<'_>,
    session: &mut RecoverySession,
) -> Result<Instance, RecoveryError> {
    let network = &exec.target.network;
    let storage = exec
        .target
        .storage_target
        .as_ref()
        .ok_or(RecoveryError::NoStorageTarget)?;

    let metadata = exec
        .recovery
        .restore_point_metadata(&session.restore_point)
        .await?;
    if metadata.adapters.is_empty() {
        tracing::warn!("{}: restore point lists no network adapters", session.workload_name());
    }
    let mappings = remap_table(&metadata.adapters, &network.id);

    let request = FullRestoreRequest {
        restore_point_id: session.restore_point.id.clone(),
        instance_name: session.instance_name.clone(),
        cluster_id: exec
            .target
            .cluster_id
            .clone()
            .or(metadata.cluster_hint)
            .or_else(|| session.restore_point.workload.cluster.clone()),
        storage_target_id: storage.id.clone(),
        network_mappings: mappings,
        power_on_after_restore: false,
    };

    exec.mark_submitted(session)?;
    let job = exec.recovery.submit_full_restore(&request).await?;
    exec.record(
        session,
        "restore.submitted",
        format!("job {} with {} network mapping(s)", job.id, request.network_mappings.len()),
    );
    session.restore_job = Some(job.clone());

    let waited = exec.timeouts.restore_job();
    let job_ref = &job;
    let status: AsyncJobStatus = poll_until(
        &format!("restore job {}", job.id),
        waited,
        exec.timeouts.poll_interval(),
        || async move {
            let status = exec.recovery.job_status(job_ref).await?;
            Ok::<_, rv_api::ApiError>(status.state.is_terminal().then_some(status))
        },
    )
    .await
    .map_err(|e| match e {
        PollError::TimedOut { .. } => RecoveryError::RestoreJobTimedOut {
            job: job.id.clone(),
            waited,
        },
        PollError::Api(api) => RecoveryError::Api(api),
    })?;
    session.restore_job_finished = true;

    let succeeded = status.state == AsyncJobState::Finished
        && matches!(status.result, AsyncJobResult::Success | AsyncJobResult::Warning);
    if !succeeded {
        return Err(RecoveryError::RestoreJobFailed {
            job: job.id.clone(),
            state: format!("{:?}/{:?}", status.state, status.result),
            message: status.message.unwrap_or_default(),
        });
    }
    if status.result == AsyncJobResult::Warning {
        tracing::warn!(
            "{}: restore job {} finished with warning: {}",
            session.workload_name(),
            job.id,
            status.message.as_deref().unwrap_or("")
        );
    }
    exec.record(session, "restore.finished", format!("{:?}", status.result));

    session.transition(SessionState::AwaitingNetworkSafety)?;
    let instance = exec.locate(&session.instance_name).await?;
    session.instance_id = Some(instance.id.clone());
    exec.record(
        session,
        "instance.discovered",
        format!("{} on {}", instance.id, describe_networks(&instance)),
    );

    if !instance.attached_only_to(&network.id) {
        let foreign = instance
            .networks
            .iter()
            .filter(|n| **n != network.id)
            .cloned()
            .collect();
        return Err(RecoveryError::ForeignAttachment {
            name: instance.name.clone(),
            networks: foreign,
        });
    }

    let running = exec.power(&instance, PowerState::On).await?;
    session.transition(SessionState::Running)?;
    exec.record(session, "power.on_confirmed", running.id.clone());
    tracing::info!("{}: running isolated on {}", session.workload_name(), network.name);
    Ok(running)
}
