//! Mount-based instant recovery
//!
//! The mount call takes no network parameter, so the instance comes up
//! attached to its original network. It is never allowed to run there:
//!
//! 1. submit the mount
//! 2. wait for the instance to appear in inventory
//! 3. check the isolated network is not one of its current networks
//! 4. power off and wait for confirmation
//! 5. while off, move every adapter to the isolated network and re-read
//! 6. power on
//!
//! Any failure after step 1 stops the mount before the error is returned.

use super::{describe_networks, RecoveryExecutor};
use crate::error::RecoveryError;
use crate::session::{RecoverySession, SessionState};
use rv_api::{Instance, MountHandle, PowerState};

pub(super) async fn recover(
    exec: &RecoveryExecutor<'_>,
    session: &mut RecoverySession,
) -> Result<Instance, RecoveryError> {
    exec.mark_submitted(session)?;
    let mount = exec
        .recovery
        .start_instant_recovery(&session.restore_point, &session.instance_name)
        .await?;
    exec.record(session, "mount.submitted", mount.session_id.clone());
    session.mount = Some(mount.clone());

    match isolate_and_start(exec, session).await {
        Ok(instance) => Ok(instance),
        Err(err) => {
            tracing::error!(
                "{}: recovery aborted, stopping mount {}: {}",
                session.workload_name(),
                mount.session_id,
                err
            );
            abort(exec, session, &mount).await;
            Err(err)
        }
    }
}

async fn isolate_and_start(
    exec: &RecoveryExecutor<'_>,
    session: &mut RecoverySession,
) -> Result<Instance, RecoveryError> {
    let network = &exec.target.network;

    let instance = exec.locate(&session.instance_name).await?;
    session.instance_id = Some(instance.id.clone());
    exec.record(
        session,
        "instance.discovered",
        format!("{} on {}", instance.id, describe_networks(&instance)),
    );

    session.transition(SessionState::AwaitingNetworkSafety)?;
    if instance.networks.iter().any(|n| *n == network.id) {
        return Err(RecoveryError::NetworkNotIsolated {
            network: network.name.clone(),
        });
    }

    let instance = exec.power(&instance, PowerState::Off).await?;
    exec.record(session, "power.off_confirmed", instance.id.clone());

    exec.hypervisor
        .attach_all_adapters(&instance.id, &network.id)
        .await
        .map_err(|e| RecoveryError::NetworkRewriteFailed {
            name: instance.name.clone(),
            reason: e.to_string(),
        })?;

    let rewired = exec
        .hypervisor
        .get_instance(&instance.id)
        .await?
        .ok_or_else(|| RecoveryError::NetworkRewriteFailed {
            name: instance.name.clone(),
            reason: "instance disappeared during rewrite".into(),
        })?;
    if !rewired.attached_only_to(&network.id) {
        return Err(RecoveryError::NetworkRewriteFailed {
            name: rewired.name.clone(),
            reason: format!("still attached to {}", describe_networks(&rewired)),
        });
    }
    if rewired.power != PowerState::Off {
        return Err(RecoveryError::NetworkRewriteFailed {
            name: rewired.name.clone(),
            reason: format!("power changed to {:?} during rewrite", rewired.power),
        });
    }
    exec.record(session, "network.rewritten", network.id.clone());

    let running = exec.power(&rewired, PowerState::On).await?;
    session.transition(SessionState::Running)?;
    exec.record(session, "power.on_confirmed", running.id.clone());
    tracing::info!("{}: running isolated on {}", session.workload_name(), network.name);
    Ok(running)
}

/// Stop the mount; cleanup retries when this fails
async fn abort(exec: &RecoveryExecutor<'_>, session: &mut RecoverySession, mount: &MountHandle) {
    match exec.recovery.stop_instant_recovery(mount).await {
        Ok(()) => {
            session.mount_released = true;
            exec.record(session, "mount.stopped", "abort");
        }
        Err(e) => {
            tracing::error!(
                "{}: failed to stop mount {} on abort: {}",
                session.workload_name(),
                mount.session_id,
                e
            );
            exec.record(session, "mount.stop_failed", e.to_string());
        }
    }
}
