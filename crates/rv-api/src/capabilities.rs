//! Remote capabilities consumed by the verification engine
//!
//! Three traits, one per control plane. The engine depends only on these;
//! the REST adapters in [`crate::rest`] and the in-memory lab used by tests
//! are interchangeable behind them.

use crate::contracts::{
    AsyncJobRef, AsyncJobStatus, BackupJob, Cluster, FullRestoreRequest, Instance, MountHandle,
    Network, PowerState, RestorePoint, RestorePointMetadata, StorageTarget, Workload,
};
use crate::error::ApiError;
use async_trait::async_trait;

/// Backup catalog: jobs, their workloads, restore points
#[async_trait]
pub trait BackupCatalogApi: Send + Sync {
    /// All backup jobs
    async fn list_jobs(&self) -> Result<Vec<BackupJob>, ApiError>;

    /// Workloads protected by `job`
    async fn list_workloads(&self, job: &BackupJob) -> Result<Vec<Workload>, ApiError>;

    /// Restore points of `workload`, any order
    async fn list_restore_points(
        &self,
        job: &BackupJob,
        workload: &Workload,
    ) -> Result<Vec<RestorePoint>, ApiError>;
}

/// Hypervisor control plane
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Find an instance by exact name
    async fn find_instance(&self, name: &str) -> Result<Option<Instance>, ApiError>;

    /// Fetch an instance by id
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, ApiError>;

    /// Request a power state change; confirmation is polled separately
    async fn set_power(&self, id: &str, state: PowerState) -> Result<(), ApiError>;

    /// Rewrite every adapter of the instance onto `network_id`
    async fn attach_all_adapters(&self, id: &str, network_id: &str) -> Result<(), ApiError>;

    /// Delete the instance
    async fn delete_instance(&self, id: &str) -> Result<(), ApiError>;

    /// Clusters with health and capacity
    async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError>;

    /// Network segments
    async fn list_networks(&self) -> Result<Vec<Network>, ApiError>;

    /// Storage targets
    async fn list_storage_targets(&self) -> Result<Vec<StorageTarget>, ApiError>;
}

/// Recovery control plane
#[async_trait]
pub trait RecoveryApi: Send + Sync {
    /// Mount a restore point as a running instance; accepts no network target
    async fn start_instant_recovery(
        &self,
        restore_point: &RestorePoint,
        instance_name: &str,
    ) -> Result<MountHandle, ApiError>;

    /// Stop a mount and release its instance
    async fn stop_instant_recovery(&self, mount: &MountHandle) -> Result<(), ApiError>;

    /// Adapters, disks and cluster hint of a restore point
    async fn restore_point_metadata(
        &self,
        restore_point: &RestorePoint,
    ) -> Result<RestorePointMetadata, ApiError>;

    /// Submit an asynchronous full-copy restore with network remap
    async fn submit_full_restore(
        &self,
        request: &FullRestoreRequest,
    ) -> Result<AsyncJobRef, ApiError>;

    /// Poll an asynchronous job
    async fn job_status(&self, job: &AsyncJobRef) -> Result<AsyncJobStatus, ApiError>;

    /// Reachability probe of the recovery endpoint
    async fn probe(&self) -> Result<(), ApiError>;
}
