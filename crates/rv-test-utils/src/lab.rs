//! In-memory lab implementing all three remote capabilities
//!
//! Seed it with jobs, workloads and restore points, inject faults per
//! workload, run the engine against it, then read back what happened.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rv_api::{
    AdapterInfo, ApiError, ApiErrorKind, AsyncJobRef, AsyncJobResult, AsyncJobState,
    AsyncJobStatus, BackupCatalogApi, BackupJob, Cluster, ClusterHealth, Consistency,
    FullRestoreRequest, HeartbeatState, HypervisorApi, Instance, JobResult, JobRunState,
    MountHandle, Network, PowerState, RecoveryApi, RestorePoint, RestorePointMetadata,
    StorageTarget, Workload,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const PROD_NETWORK: &str = "net-prod";
pub const ISOLATED_NETWORK: &str = "net-iso";
pub const ISOLATED_NETWORK_NAME: &str = "verify-lab";
pub const STORAGE_TARGET: &str = "ctr-verify";

/// Injectable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// The mounted instance never shows up in inventory
    InstanceNeverAppears,
    /// The mount starts the instance powered on
    BootsPoweredOn,
    /// Power-off requests are accepted but never take effect
    PowerOffIgnored,
    /// Power-off requests fail
    PowerOffFails,
    /// Adapter rewrite fails
    RewriteFails,
    /// Adapter rewrite reports success but changes nothing
    RewriteIgnored,
    /// Adapter rewrite panics
    PanicOnRewrite,
    /// Power-on requests are accepted but never take effect
    PowerOnIgnored,
    /// The guest never reports an address
    NoAddress,
    /// The guest heartbeat stays absent
    NoHeartbeat,
    /// Stopping the mount fails
    StopMountFails,
    /// Stopping the mount leaves the instance behind
    StopMountLeavesInstance,
    /// Deleting the instance fails
    DeleteFails,
    /// The restore job ends in error
    RestoreJobFails,
    /// The restore job never finishes
    RestoreJobHangs,
    /// The restore ignores the network remap
    RestoreIgnoresRemap,
}

#[derive(Debug, Clone)]
struct LabInstance {
    instance: Instance,
    workload: String,
    visible: bool,
}

#[derive(Debug, Clone)]
struct MountRecord {
    instance_id: String,
    workload: String,
    stop_calls: u32,
    stopped: bool,
}

#[derive(Debug, Clone)]
struct RestoreJobRecord {
    request: FullRestoreRequest,
    workload: String,
    source_networks: Vec<String>,
    polls: u32,
    instance_created: bool,
}

#[derive(Debug, Default)]
struct LabState {
    jobs: Vec<BackupJob>,
    workloads: Vec<Workload>,
    restore_points: Vec<RestorePoint>,
    source_networks: HashMap<String, Vec<String>>,
    clusters: Vec<Cluster>,
    networks: Vec<Network>,
    storage_targets: Vec<StorageTarget>,
    isolated: HashSet<String>,

    faults: HashMap<String, HashSet<Fault>>,
    global_faults: HashSet<Fault>,
    probe_down: bool,

    instances: HashMap<String, LabInstance>,
    mounts: HashMap<String, MountRecord>,
    restore_jobs: HashMap<String, RestoreJobRecord>,
    next_id: u64,
    addresses_assigned: u8,

    unsafe_power_ons: Vec<String>,
    observed: HashMap<String, Vec<Vec<String>>>,
    delete_calls: HashMap<String, u32>,
    live_peak: usize,
    catalog_calls: u32,
}

impl LabState {
    fn has(&self, workload: &str, fault: Fault) -> bool {
        self.global_faults.contains(&fault)
            || self.faults.get(workload).is_some_and(|f| f.contains(&fault))
    }

    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn observe(&mut self, id: &str) -> Option<Instance> {
        let entry = self.instances.get(id).filter(|i| i.visible)?.clone();
        self.observed
            .entry(entry.workload.clone())
            .or_default()
            .push(entry.instance.networks.clone());
        Some(entry.instance)
    }

    fn insert_instance(&mut self, instance: Instance, workload: &str, visible: bool) {
        self.instances.insert(
            instance.id.clone(),
            LabInstance {
                instance,
                workload: workload.to_string(),
                visible,
            },
        );
        self.live_peak = self.live_peak.max(self.instances.len());
    }

    fn workload_of_instance(&self, id: &str) -> Option<String> {
        self.instances.get(id).map(|i| i.workload.clone())
    }
}

/// Fake backup, hypervisor and recovery control planes
#[derive(Debug)]
pub struct FakeLab {
    state: Mutex<LabState>,
    latency: Duration,
    restore_job_polls: u32,
}

impl Default for FakeLab {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(endpoint: &str, what: &str) -> ApiError {
    ApiError::from_status(endpoint, 404, format!("{what} not found"), None)
}

fn injected(endpoint: &str, what: &str) -> ApiError {
    ApiError::new(ApiErrorKind::Client, endpoint, format!("injected failure: {what}"))
}

impl FakeLab {
    /// A lab with one healthy 3-node cluster, a production and an isolated
    /// network, and one storage target
    #[must_use]
    pub fn new() -> Self {
        let state = LabState {
            clusters: vec![Cluster {
                id: "cl-1".into(),
                name: "cluster-a".into(),
                health: ClusterHealth::Healthy,
                node_count: 3,
            }],
            networks: vec![
                Network {
                    id: PROD_NETWORK.into(),
                    name: "prod-lan".into(),
                    segment_id: Some("100".into()),
                },
                Network {
                    id: ISOLATED_NETWORK.into(),
                    name: ISOLATED_NETWORK_NAME.into(),
                    segment_id: Some("999".into()),
                },
            ],
            storage_targets: vec![StorageTarget {
                id: "st-1".into(),
                name: STORAGE_TARGET.into(),
                cluster_id: Some("cl-1".into()),
                free_bytes: Some(10 << 40),
            }],
            isolated: HashSet::from([ISOLATED_NETWORK.to_string()]),
            ..LabState::default()
        };
        Self {
            state: Mutex::new(state),
            latency: Duration::from_millis(100),
            restore_job_polls: 2,
        }
    }

    /// Delay applied to every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `Running` polls before a restore job finishes
    #[must_use]
    pub fn with_restore_job_polls(mut self, polls: u32) -> Self {
        self.restore_job_polls = polls;
        self
    }

    /// Add a backup job
    #[must_use]
    pub fn with_job(self, name: &str, state: JobRunState, last_result: JobResult) -> Self {
        {
            let mut s = self.state.lock();
            let id = format!("job-{name}");
            s.jobs.retain(|j| j.id != id);
            s.jobs.push(BackupJob {
                id,
                name: name.into(),
                state,
                last_result,
            });
        }
        self
    }

    /// Add a workload without restore points, creating its job if needed
    #[must_use]
    pub fn with_workload(self, job: &str, name: &str) -> Self {
        {
            let mut s = self.state.lock();
            let job_id = format!("job-{job}");
            if !s.jobs.iter().any(|j| j.id == job_id) {
                s.jobs.push(BackupJob {
                    id: job_id.clone(),
                    name: job.into(),
                    state: JobRunState::Idle,
                    last_result: JobResult::Success,
                });
            }
            let id = format!("w-{name}");
            s.source_networks.insert(id.clone(), vec![PROD_NETWORK.to_string()]);
            s.workloads.push(Workload {
                id,
                name: name.into(),
                job_id,
                cluster: Some("cl-1".into()),
                os_hint: Some("linux".into()),
            });
        }
        self
    }

    /// Add a restore point `age` old
    #[must_use]
    pub fn with_restore_point(self, workload: &str, age: ChronoDuration, consistency: Consistency) -> Self {
        {
            let mut s = self.state.lock();
            let Some(w) = s.workloads.iter().find(|w| w.name == workload).cloned() else {
                panic!("unknown workload {workload}");
            };
            let job_name = s
                .jobs
                .iter()
                .find(|j| j.id == w.job_id)
                .map(|j| j.name.clone())
                .unwrap_or_default();
            let id = s.next("rp");
            s.restore_points.push(RestorePoint {
                id,
                workload: w,
                created_at: Utc::now() - age,
                consistency,
                size_bytes: Some(40 << 30),
                job_name,
            });
        }
        self
    }

    /// Workload with one application-consistent restore point an hour old
    #[must_use]
    pub fn with_protected_workload(self, job: &str, name: &str) -> Self {
        self.with_workload(job, name)
            .with_restore_point(name, ChronoDuration::hours(1), Consistency::ApplicationConsistent)
    }

    /// Original networks of a workload's adapters
    #[must_use]
    pub fn with_source_networks(self, workload: &str, networks: &[&str]) -> Self {
        {
            let mut s = self.state.lock();
            s.source_networks.insert(
                format!("w-{workload}"),
                networks.iter().map(|n| (*n).to_string()).collect(),
            );
        }
        self
    }

    /// Replace the cluster inventory
    #[must_use]
    pub fn with_clusters(self, clusters: Vec<Cluster>) -> Self {
        self.state.lock().clusters = clusters;
        self
    }

    /// Add a network that power-on checks treat as isolated
    #[must_use]
    pub fn with_isolated_network(self, network: Network) -> Self {
        {
            let mut s = self.state.lock();
            s.isolated.insert(network.id.clone());
            s.networks.push(network);
        }
        self
    }

    /// Inject a fault for one workload
    #[must_use]
    pub fn with_fault(self, workload: &str, fault: Fault) -> Self {
        self.inject(workload, fault);
        self
    }

    /// Inject a fault for every workload
    #[must_use]
    pub fn with_global_fault(self, fault: Fault) -> Self {
        self.state.lock().global_faults.insert(fault);
        self
    }

    /// Make the recovery endpoint probe fail
    #[must_use]
    pub fn with_probe_down(self) -> Self {
        self.state.lock().probe_down = true;
        self
    }

    /// Inject a fault after construction
    pub fn inject(&self, workload: &str, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(workload.to_string())
            .or_default()
            .insert(fault);
    }

    /// Power-on requests issued while attached to a non-isolated network
    #[must_use]
    pub fn unsafe_power_ons(&self) -> Vec<String> {
        self.state.lock().unsafe_power_ons.clone()
    }

    /// Network sets of every inventory read of the workload's instance
    #[must_use]
    pub fn observed_attachments(&self, workload: &str) -> Vec<Vec<String>> {
        self.state.lock().observed.get(workload).cloned().unwrap_or_default()
    }

    /// Mounts created for a workload
    #[must_use]
    pub fn mount_count(&self, workload: &str) -> usize {
        self.state.lock().mounts.values().filter(|m| m.workload == workload).count()
    }

    /// Stop calls across all mounts of a workload
    #[must_use]
    pub fn mount_stop_calls(&self, workload: &str) -> u32 {
        self.state
            .lock()
            .mounts
            .values()
            .filter(|m| m.workload == workload)
            .map(|m| m.stop_calls)
            .sum()
    }

    /// Every mount of the workload was stopped
    #[must_use]
    pub fn mounts_released(&self, workload: &str) -> bool {
        self.state
            .lock()
            .mounts
            .values()
            .filter(|m| m.workload == workload)
            .all(|m| m.stopped)
    }

    /// Delete calls for a workload's instances
    #[must_use]
    pub fn delete_calls(&self, workload: &str) -> u32 {
        self.state.lock().delete_calls.get(workload).copied().unwrap_or(0)
    }

    /// Names of instances still in inventory
    #[must_use]
    pub fn live_instances(&self) -> Vec<String> {
        self.state
            .lock()
            .instances
            .values()
            .map(|i| i.instance.name.clone())
            .collect()
    }

    /// Most instances that existed at the same time
    #[must_use]
    pub fn peak_live_instances(&self) -> usize {
        self.state.lock().live_peak
    }

    /// Full-copy restore requests received
    #[must_use]
    pub fn restore_requests(&self) -> Vec<FullRestoreRequest> {
        self.state
            .lock()
            .restore_jobs
            .values()
            .map(|j| j.request.clone())
            .collect()
    }

    /// Backup catalog calls served
    #[must_use]
    pub fn catalog_calls(&self) -> u32 {
        self.state.lock().catalog_calls
    }

    async fn delay(&self) {
        tokio::time::sleep(self.latency).await;
    }
}

#[async_trait]
impl BackupCatalogApi for FakeLab {
    async fn list_jobs(&self) -> Result<Vec<BackupJob>, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        s.catalog_calls += 1;
        Ok(s.jobs.clone())
    }

    async fn list_workloads(&self, job: &BackupJob) -> Result<Vec<Workload>, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        s.catalog_calls += 1;
        Ok(s.workloads.iter().filter(|w| w.job_id == job.id).cloned().collect())
    }

    async fn list_restore_points(
        &self,
        _job: &BackupJob,
        workload: &Workload,
    ) -> Result<Vec<RestorePoint>, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        s.catalog_calls += 1;
        Ok(s.restore_points
            .iter()
            .filter(|rp| rp.workload.id == workload.id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HypervisorApi for FakeLab {
    async fn find_instance(&self, name: &str) -> Result<Option<Instance>, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        let id = s
            .instances
            .values()
            .find(|i| i.instance.name == name)
            .map(|i| i.instance.id.clone());
        Ok(id.and_then(|id| s.observe(&id)))
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, ApiError> {
        self.delay().await;
        Ok(self.state.lock().observe(id))
    }

    async fn set_power(&self, id: &str, state: PowerState) -> Result<(), ApiError> {
        let endpoint = format!("vms/{id}/power");
        self.delay().await;

        let mut s = self.state.lock();
        let Some(workload) = s.workload_of_instance(id) else {
            return Err(not_found(&endpoint, "instance"));
        };
        match state {
            PowerState::Off if s.has(&workload, Fault::PowerOffFails) => {
                return Err(injected(&endpoint, "power off"));
            }
            PowerState::Off if s.has(&workload, Fault::PowerOffIgnored) => return Ok(()),
            PowerState::On if s.has(&workload, Fault::PowerOnIgnored) => return Ok(()),
            _ => {}
        }
        let no_address = s.has(&workload, Fault::NoAddress);
        let no_heartbeat = s.has(&workload, Fault::NoHeartbeat);

        let lab = &mut *s;
        let Some(entry) = lab.instances.get_mut(id) else {
            return Err(not_found(&endpoint, "instance"));
        };
        let vm = &mut entry.instance;
        let isolated = vm.networks.iter().all(|n| lab.isolated.contains(n));
        vm.power = state;
        if state == PowerState::On {
            vm.heartbeat = if no_heartbeat {
                HeartbeatState::Absent
            } else {
                HeartbeatState::Ok
            };
            if isolated && !no_address {
                let octet = lab.addresses_assigned.wrapping_add(2);
                lab.addresses_assigned = lab.addresses_assigned.wrapping_add(1);
                vm.addresses = vec![IpAddr::V4(Ipv4Addr::new(10, 99, 0, octet))];
            }
            if !isolated {
                lab.unsafe_power_ons.push(vm.name.clone());
            }
        } else {
            vm.heartbeat = HeartbeatState::Absent;
            vm.addresses.clear();
        }
        Ok(())
    }

    async fn attach_all_adapters(&self, id: &str, network_id: &str) -> Result<(), ApiError> {
        let endpoint = format!("vms/{id}/nics");
        self.delay().await;

        let mut s = self.state.lock();
        let Some(workload) = s.workload_of_instance(id) else {
            return Err(not_found(&endpoint, "instance"));
        };
        if s.has(&workload, Fault::PanicOnRewrite) {
            drop(s);
            panic!("injected panic during adapter rewrite of {workload}");
        }
        if s.has(&workload, Fault::RewriteFails) {
            return Err(injected(&endpoint, "adapter rewrite"));
        }
        if s.has(&workload, Fault::RewriteIgnored) {
            return Ok(());
        }
        if let Some(entry) = s.instances.get_mut(id) {
            for n in &mut entry.instance.networks {
                *n = network_id.to_string();
            }
        }
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ApiError> {
        self.delay().await;

        let mut s = self.state.lock();
        let Some(workload) = s.workload_of_instance(id) else {
            return Ok(());
        };
        *s.delete_calls.entry(workload.clone()).or_default() += 1;
        if s.has(&workload, Fault::DeleteFails) {
            return Err(injected(&format!("vms/{id}"), "delete"));
        }
        s.instances.remove(id);
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError> {
        self.delay().await;
        Ok(self.state.lock().clusters.clone())
    }

    async fn list_networks(&self) -> Result<Vec<Network>, ApiError> {
        self.delay().await;
        Ok(self.state.lock().networks.clone())
    }

    async fn list_storage_targets(&self) -> Result<Vec<StorageTarget>, ApiError> {
        self.delay().await;
        Ok(self.state.lock().storage_targets.clone())
    }
}

#[async_trait]
impl RecoveryApi for FakeLab {
    async fn start_instant_recovery(
        &self,
        restore_point: &RestorePoint,
        instance_name: &str,
    ) -> Result<MountHandle, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        let workload = restore_point.workload.name.clone();
        let networks = s
            .source_networks
            .get(&restore_point.workload.id)
            .cloned()
            .unwrap_or_else(|| vec![PROD_NETWORK.to_string()]);
        let powered = s.has(&workload, Fault::BootsPoweredOn);
        let visible = !s.has(&workload, Fault::InstanceNeverAppears);

        let instance_id = s.next("vm");
        let session_id = s.next("mount");
        s.insert_instance(
            Instance {
                id: instance_id.clone(),
                name: instance_name.to_string(),
                power: if powered { PowerState::On } else { PowerState::Off },
                heartbeat: HeartbeatState::Absent,
                networks,
                addresses: Vec::new(),
            },
            &workload,
            visible,
        );
        s.mounts.insert(
            session_id.clone(),
            MountRecord {
                instance_id,
                workload,
                stop_calls: 0,
                stopped: false,
            },
        );
        Ok(MountHandle { session_id })
    }

    async fn stop_instant_recovery(&self, mount: &MountHandle) -> Result<(), ApiError> {
        self.delay().await;
        let endpoint = format!("instantRecovery/{}/stop", mount.session_id);
        let mut s = self.state.lock();
        let Some(record) = s.mounts.get(&mount.session_id).cloned() else {
            return Err(not_found(&endpoint, "mount"));
        };
        if let Some(m) = s.mounts.get_mut(&mount.session_id) {
            m.stop_calls += 1;
        }
        if s.has(&record.workload, Fault::StopMountFails) {
            return Err(injected(&endpoint, "stop mount"));
        }
        if let Some(m) = s.mounts.get_mut(&mount.session_id) {
            m.stopped = true;
        }
        if !s.has(&record.workload, Fault::StopMountLeavesInstance) {
            s.instances.remove(&record.instance_id);
        }
        Ok(())
    }

    async fn restore_point_metadata(
        &self,
        restore_point: &RestorePoint,
    ) -> Result<RestorePointMetadata, ApiError> {
        self.delay().await;
        let s = self.state.lock();
        let networks = s
            .source_networks
            .get(&restore_point.workload.id)
            .cloned()
            .unwrap_or_default();
        Ok(RestorePointMetadata {
            adapters: networks
                .into_iter()
                .enumerate()
                .map(|(i, network_id)| AdapterInfo {
                    mac_address: Some(format!("00:50:56:00:00:{i:02x}")),
                    network_id,
                })
                .collect(),
            disks: Vec::new(),
            cluster_hint: restore_point.workload.cluster.clone(),
        })
    }

    async fn submit_full_restore(&self, request: &FullRestoreRequest) -> Result<AsyncJobRef, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        let Some(rp) = s
            .restore_points
            .iter()
            .find(|rp| rp.id == request.restore_point_id)
            .cloned()
        else {
            return Err(not_found("restore/full", "restore point"));
        };
        let source_networks = s.source_networks.get(&rp.workload.id).cloned().unwrap_or_default();
        let id = s.next("job");
        s.restore_jobs.insert(
            id.clone(),
            RestoreJobRecord {
                request: request.clone(),
                workload: rp.workload.name,
                source_networks,
                polls: 0,
                instance_created: false,
            },
        );
        Ok(AsyncJobRef { id })
    }

    async fn job_status(&self, job: &AsyncJobRef) -> Result<AsyncJobStatus, ApiError> {
        self.delay().await;
        let mut s = self.state.lock();
        let Some(mut record) = s.restore_jobs.get(&job.id).cloned() else {
            return Err(not_found("sessions", "job"));
        };
        record.polls += 1;

        let running = AsyncJobStatus {
            state: AsyncJobState::Running,
            result: AsyncJobResult::None,
            message: None,
        };
        let status = if s.has(&record.workload, Fault::RestoreJobHangs) || record.polls <= self.restore_job_polls {
            running
        } else if s.has(&record.workload, Fault::RestoreJobFails) {
            AsyncJobStatus {
                state: AsyncJobState::Finished,
                result: AsyncJobResult::Error,
                message: Some("injected restore failure".into()),
            }
        } else {
            if !record.instance_created {
                record.instance_created = true;
                let networks = if s.has(&record.workload, Fault::RestoreIgnoresRemap) {
                    record.source_networks.clone()
                } else {
                    record
                        .source_networks
                        .iter()
                        .map(|src| {
                            record
                                .request
                                .network_mappings
                                .iter()
                                .find(|m| m.source_network_id == *src)
                                .map_or_else(|| src.clone(), |m| m.target_network_id.clone())
                        })
                        .collect()
                };
                let id = s.next("vm");
                s.insert_instance(
                    Instance {
                        id,
                        name: record.request.instance_name.clone(),
                        power: PowerState::Off,
                        heartbeat: HeartbeatState::Absent,
                        networks,
                        addresses: Vec::new(),
                    },
                    &record.workload,
                    true,
                );
            }
            AsyncJobStatus {
                state: AsyncJobState::Finished,
                result: AsyncJobResult::Success,
                message: None,
            }
        };
        s.restore_jobs.insert(job.id.clone(), record);
        Ok(status)
    }

    async fn probe(&self) -> Result<(), ApiError> {
        self.delay().await;
        if self.state.lock().probe_down {
            return Err(ApiError::new(ApiErrorKind::Network, "api/v1/serverInfo", "connection refused"));
        }
        Ok(())
    }
}
