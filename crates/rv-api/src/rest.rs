//! REST adapters for the capability traits
//!
//! Wire records are private to this module. They deserialize loosely (every
//! field optional) and are converted into [`crate::contracts`] types at once,
//! so state strings never travel further than `into_*` below.

use crate::capabilities::{BackupCatalogApi, HypervisorApi, RecoveryApi};
use crate::client::{ApiConfig, ResilientApiClient};
use crate::contracts::{
    AdapterInfo, AsyncJobRef, AsyncJobResult, AsyncJobState, AsyncJobStatus, BackupJob, Cluster,
    ClusterHealth, Consistency, DiskInfo, FullRestoreRequest, HeartbeatState, Instance, JobResult,
    JobRunState, MountHandle, Network, PowerState, RestorePoint, RestorePointMetadata,
    StorageTarget, Workload,
};
use crate::error::ApiError;
use crate::token::{Authenticator, Token};
use crate::transport::{ApiRequest, HttpTransport, Method, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const TOKEN_ENDPOINT: &str = "api/oauth2/token";

/// Envelope used by list endpoints
#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

fn encode(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

fn required(endpoint: &str, field: &str, value: Option<String>) -> Result<String, ApiError> {
    value.ok_or_else(|| ApiError::decode(endpoint, format!("missing field `{field}`")))
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireToken {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Password/refresh-token grant against `api/oauth2/token`
pub struct HttpAuthenticator {
    transport: Arc<dyn Transport>,
    username: String,
    password: String,
}

impl HttpAuthenticator {
    /// Create an authenticator; the password is read from `config.password_env`
    ///
    /// # Errors
    /// `Auth` when the environment variable is unset, `Client` for a bad URL
    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        let password = std::env::var(&config.password_env).map_err(|_| {
            ApiError::auth(
                TOKEN_ENDPOINT,
                format!("environment variable {} is not set", config.password_env),
            )
        })?;
        let transport = HttpTransport::new(
            &config.base_url,
            config.request_timeout(),
            config.accept_invalid_certs,
        )?;
        Ok(Self::new(Arc::new(transport), config.username.clone(), password))
    }

    /// Create over an arbitrary transport
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, username: String, password: String) -> Self {
        Self {
            transport,
            username,
            password,
        }
    }

    async fn grant(&self, body: serde_json::Value) -> Result<Token, ApiError> {
        let request = ApiRequest::new(Method::Post, TOKEN_ENDPOINT).with_body(body);
        let response = self.transport.send(&request, None).await?;
        if !response.is_success() {
            let err = response.into_error(TOKEN_ENDPOINT);
            return Err(ApiError::auth(TOKEN_ENDPOINT, err.to_string()));
        }
        let wire: WireToken = response.json(TOKEN_ENDPOINT)?;
        let access = required(TOKEN_ENDPOINT, "access_token", wire.access_token)?;
        let ttl = Duration::from_secs(wire.expires_in.unwrap_or(900));
        Ok(Token::new(access, wire.refresh_token, ttl))
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self) -> Result<Token, ApiError> {
        self.grant(json!({
            "grant_type": "password",
            "username": self.username,
            "password": self.password,
        }))
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token, ApiError> {
        self.grant(json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }))
        .await
    }
}

/// Build a client for `config` with a password-grant authenticator
///
/// # Errors
/// See [`HttpAuthenticator::from_config`] and [`ResilientApiClient::from_config`]
pub fn connect(config: &ApiConfig) -> Result<ResilientApiClient, ApiError> {
    let auth = HttpAuthenticator::from_config(config)?;
    ResilientApiClient::from_config(config, Arc::new(auth))
}

// ---------------------------------------------------------------------------
// Backup catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJob {
    id: Option<String>,
    name: Option<String>,
    status: Option<String>,
    last_result: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireWorkload {
    id: Option<String>,
    name: Option<String>,
    cluster_name: Option<String>,
    guest_os: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRestorePoint {
    id: Option<String>,
    creation_time: Option<DateTime<Utc>>,
    consistency: Option<String>,
    backup_size: Option<u64>,
}

/// Backup catalog over REST
#[derive(Debug, Clone)]
pub struct RestBackupCatalog {
    client: ResilientApiClient,
}

impl RestBackupCatalog {
    /// Wrap a client
    #[must_use]
    pub fn new(client: ResilientApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackupCatalogApi for RestBackupCatalog {
    async fn list_jobs(&self) -> Result<Vec<BackupJob>, ApiError> {
        let endpoint = "api/v1/jobs";
        let page: Page<WireJob> = self.client.get(endpoint).await?;
        page.data
            .into_iter()
            .map(|w| {
                Ok(BackupJob {
                    id: required(endpoint, "id", w.id)?,
                    name: required(endpoint, "name", w.name)?,
                    state: JobRunState::from_wire(w.status.as_deref()),
                    last_result: JobResult::from_wire(w.last_result.as_deref()),
                })
            })
            .collect()
    }

    async fn list_workloads(&self, job: &BackupJob) -> Result<Vec<Workload>, ApiError> {
        let endpoint = format!("api/v1/jobs/{}/objects", encode(&job.id));
        let page: Page<WireWorkload> = self.client.get(&endpoint).await?;
        page.data
            .into_iter()
            .map(|w| {
                Ok(Workload {
                    id: required(&endpoint, "id", w.id)?,
                    name: required(&endpoint, "name", w.name)?,
                    job_id: job.id.clone(),
                    cluster: w.cluster_name,
                    os_hint: w.guest_os,
                })
            })
            .collect()
    }

    async fn list_restore_points(
        &self,
        job: &BackupJob,
        workload: &Workload,
    ) -> Result<Vec<RestorePoint>, ApiError> {
        let endpoint = format!("api/v1/objects/{}/restorePoints", encode(&workload.id));
        let page: Page<WireRestorePoint> = self.client.get(&endpoint).await?;
        page.data
            .into_iter()
            .map(|w| {
                Ok(RestorePoint {
                    id: required(&endpoint, "id", w.id)?,
                    workload: workload.clone(),
                    created_at: w.creation_time.ok_or_else(|| {
                        ApiError::decode(&endpoint, "missing field `creationTime`")
                    })?,
                    consistency: Consistency::from_wire(w.consistency.as_deref()),
                    size_bytes: w.backup_size,
                    job_name: job.name.clone(),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNic {
    network_id: Option<String>,
    #[serde(default)]
    ip_addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVm {
    id: Option<String>,
    name: Option<String>,
    power_state: Option<String>,
    guest_heartbeat: Option<String>,
    #[serde(default)]
    nics: Vec<WireNic>,
}

impl WireVm {
    fn into_instance(self, endpoint: &str) -> Result<Instance, ApiError> {
        let addresses = self
            .nics
            .iter()
            .flat_map(|n| n.ip_addresses.iter())
            .filter_map(|a| a.parse::<IpAddr>().ok())
            .collect();
        let networks = self
            .nics
            .into_iter()
            .map(|n| required(endpoint, "networkId", n.network_id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Instance {
            id: required(endpoint, "id", self.id)?,
            name: required(endpoint, "name", self.name)?,
            power: PowerState::from_wire(self.power_state.as_deref()),
            heartbeat: HeartbeatState::from_wire(self.guest_heartbeat.as_deref()),
            networks,
            addresses,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCluster {
    id: Option<String>,
    name: Option<String>,
    health: Option<String>,
    node_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNetwork {
    id: Option<String>,
    name: Option<String>,
    vlan_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStorage {
    id: Option<String>,
    name: Option<String>,
    cluster_id: Option<String>,
    free_bytes: Option<u64>,
}

/// Hypervisor control plane over REST
#[derive(Debug, Clone)]
pub struct RestHypervisor {
    client: ResilientApiClient,
}

impl RestHypervisor {
    /// Wrap a client
    #[must_use]
    pub fn new(client: ResilientApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HypervisorApi for RestHypervisor {
    async fn find_instance(&self, name: &str) -> Result<Option<Instance>, ApiError> {
        let endpoint = format!("api/v3/vms?name={}", encode(name));
        let page: Page<WireVm> = self.client.get(&endpoint).await?;
        page.data
            .into_iter()
            .map(|vm| vm.into_instance(&endpoint))
            .find(|r| r.as_ref().map_or(true, |i| i.name == name))
            .transpose()
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, ApiError> {
        let endpoint = format!("api/v3/vms/{}", encode(id));
        match self.client.get::<WireVm>(&endpoint).await {
            Ok(vm) => vm.into_instance(&endpoint).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_power(&self, id: &str, state: PowerState) -> Result<(), ApiError> {
        let endpoint = format!("api/v3/vms/{}/power", encode(id));
        self.client
            .send(Method::Post, &endpoint, Some(json!({ "state": state.as_wire() })))
            .await
    }

    async fn attach_all_adapters(&self, id: &str, network_id: &str) -> Result<(), ApiError> {
        let endpoint = format!("api/v3/vms/{}/nics", encode(id));
        self.client
            .send(Method::Put, &endpoint, Some(json!({ "networkId": network_id })))
            .await
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ApiError> {
        let endpoint = format!("api/v3/vms/{}", encode(id));
        match self.client.send(Method::Delete, &endpoint, None).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError> {
        let endpoint = "api/v3/clusters";
        let page: Page<WireCluster> = self.client.get(endpoint).await?;
        page.data
            .into_iter()
            .map(|w| {
                Ok(Cluster {
                    id: required(endpoint, "id", w.id)?,
                    name: required(endpoint, "name", w.name)?,
                    health: ClusterHealth::from_wire(w.health.as_deref()),
                    node_count: w.node_count.unwrap_or(0),
                })
            })
            .collect()
    }

    async fn list_networks(&self) -> Result<Vec<Network>, ApiError> {
        let endpoint = "api/v3/networks";
        let page: Page<WireNetwork> = self.client.get(endpoint).await?;
        page.data
            .into_iter()
            .map(|w| {
                let segment_id = match w.vlan_id {
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
                    _ => None,
                };
                Ok(Network {
                    id: required(endpoint, "id", w.id)?,
                    name: required(endpoint, "name", w.name)?,
                    segment_id,
                })
            })
            .collect()
    }

    async fn list_storage_targets(&self) -> Result<Vec<StorageTarget>, ApiError> {
        let endpoint = "api/v3/storage";
        let page: Page<WireStorage> = self.client.get(endpoint).await?;
        page.data
            .into_iter()
            .map(|w| {
                Ok(StorageTarget {
                    id: required(endpoint, "id", w.id)?,
                    name: required(endpoint, "name", w.name)?,
                    cluster_id: w.cluster_id,
                    free_bytes: w.free_bytes,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Recovery control
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMount {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAdapter {
    mac_address: Option<String>,
    network_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDisk {
    id: Option<String>,
    size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMetadata {
    #[serde(default)]
    network_adapters: Vec<WireAdapter>,
    #[serde(default)]
    disks: Vec<WireDisk>,
    cluster_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJobRef {
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSession {
    state: Option<String>,
    result: Option<String>,
    message: Option<String>,
}

/// Recovery control plane over REST
#[derive(Debug, Clone)]
pub struct RestRecoveryControl {
    client: ResilientApiClient,
}

impl RestRecoveryControl {
    /// Wrap a client
    #[must_use]
    pub fn new(client: ResilientApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RecoveryApi for RestRecoveryControl {
    async fn start_instant_recovery(
        &self,
        restore_point: &RestorePoint,
        instance_name: &str,
    ) -> Result<MountHandle, ApiError> {
        let endpoint = "api/v1/restore/instantRecovery";
        let wire: WireMount = self
            .client
            .post(
                endpoint,
                json!({
                    "restorePointId": restore_point.id,
                    "vmName": instance_name,
                    "powerUp": false,
                    "reason": "recovery verification",
                }),
            )
            .await?;
        Ok(MountHandle {
            session_id: required(endpoint, "sessionId", wire.session_id)?,
        })
    }

    async fn stop_instant_recovery(&self, mount: &MountHandle) -> Result<(), ApiError> {
        let endpoint = format!(
            "api/v1/restore/instantRecovery/{}/stop",
            encode(&mount.session_id)
        );
        match self.client.send(Method::Post, &endpoint, None).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn restore_point_metadata(
        &self,
        restore_point: &RestorePoint,
    ) -> Result<RestorePointMetadata, ApiError> {
        let endpoint = format!("api/v1/restorePoints/{}/metadata", encode(&restore_point.id));
        let wire: WireMetadata = self.client.get(&endpoint).await?;
        let adapters = wire
            .network_adapters
            .into_iter()
            .map(|a| {
                Ok(AdapterInfo {
                    mac_address: a.mac_address,
                    network_id: required(&endpoint, "networkId", a.network_id)?,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;
        let disks = wire
            .disks
            .into_iter()
            .map(|d| {
                Ok(DiskInfo {
                    id: required(&endpoint, "id", d.id)?,
                    size_bytes: d.size_bytes,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;
        Ok(RestorePointMetadata {
            adapters,
            disks,
            cluster_hint: wire.cluster_id,
        })
    }

    async fn submit_full_restore(
        &self,
        request: &FullRestoreRequest,
    ) -> Result<AsyncJobRef, ApiError> {
        let endpoint = "api/v1/restore/full";
        let body = serde_json::to_value(request)
            .map_err(|e| ApiError::decode(endpoint, e.to_string()))?;
        let wire: WireJobRef = self.client.post(endpoint, body).await?;
        Ok(AsyncJobRef {
            id: required(endpoint, "jobId", wire.job_id)?,
        })
    }

    async fn job_status(&self, job: &AsyncJobRef) -> Result<AsyncJobStatus, ApiError> {
        let endpoint = format!("api/v1/sessions/{}", encode(&job.id));
        let wire: WireSession = self.client.get(&endpoint).await?;
        Ok(AsyncJobStatus {
            state: AsyncJobState::from_wire(wire.state.as_deref()),
            result: AsyncJobResult::from_wire(wire.result.as_deref()),
            message: wire.message,
        })
    }

    async fn probe(&self) -> Result<(), ApiError> {
        self.client.send(Method::Get, "api/v1/serverInfo", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::ApiResponse;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Replies from a fixed table keyed by endpoint
    struct TableTransport {
        replies: Vec<(String, ApiResponse)>,
        seen: Mutex<Vec<ApiRequest>>,
    }

    #[async_trait]
    impl Transport for TableTransport {
        async fn send(
            &self,
            request: &ApiRequest,
            _bearer: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            self.seen.lock().push(request.clone());
            Ok(self
                .replies
                .iter()
                .find(|(e, _)| *e == request.endpoint)
                .map_or_else(
                    || ApiResponse::new(404, json!({"message": "no route"})),
                    |(_, r)| r.clone(),
                ))
        }
    }

    fn client(replies: Vec<(&str, Value)>) -> (ResilientApiClient, Arc<TableTransport>) {
        let transport = Arc::new(TableTransport {
            replies: replies
                .into_iter()
                .map(|(e, v)| (e.to_string(), ApiResponse::new(200, v)))
                .collect(),
            seen: Mutex::new(Vec::new()),
        });
        (
            ResilientApiClient::new(transport.clone(), None, RetryPolicy::default()),
            transport,
        )
    }

    #[tokio::test]
    async fn vm_decodes_into_closed_enums() {
        let (c, _) = client(vec![(
            "api/v3/vms/vm-1",
            json!({
                "id": "vm-1", "name": "DB01", "powerState": "PoweredOff",
                "guestHeartbeat": "weird-value",
                "nics": [{"networkId": "net-iso", "ipAddresses": ["10.9.0.4", "garbage"]}]
            }),
        )]);
        let vm = RestHypervisor::new(c).get_instance("vm-1").await.unwrap().unwrap();
        assert_eq!(vm.power, PowerState::Off);
        assert_eq!(vm.heartbeat, HeartbeatState::Unknown);
        assert_eq!(vm.networks, vec!["net-iso".to_string()]);
        assert_eq!(vm.addresses.len(), 1);
    }

    #[tokio::test]
    async fn missing_vm_is_none() {
        let (c, _) = client(vec![]);
        assert!(RestHypervisor::new(c).get_instance("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_id_is_a_decode_error() {
        let (c, _) = client(vec![("api/v1/jobs", json!({"data": [{"name": "nightly"}]}))]);
        let err = RestBackupCatalog::new(c).list_jobs().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ApiErrorKind::Decode);
    }

    #[tokio::test]
    async fn full_restore_sends_remap_payload() {
        let (c, t) = client(vec![("api/v1/restore/full", json!({"jobId": "job-7"}))]);
        let request = FullRestoreRequest {
            restore_point_id: "rp-1".into(),
            instance_name: "DB01-verify".into(),
            cluster_id: None,
            storage_target_id: "ctr-1".into(),
            network_mappings: vec![crate::contracts::NetworkMapping {
                source_network_id: "net-prod".into(),
                target_network_id: "net-iso".into(),
            }],
            power_on_after_restore: false,
        };
        let job = RestRecoveryControl::new(c).submit_full_restore(&request).await.unwrap();
        assert_eq!(job.id, "job-7");
        let sent = t.seen.lock()[0].body.clone().unwrap();
        assert_eq!(sent["networkMappings"][0]["targetNetworkId"], "net-iso");
        assert_eq!(sent["powerOnAfterRestore"], false);
    }

    #[test]
    fn path_segments_are_encoded() {
        assert_eq!(encode("DB 01/a"), "DB%2001%2Fa");
        assert_eq!(encode("vm-1_x.y"), "vm-1_x.y");
    }
}
