//! RVX API - remote control plane access
//!
//! Everything the verification engine needs from the outside world:
//! - [`ResilientApiClient`]: bearer token lifecycle, 401 refresh, bounded retry
//! - [`contracts`]: typed records with closed state enumerations
//! - [`capabilities`]: backup catalog, hypervisor and recovery control traits
//! - [`rest`]: REST adapters implementing those traits
//!
//! # Example
//!
//! ```rust,ignore
//! use rv_api::{rest, ApiConfig, BackupCatalogApi, RestBackupCatalog};
//!
//! # async fn example() -> Result<(), rv_api::ApiError> {
//! let client = rest::connect(&ApiConfig::new("https://backup.example:9419/"))?;
//! let catalog = RestBackupCatalog::new(client);
//! for job in catalog.list_jobs().await? {
//!     println!("{} ({:?})", job.name, job.last_result);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod capabilities;
pub mod client;
pub mod contracts;
pub mod error;
pub mod rest;
pub mod retry;
pub mod token;
pub mod transport;

pub use capabilities::{BackupCatalogApi, HypervisorApi, RecoveryApi};
pub use client::{ApiConfig, ResilientApiClient};
pub use contracts::{
    AdapterInfo, AsyncJobRef, AsyncJobResult, AsyncJobState, AsyncJobStatus, BackupJob, Cluster,
    ClusterHealth, Consistency, DiskInfo, FullRestoreRequest, HeartbeatState, Instance, JobResult,
    JobRunState, MountHandle, Network, NetworkMapping, PowerState, RestorePoint,
    RestorePointMetadata, StorageTarget, Workload,
};
pub use error::{ApiError, ApiErrorKind};
pub use rest::{HttpAuthenticator, RestBackupCatalog, RestHypervisor, RestRecoveryControl};
pub use retry::{RetryPolicy, RetryStep};
pub use token::{Authenticator, Token, TokenManager};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
