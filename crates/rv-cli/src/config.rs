//! CLI configuration file
//!
//! The run settings sit at the top level; connection settings for the three
//! control planes live under `[api.*]`:
//!
//! ```toml
//! isolated_network = "verify-vlan-999"
//!
//! [api.backup]
//! base_url = "https://backup.example:9419/"
//! username = "svc-verify"
//!
//! [api.hypervisor]
//! base_url = "https://cluster.example:9440/"
//! username = "svc-verify"
//! password_env = "RVX_HYPERVISOR_PASSWORD"
//!
//! [api.recovery]
//! base_url = "https://backup.example:9419/"
//! username = "svc-verify"
//! ```

use anyhow::{Context, Result};
use rv_api::ApiConfig;
use rv_core::RunConfig;
use serde::Deserialize;
use std::path::Path;

/// Connection settings per control plane
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ApiSection {
    pub(crate) backup: ApiConfig,
    pub(crate) hypervisor: ApiConfig,
    pub(crate) recovery: ApiConfig,
}

/// Whole configuration file
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CliConfig {
    #[serde(flatten)]
    pub(crate) run: RunConfig,
    #[serde(default)]
    pub(crate) api: ApiSection,
}

impl CliConfig {
    pub(crate) fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid configuration")?;
        config.run.validate()?;
        for (name, api) in [
            ("backup", &config.api.backup),
            ("hypervisor", &config.api.hypervisor),
            ("recovery", &config.api.recovery),
        ] {
            if api.base_url.trim().is_empty() {
                anyhow::bail!("api.{name}.base_url must be set");
            }
        }
        Ok(config)
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}
