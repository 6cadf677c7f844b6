use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Runtime settings for a platform instance. Everything has a sensible
/// default; most deployments only set `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub data_dir: PathBuf,
    /// Seconds an interactive session stays valid.
    pub session_ttl_secs: i64,
    /// How long a cached relation map stays fresh before a read rebuilds it.
    pub schema_cache_ttl_secs: u64,
    /// How long a cached app health verdict stays fresh.
    pub health_cache_ttl_secs: u64,
    /// Per-probe timeout when checking app health.
    pub probe_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            session_ttl_secs: 60 * 60 * 24,
            schema_cache_ttl_secs: 30,
            health_cache_ttl_secs: 15,
            probe_timeout_secs: 5,
        }
    }
}

impl PlatformConfig {
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("warden.db")
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("bootstrap.toml")
    }

    #[must_use]
    pub fn schema_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_cache_ttl_secs)
    }

    #[must_use]
    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_ttl_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn load(path: &Path) -> Result<PlatformConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }
}

/// What bootstrap already did, persisted next to the database so a restart
/// recognizes its own prior work instead of redoing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapState {
    pub app_uuid: Option<Uuid>,
    /// Internal asset type uuids by entity name.
    #[serde(default)]
    pub internal_types: BTreeMap<String, Uuid>,
    #[serde(default)]
    pub admin_created: bool,
}

impl BootstrapState {
    pub fn load(path: &Path) -> Result<BootstrapState> {
        if !path.exists() {
            return Ok(BootstrapState::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("invalid bootstrap state: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize bootstrap state: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Installs the process-wide tracing subscriber, honoring `RUST_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
