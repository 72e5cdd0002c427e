use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::oauth::OAuthClient;

pub const CONFIG_FILE: &str = "agentrun.toml";
pub const DATA_DIR_ENV: &str = "AGENTRUN_DATA_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Relative paths resolve against the data dir.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,

    /// Vault key material. Defaults to a key bound to this host and user.
    #[serde(default)]
    pub vault_key: Option<String>,

    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    /// Refresh connector tokens this many seconds before they expire.
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: i64,

    /// Fail builds on unresolved `${{ ... }}` references unless a request
    /// says otherwise.
    #[serde(default = "default_check_env")]
    pub check_env: bool,

    /// OAuth apps by connector id, used for token refresh.
    #[serde(default)]
    pub oauth: BTreeMap<String, OAuthClient>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_database() -> PathBuf {
    PathBuf::from("agentrun.db")
}
fn default_blob_dir() -> PathBuf {
    PathBuf::from("blobs")
}
fn default_refresh_timeout() -> u64 {
    10
}
fn default_refresh_skew() -> i64 {
    60
}
fn default_check_env() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: default_database(),
            blob_dir: default_blob_dir(),
            vault_key: None,
            refresh_timeout_secs: default_refresh_timeout(),
            refresh_skew_secs: default_refresh_skew(),
            check_env: default_check_env(),
            oauth: BTreeMap::new(),
        }
    }
}

/// `$AGENTRUN_DATA_DIR`, else `~/.agentrun`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentrun")
}

impl PipelineConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: PipelineConfig = toml::from_str(&content)?;
        info!(
            "Loaded pipeline config: log_level={}, database={:?}, check_env={}, oauth_clients={}",
            config.log_level,
            config.database,
            config.check_env,
            config.oauth.len()
        );
        Ok(config)
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.database)
    }

    pub fn blob_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.blob_dir)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}
