// Configuration file and derived runtime settings

use crate::remote::{ApiToken, HttpRemote};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Settings the sync engine reads at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Upper bound for one remote submission
    pub submit_timeout: Duration,
    /// Foreground wait after reconnecting before it drains
    pub reconnect_delay: Duration,
    /// Coarse timer for draining while online
    pub sync_interval: Duration,
    pub background_sync: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Config::default().settings()
    }
}

/// On-disk configuration (`config.yaml`). Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Directory holding `.tasksync/`; defaults to the user data dir
    pub store_path: Option<PathBuf>,
    pub submit_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub sync_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub background_sync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            api_key: None,
            api_secret: None,
            store_path: None,
            submit_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
            sync_interval_secs: 30,
            probe_interval_secs: 5,
            background_sync: true,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tasksync").join("config.yaml"))
    }

    /// Load from `path`, or from the default location. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => {
                debug!("No config directory, using defaults");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context(format!("Failed to read config {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&content).context(format!("Failed to parse config {}", path.display()))?;
        debug!(path = %path.display(), server = %config.server_url, "Config loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, serde_yaml::to_string(self)?).context(format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            background_sync: self.background_sync,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Credentials, only when both halves are set
    pub fn token(&self) -> Option<ApiToken> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some(ApiToken {
                key: key.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn remote(&self) -> Result<HttpRemote> {
        let remote = HttpRemote::new(&self.server_url, self.token(), Duration::from_millis(self.submit_timeout_ms))?;
        Ok(remote)
    }

    /// Directory the queue store lives under
    pub fn store_root(&self) -> Result<PathBuf> {
        if let Some(path) = &self.store_path {
            return Ok(expand_tilde(path));
        }
        dirs::data_dir()
            .map(|dir| dir.join("tasksync"))
            .ok_or_else(|| eyre::eyre!("No data directory; set store_path in the config"))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
