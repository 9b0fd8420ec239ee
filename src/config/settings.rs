use super::ConfigError;
use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Root for the run database, profiles and logs. Defaults to `~/.runcast`.
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HubSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_read_idle_timeout_secs")]
    pub read_idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub max_run_duration_secs: Option<u64>,
    #[serde(default = "default_repository_retry_budget")]
    pub repository_retry_budget: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_approval_poll_ms")]
    pub approval_poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_read_idle_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_repository_retry_budget() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_approval_poll_ms() -> u64 {
    250
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            read_idle_timeout_secs: default_read_idle_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_run_duration_secs: None,
            repository_retry_budget: default_repository_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
            approval_poll_ms: default_approval_poll_ms(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: None,
            hub: HubSettings::default(),
            engine: EngineSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl HubSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl EngineSettings {
    pub fn max_run_duration(&self) -> Option<Duration> {
        self.max_run_duration_secs.map(Duration::from_secs)
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let body = serde_yaml::to_string(self).map_err(|source| ConfigError::Encode {
            path: path.display().to_string(),
            source,
        })?;
        atomic_write_file(path, body.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(root) = self.state_root.as_ref() {
            if !root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`state_root` must be an absolute path".to_string(),
                ));
            }
        }
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::Settings(
                "`hub.queue_capacity` must be at least 1".to_string(),
            ));
        }
        if self.hub.keepalive_interval_secs == 0 || self.hub.sweep_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "`hub.keepalive_interval_secs` and `hub.sweep_interval_ms` must be non-zero"
                    .to_string(),
            ));
        }
        if self.hub.read_idle_timeout_secs <= self.hub.keepalive_interval_secs {
            return Err(ConfigError::Settings(
                "`hub.read_idle_timeout_secs` must exceed `hub.keepalive_interval_secs`"
                    .to_string(),
            ));
        }
        if self.engine.max_run_duration_secs == Some(0) {
            return Err(ConfigError::Settings(
                "`engine.max_run_duration_secs` must be non-zero when set".to_string(),
            ));
        }
        if self.engine.approval_poll_ms == 0 {
            return Err(ConfigError::Settings(
                "`engine.approval_poll_ms` must be non-zero".to_string(),
            ));
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`server.bind` must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, ConfigError> {
        match self.state_root.as_ref() {
            Some(root) => Ok(root.clone()),
            None => super::default_state_root(),
        }
    }
}
