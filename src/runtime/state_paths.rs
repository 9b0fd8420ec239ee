use super::RuntimeError;
use crate::shared::fs_atomic::{create_dir_all_with_mode, STATE_DIR_MODE};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("logs"),
            self.profiles_dir(),
            self.daemon_dir(),
            self.start_requests_dir(),
        ]
    }

    pub fn runs_db_path(&self) -> PathBuf {
        self.root.join("runs.db")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.root.join("logs/runtime.log")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn daemon_state_path(&self) -> PathBuf {
        self.daemon_dir().join("runtime.json")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    /// Start requests handed from `start --detach` to the daemon.
    pub fn start_requests_dir(&self) -> PathBuf {
        self.daemon_dir().join("requests")
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        create_dir_all_with_mode(&path, STATE_DIR_MODE).map_err(|source| {
            RuntimeError::CreateDir {
                path: path.display().to_string(),
                source,
            }
        })?;
    }
    Ok(())
}
