use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Engine configuration shared by the task module and the daemon binary.
///
/// Usually read from a TOML file; every field has a default so an empty
/// file is valid. CLI flags in the binary override individual values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Root directory for all engine state.
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database file.
    /// Defaults to `{data_dir}/autopilot.sqlite` if not specified.
    pub sqlite_path: Option<PathBuf>,

    /// Base working directory handed to scripts; browser sessions get a
    /// private subdirectory per account item below it.
    /// Defaults to `{data_dir}/work` if not specified.
    pub work_dir: Option<PathBuf>,

    /// Directory of per-task run lock files. Every process on this host
    /// that shares the database must use the same one.
    /// Defaults to `{data_dir}/run` if not specified.
    pub run_dir: Option<PathBuf>,

    /// Identity of this host, recorded on every task it runs and used by
    /// crash recovery. Falls back to the system host name.
    pub machine_id: Option<String>,

    /// Base64-encoded 32-byte AES-256-GCM key for account secrets.
    /// Without it, secrets are treated as stored in plaintext.
    pub secret_key: Option<String>,

    /// Force headless (`true`) or headed (`false`) sessions for every run
    /// started on this host. Unset keeps each task's own setting.
    pub headless: Option<bool>,

    /// Run crash recovery when the task module is constructed.
    pub reclaim_on_boot: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sqlite_path: None,
            work_dir: None,
            run_dir: None,
            machine_id: None,
            secret_key: None,
            headless: None,
            reclaim_on_boot: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, or return defaults if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ServiceError> {
        toml::from_str(content).map_err(|e| ServiceError::Config(format!("parse config: {e}")))
    }

    /// Resolve the SQLite database path, falling back to `{data_dir}/autopilot.sqlite`.
    pub fn resolve_sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("autopilot.sqlite"))
    }

    /// Resolve the script working directory.
    pub fn resolve_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("work"))
    }

    /// Resolve the run lock directory.
    pub fn resolve_run_dir(&self) -> PathBuf {
        self.run_dir
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("run"))
    }

    /// Resolve this host's identity: explicit setting, then the system
    /// host name, then `"localhost"`.
    pub fn resolve_machine_id(&self) -> String {
        self.machine_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn resolve_data_subpath(&self, name: &str) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|d| d.join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}
