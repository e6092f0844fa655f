//! Configuration loading and root folder resolution
//!
//! Every setting follows the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is never fatal: a warning is logged and defaults apply.
//! A TOML file that exists but cannot be parsed is a configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "HARVEST_ROOT_FOLDER";

/// Environment variable overriding the TOML config file location
pub const CONFIG_FILE_ENV: &str = "HARVEST_CONFIG";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "harvest.db";

/// Artifact store directory inside the root folder
pub const MODELS_DIR: &str = "models";

/// Logging section of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default tracing level ("trace", "debug", "info", "warn", "error")
    #[serde(default)]
    pub level: Option<String>,
}

/// `[pipeline]` section of the TOML file
///
/// Every field is optional here; defaults and environment overrides are
/// applied by the pipeline crate when it resolves its runtime config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    #[serde(default)]
    pub min_new_days: Option<u32>,
    #[serde(default)]
    pub improvement_threshold: Option<f64>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub fetch_concurrency: Option<usize>,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    #[serde(default)]
    pub lease_stale_secs: Option<u64>,
    #[serde(default)]
    pub lease_wait_secs: Option<u64>,
    #[serde(default)]
    pub training_timeout_secs: Option<u64>,
    #[serde(default)]
    pub min_training_snapshots: Option<usize>,
    #[serde(default)]
    pub metrics_base_url: Option<String>,
}

/// `[trainer]` section of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainerSection {
    /// Argument vector of the external trainer process
    #[serde(default)]
    pub command: Vec<String>,
}

/// One `[[entities]]` entry of the TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityEntry {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Parsed TOML configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub trainer: TrainerSection,
    #[serde(default)]
    pub entities: Vec<EntityEntry>,
}

/// Locate the TOML config file
///
/// Returns `None` when no candidate exists; callers then run on defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("harvest").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/harvest/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Load the TOML config file, falling back to defaults when it is missing
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        debug!("No config file found, using defaults");
        return Ok(TomlConfig::default());
    };

    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Resolve the root folder holding the database and the artifact store
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/harvest (or /var/lib/harvest for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("harvest"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/harvest"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("harvest"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/harvest"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("harvest"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\harvest"))
    } else {
        PathBuf::from("./harvest_data")
    }
}

/// Creates the root folder layout on first run
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root folder and the artifact store directory if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        std::fs::create_dir_all(self.models_path())?;
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }

    pub fn models_path(&self) -> PathBuf {
        self.root_folder.join(MODELS_DIR)
    }
}
