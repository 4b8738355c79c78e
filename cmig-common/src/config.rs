//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "cmig-migrate.toml";

/// Contents of `cmig-migrate.toml`
///
/// Every field is optional in the file; missing sections fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Folder holding the database and artifact store
    pub root_folder: Option<String>,
    /// HTTP listen address (e.g. "127.0.0.1:5740")
    pub bind_address: Option<String>,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorSettings,
    pub agent: AgentSettings,
    /// Actors allowed to approve mappings and purge runs (empty = everyone)
    pub approvers: Vec<String>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[orchestrator]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Attempts per vendor call before a VendorConnectionError escalates
    pub vendor_max_attempts: u32,
    /// Initial retry backoff, doubled per attempt
    pub vendor_backoff_ms: u64,
    /// Deadline imposed on every single connector call
    pub vendor_call_deadline_ms: u64,
    /// Staging records committed per promotion transaction
    pub promote_batch_size: usize,
    /// Records per entity type drawn into the sampling packet
    pub sample_size: usize,
    /// Issues retained per entity type in a validation report
    pub max_issues_per_entity: usize,
    /// Upper bound on retrying a locked SQLite database
    pub db_max_lock_wait_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            vendor_max_attempts: 3,
            vendor_backoff_ms: 200,
            vendor_call_deadline_ms: 30_000,
            promote_batch_size: 100,
            sample_size: 20,
            max_issues_per_entity: 100,
            db_max_lock_wait_ms: 5_000,
        }
    }
}

/// `[agent]` section (browser navigation agent)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Base URL of the navigation agent; absent disables browser extraction
    pub url: Option<String>,
    /// Bearer token sent to the agent
    pub api_key: Option<String>,
}

/// Config file resolution priority:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory (`~/.config/cmig/cmig-migrate.toml`)
///
/// Returns None when no file is found; callers then use defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        return Some(PathBuf::from(path));
    }

    dirs::config_dir()
        .map(|d| d.join("cmig").join(CONFIG_FILE_NAME))
        .filter(|p| p.exists())
}

/// Load and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load the config file if one resolves, else defaults
///
/// An explicitly named file that is missing or malformed is an error.
pub fn load_or_default(cli_arg: Option<&Path>, env_var_name: &str) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg, env_var_name) {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            load_toml_config(&path)
        }
        None => Ok(TomlConfig::default()),
    }
}

/// Root folder resolution priority:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.root_folder {
        return PathBuf::from(path);
    }

    default_root_folder()
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("cmig"))
        .unwrap_or_else(|| PathBuf::from("./cmig_data"))
}

/// Install the global tracing subscriber
///
/// RUST_LOG wins; otherwise the configured level is used.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", logging.level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: TomlConfig = toml::from_str("root_folder = \"/srv/cmig\"").unwrap();
        assert_eq!(config.root_folder.as_deref(), Some("/srv/cmig"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.orchestrator.vendor_max_attempts, 3);
        assert!(config.agent.url.is_none());
        assert!(config.approvers.is_empty());
    }

    #[test]
    fn test_partial_orchestrator_section() {
        let config: TomlConfig = toml::from_str(
            r#"
            [orchestrator]
            promote_batch_size = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.promote_batch_size, 7);
        assert_eq!(config.orchestrator.sample_size, 20);
    }

    #[test]
    fn test_cli_root_folder_wins() {
        let config = TomlConfig {
            root_folder: Some("/from/toml".to_string()),
            ..Default::default()
        };
        let root = resolve_root_folder(Some("/from/cli"), "CMIG_TEST_UNSET_ROOT", &config);
        assert_eq!(root, PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_toml_root_folder_used_without_cli_or_env() {
        let config = TomlConfig {
            root_folder: Some("/from/toml".to_string()),
            ..Default::default()
        };
        let root = resolve_root_folder(None, "CMIG_TEST_UNSET_ROOT", &config);
        assert_eq!(root, PathBuf::from("/from/toml"));
    }
}
