//! TOML Configuration File Support
//!
//! Centralized configuration loading for the hub, supporting a TOML file at
//! `~/.config/keyhub/keyhub.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`KEYHUB_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [rpc]
//! socket_path = "/run/user/1000/keyhub/modules.sock"
//! call_timeout_ms = 5000
//! registration_timeout_secs = 30
//!
//! [supervisor]
//! restart_delay_ms = 1000
//! stop_grace_ms = 5000
//!
//! [queues]
//! restart_concurrency = 4
//! render_concurrency = 4
//!
//! [satellite]
//! enabled = true
//! bind = "0.0.0.0:16622"
//!
//! [modules]
//! system_dir = "/usr/share/keyhub/modules"
//! user_dir = "/home/me/.local/share/keyhub/modules"
//!
//! [store]
//! data_dir = "/home/me/.local/share/keyhub/store"
//! flush_interval_secs = 30
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::RpcConfig;
use crate::satellite::SatelliteConfig;
use crate::supervisor::SupervisorConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration last came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[rpc]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcToml {
    /// Unix socket modules connect back to
    pub socket_path: Option<String>,
    /// Host-initiated call timeout in milliseconds
    pub call_timeout_ms: Option<u64>,
    /// Deadline for a launched module to register, in seconds
    pub registration_timeout_secs: Option<u64>,
}

/// `[supervisor]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorToml {
    /// Minimum sleep between restart attempts in milliseconds
    pub restart_delay_ms: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL in milliseconds
    pub stop_grace_ms: Option<u64>,
}

/// `[queues]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesToml {
    /// Connection transitions running at once
    pub restart_concurrency: Option<usize>,
    /// Render jobs running at once
    pub render_concurrency: Option<usize>,
}

/// `[satellite]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteToml {
    /// Whether to run the satellite server
    pub enabled: Option<bool>,
    /// Listen address
    pub bind: Option<String>,
    /// Upper clamp for KEYS_TOTAL
    pub max_keys_total: Option<u32>,
    /// Upper clamp for KEYS_PER_ROW
    pub max_keys_per_row: Option<u32>,
}

/// `[modules]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesToml {
    /// Directory of bundled modules
    pub system_dir: Option<String>,
    /// Directory of user-installed modules
    pub user_dir: Option<String>,
}

/// `[store]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Snapshot directory
    pub data_dir: Option<String>,
    /// Periodic flush interval in seconds
    pub flush_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubToml {
    /// RPC section
    pub rpc: RpcToml,
    /// Supervisor section
    pub supervisor: SupervisorToml,
    /// Queues section
    pub queues: QueuesToml,
    /// Satellite section
    pub satellite: SatelliteToml,
    /// Modules section
    pub modules: ModulesToml,
    /// Store section
    pub store: StoreToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Queue sizing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Connection transitions running at once
    pub restart_concurrency: usize,
    /// Render jobs running at once
    pub render_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            restart_concurrency: 4,
            render_concurrency: 4,
        }
    }
}

/// Where modules are installed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModulesConfig {
    /// Bundled modules
    pub system_dir: Option<PathBuf>,
    /// User-installed modules; replace bundled ones with the same id
    pub user_dir: Option<PathBuf>,
}

/// Store persistence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Snapshot directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Periodic flush interval
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Centralized configuration for the hub
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Module RPC settings
    pub rpc: RpcConfig,
    /// Process supervision settings
    pub supervisor: SupervisorConfig,
    /// Queue sizing
    pub queues: QueueConfig,
    /// Satellite server settings
    pub satellite: SatelliteConfig,
    /// Module directories
    pub modules: ModulesConfig,
    /// Store persistence
    pub store: StoreConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            supervisor: SupervisorConfig::default(),
            queues: QueueConfig::default(),
            satellite: SatelliteConfig::default(),
            modules: ModulesConfig::default(),
            store: StoreConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl HubConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the standard per-user module and store directories filled in
    #[must_use]
    pub fn with_standard_dirs() -> Self {
        let mut config = Self::default();
        config.modules.user_dir = dirs::data_dir().map(|p| p.join("keyhub").join("modules"));
        config.store.data_dir = dirs::data_dir().map(|p| p.join("keyhub").join("store"));
        config
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.call_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "rpc.call_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.queues.restart_concurrency == 0 || self.queues.render_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "queue concurrency must be at least 1".to_string(),
            ));
        }
        if self.store.flush_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "store.flush_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.satellite.max_keys_total == 0 || self.satellite.max_keys_per_row == 0 {
            return Err(ConfigError::ValidationError(
                "satellite key limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/keyhub/keyhub.toml` or
/// `~/.config/keyhub/keyhub.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("keyhub").join("keyhub.toml"))
}

/// Load configuration from the default path plus environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
pub fn load_config() -> Result<HubConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path plus environment
///
/// A missing file is not an error; defaults are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<HubConfig, ConfigError> {
    let mut config = HubConfig::with_standard_dirs();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: HubToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;
    Ok(config)
}

fn parse_bind(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse()
        .map_err(|e| ConfigError::ValidationError(format!("invalid satellite bind {raw:?}: {e}")))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut HubConfig, toml: &HubToml) -> Result<(), ConfigError> {
    // RPC settings
    if let Some(ref path) = toml.rpc.socket_path {
        config.rpc.socket_path = PathBuf::from(path);
    }
    if let Some(ms) = toml.rpc.call_timeout_ms {
        config.rpc.call_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.rpc.registration_timeout_secs {
        config.rpc.registration_timeout = Duration::from_secs(secs);
    }

    // Supervisor settings
    if let Some(ms) = toml.supervisor.restart_delay_ms {
        config.supervisor.restart_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.supervisor.stop_grace_ms {
        config.supervisor.stop_grace = Duration::from_millis(ms);
    }

    // Queue settings
    if let Some(n) = toml.queues.restart_concurrency {
        config.queues.restart_concurrency = n;
    }
    if let Some(n) = toml.queues.render_concurrency {
        config.queues.render_concurrency = n;
    }

    // Satellite settings
    if let Some(enabled) = toml.satellite.enabled {
        config.satellite.enabled = enabled;
    }
    if let Some(ref bind) = toml.satellite.bind {
        config.satellite.bind = parse_bind(bind)?;
    }
    if let Some(n) = toml.satellite.max_keys_total {
        config.satellite.max_keys_total = n;
    }
    if let Some(n) = toml.satellite.max_keys_per_row {
        config.satellite.max_keys_per_row = n;
    }

    // Module directories
    if let Some(ref dir) = toml.modules.system_dir {
        config.modules.system_dir = Some(PathBuf::from(dir));
    }
    if let Some(ref dir) = toml.modules.user_dir {
        config.modules.user_dir = Some(PathBuf::from(dir));
    }

    // Store settings
    if let Some(ref dir) = toml.store.data_dir {
        config.store.data_dir = Some(PathBuf::from(dir));
    }
    if let Some(secs) = toml.store.flush_interval_secs {
        config.store.flush_interval = Duration::from_secs(secs);
    }

    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut HubConfig) {
    if let Ok(path) = std::env::var("KEYHUB_RPC_SOCKET") {
        config.rpc.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Ok(timeout) = std::env::var("KEYHUB_CALL_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.rpc.call_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("KEYHUB_REGISTRATION_TIMEOUT_SECS") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.rpc.registration_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(delay) = std::env::var("KEYHUB_RESTART_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.supervisor.restart_delay = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(grace) = std::env::var("KEYHUB_STOP_GRACE_MS") {
        if let Ok(ms) = grace.parse::<u64>() {
            config.supervisor.stop_grace = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(enabled) = std::env::var("KEYHUB_SATELLITE") {
        config.satellite.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Ok(bind) = std::env::var("KEYHUB_SATELLITE_BIND") {
        match parse_bind(&bind) {
            Ok(addr) => {
                config.satellite.bind = addr;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring KEYHUB_SATELLITE_BIND"),
        }
    }
    if let Ok(dir) = std::env::var("KEYHUB_MODULES_DIR") {
        config.modules.user_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Ok(dir) = std::env::var("KEYHUB_DATA_DIR") {
        config.store.data_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// RPC socket path override
    pub rpc_socket: Option<PathBuf>,
    /// Store data directory override
    pub data_dir: Option<PathBuf>,
    /// Satellite bind override
    pub satellite_bind: Option<SocketAddr>,
    /// Satellite enabled override
    pub satellite_enabled: Option<bool>,
    /// User module directory override
    pub modules_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set RPC socket path override
    #[must_use]
    pub fn with_rpc_socket(mut self, path: PathBuf) -> Self {
        self.rpc_socket = Some(path);
        self
    }

    /// Set data directory override
    #[must_use]
    pub fn with_data_dir(mut self, path: PathBuf) -> Self {
        self.data_dir = Some(path);
        self
    }

    /// Set satellite bind override
    #[must_use]
    pub fn with_satellite_bind(mut self, addr: SocketAddr) -> Self {
        self.satellite_bind = Some(addr);
        self
    }

    /// Set satellite enabled override
    #[must_use]
    pub fn with_satellite_enabled(mut self, enabled: bool) -> Self {
        self.satellite_enabled = Some(enabled);
        self
    }

    /// Set user module directory override
    #[must_use]
    pub fn with_modules_dir(mut self, path: PathBuf) -> Self {
        self.modules_dir = Some(path);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut HubConfig) {
        if self.rpc_socket.is_some()
            || self.data_dir.is_some()
            || self.satellite_bind.is_some()
            || self.satellite_enabled.is_some()
            || self.modules_dir.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.rpc_socket {
            config.rpc.socket_path = path.clone();
        }
        if let Some(ref path) = self.data_dir {
            config.store.data_dir = Some(path.clone());
        }
        if let Some(addr) = self.satellite_bind {
            config.satellite.bind = addr;
        }
        if let Some(enabled) = self.satellite_enabled {
            config.satellite.enabled = enabled;
        }
        if let Some(ref path) = self.modules_dir {
            config.modules.user_dir = Some(path.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Clean up all environment variables used by config loading.
    fn clear_config_env_vars() {
        for var in [
            "KEYHUB_RPC_SOCKET",
            "KEYHUB_CALL_TIMEOUT_MS",
            "KEYHUB_REGISTRATION_TIMEOUT_SECS",
            "KEYHUB_RESTART_DELAY_MS",
            "KEYHUB_STOP_GRACE_MS",
            "KEYHUB_SATELLITE",
            "KEYHUB_SATELLITE_BIND",
            "KEYHUB_MODULES_DIR",
            "KEYHUB_DATA_DIR",
        ] {
            std::env::remove_var(var);
        }
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();

        assert_eq!(config.rpc.call_timeout, Duration::from_secs(5));
        assert_eq!(config.queues.restart_concurrency, 4);
        assert_eq!(config.queues.render_concurrency, 4);
        assert_eq!(config.satellite.bind.port(), 16622);
        assert!(config.satellite.enabled);
        assert!(config.store.data_dir.is_none());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("keyhub"));
            assert!(p.to_string_lossy().ends_with("keyhub.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let toml_content = r#"
[rpc]
socket_path = "/tmp/keyhub-test/modules.sock"
call_timeout_ms = 2500
registration_timeout_secs = 10

[supervisor]
restart_delay_ms = 250
stop_grace_ms = 1000

[queues]
restart_concurrency = 2
render_concurrency = 8

[satellite]
enabled = false
bind = "127.0.0.1:17000"
max_keys_total = 64

[modules]
system_dir = "/opt/keyhub/modules"

[store]
data_dir = "/var/lib/keyhub"
flush_interval_secs = 5
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.rpc.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.rpc.registration_timeout, Duration::from_secs(10));
        assert_eq!(config.supervisor.restart_delay, Duration::from_millis(250));
        assert_eq!(config.supervisor.stop_grace, Duration::from_secs(1));
        assert_eq!(config.queues.restart_concurrency, 2);
        assert_eq!(config.queues.render_concurrency, 8);
        assert!(!config.satellite.enabled);
        assert_eq!(config.satellite.max_keys_total, 64);
        assert_eq!(
            config.modules.system_dir,
            Some(PathBuf::from("/opt/keyhub/modules"))
        );
        assert_eq!(config.store.flush_interval, Duration::from_secs(5));
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let toml_content = r#"
[queues]
render_concurrency = 6
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.queues.render_concurrency, 6);
        assert_eq!(config.queues.restart_concurrency, 4);
    }

    #[test]
    fn test_invalid_bind_is_validation_error() {
        let toml_content = r#"
[satellite]
bind = "not an address"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let toml_content = r#"
[queues]
restart_concurrency = 0
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Missing / Malformed File Tests
    // =========================================================================

    #[test]
    fn test_missing_file_graceful() {
        clear_config_env_vars();

        let path = PathBuf::from("/nonexistent/path/keyhub.toml");
        let config = load_config_from_path(Some(path)).unwrap();

        // Env vars may leak in from parallel tests
        assert!(
            config.source() == ConfigSource::Default || config.source() == ConfigSource::Env,
            "Expected Default or Env source, got: {:?}",
            config.source()
        );
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let toml_content = r#"
[rpc
call_timeout_ms = "soon"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        clear_config_env_vars();

        let toml_content = r#"
[store]
data_dir = "/from/file"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        std::env::set_var("KEYHUB_DATA_DIR", "/from/env");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        std::env::remove_var("KEYHUB_DATA_DIR");

        assert_eq!(config.store.data_dir, Some(PathBuf::from("/from/env")));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_everything() {
        let mut config = HubConfig::default();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();

        ConfigOverrides::new()
            .with_rpc_socket(PathBuf::from("/tmp/cli.sock"))
            .with_satellite_bind(bind)
            .with_satellite_enabled(false)
            .apply(&mut config);

        assert_eq!(config.rpc.socket_path, PathBuf::from("/tmp/cli.sock"));
        assert_eq!(config.satellite.bind, bind);
        assert!(!config.satellite.enabled);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = HubConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
