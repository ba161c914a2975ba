use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::{EncryptionKey, EncryptionLevel};

/// Top-level configuration loaded from `~/.subfleet/config.toml`.
///
/// **Security**: this struct never stores bot tokens or the master key.
/// The master key is resolved at runtime by [`MasterKeyProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load config from `~/.subfleet/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fleet.validate()?;
        self.tasks.validate()?;
        self.recovery.validate()?;
        Ok(())
    }

    /// `~/.subfleet`, or `general.data_dir` when set.
    pub fn data_dir(&self) -> PathBuf {
        match &self.general.data_dir {
            Some(dir) => expand_home(dir),
            None => default_data_dir(),
        }
    }

    /// Resolved SQLite path; relative paths live under [`Config::data_dir`].
    pub fn storage_path(&self) -> PathBuf {
        let path = expand_home(&self.storage.path);
        if path.is_absolute() {
            path
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".subfleet")
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(raw),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("master key: {0}")]
    MasterKey(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            data_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Limits and timings for the instance manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_unregister_grace_secs")]
    pub unregister_grace_secs: u64,
    #[serde(default = "default_monitor_grace_secs")]
    pub monitor_grace_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            unregister_grace_secs: default_unregister_grace_secs(),
            monitor_grace_secs: default_monitor_grace_secs(),
        }
    }
}

impl FleetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::Validation(
                "fleet.max_instances must be at least 1".into(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "fleet.health_check_interval_secs must be at least 1".into(),
            ));
        }
        if self.probe_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "fleet.probe_timeout_secs and fleet.connect_timeout_secs must be at least 1"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn unregister_grace(&self) -> Duration {
        Duration::from_secs(self.unregister_grace_secs)
    }

    pub fn monitor_grace(&self) -> Duration {
        Duration::from_secs(self.monitor_grace_secs)
    }
}

fn default_max_instances() -> usize {
    10
}
fn default_health_check_interval_secs() -> u64 {
    60
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_unregister_grace_secs() -> u64 {
    10
}
fn default_monitor_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Worker slots shared by every ad-hoc operation in the process.
    #[serde(default = "default_task_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_task_concurrency(),
            shutdown_grace_secs: default_task_shutdown_grace_secs(),
        }
    }
}

impl TasksConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Validation(
                "tasks.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_task_concurrency() -> usize {
    8
}
fn default_task_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Automatic restarts allowed per instance inside the window.
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,
    /// Sliding window for restart attempts and error statistics.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
    /// Upper bound on retained error events.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_budget: default_restart_budget(),
            window_hours: default_window_hours(),
            max_events: default_max_events(),
        }
    }
}

/// One year.
pub const MAX_WINDOW_HOURS: u64 = 24 * 365;

impl RecoveryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_hours == 0 {
            return Err(ConfigError::Validation(
                "recovery.window_hours must be at least 1".into(),
            ));
        }
        if self.window_hours > MAX_WINDOW_HOURS {
            return Err(ConfigError::Validation(format!(
                "recovery.window_hours must be at most {MAX_WINDOW_HOURS}"
            )));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Validation(
                "recovery.max_events must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_restart_budget() -> u32 {
    3
}
fn default_window_hours() -> u64 {
    24
}
fn default_max_events() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub level: EncryptionLevel,
    /// Name of the env var holding the hex master key.
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
    /// Key file used when the env var is unset; created on first use.
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Credentials older than this audit as expired.
    #[serde(default)]
    pub max_token_age_days: Option<u32>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: EncryptionLevel::default(),
            master_key_env: default_master_key_env(),
            key_file: default_key_file(),
            max_token_age_days: None,
        }
    }
}

fn default_master_key_env() -> String {
    "SUBFLEET_MASTER_KEY".into()
}
fn default_key_file() -> String {
    "master.key".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String {
    "instances.db".into()
}

/// HTTP platform gateway used by the daemon's adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    #[serde(default = "default_gateway_identity_path")]
    pub identity_path: String,
    #[serde(default = "default_gateway_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default = "default_gateway_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            identity_path: default_gateway_identity_path(),
            auth_scheme: default_gateway_auth_scheme(),
            request_timeout_secs: default_gateway_request_timeout_secs(),
        }
    }
}

fn default_gateway_base_url() -> String {
    "https://discord.com/api/v10".into()
}
fn default_gateway_identity_path() -> String {
    "/users/@me".into()
}
fn default_gateway_auth_scheme() -> String {
    "Bot".into()
}
fn default_gateway_request_timeout_secs() -> u64 {
    15
}

// ---------------------------------------------------------------------------
// Master key provider
// ---------------------------------------------------------------------------

/// Resolves the master key used to derive credential keys.
///
/// 1. If the configured env var is set, its hex value is used.
/// 2. Otherwise the key file is read, or generated with 0o600 permissions.
pub struct MasterKeyProvider;

impl MasterKeyProvider {
    pub fn resolve(config: &Config) -> Result<EncryptionKey, ConfigError> {
        if let Ok(encoded) = std::env::var(&config.security.master_key_env) {
            return EncryptionKey::from_hex(&encoded).map_err(|e| {
                ConfigError::MasterKey(format!(
                    "{} is not a valid key: {e}",
                    config.security.master_key_env
                ))
            });
        }
        let path = {
            let raw = expand_home(&config.security.key_file);
            if raw.is_absolute() {
                raw
            } else {
                config.data_dir().join(raw)
            }
        };
        Self::load_or_create(&path)
    }

    /// Read a hex key file, creating it with a fresh key when missing.
    pub fn load_or_create(path: &Path) -> Result<EncryptionKey, ConfigError> {
        if path.exists() {
            let text =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            return EncryptionKey::from_hex(&text)
                .map_err(|e| ConfigError::MasterKey(format!("{}: {e}", path.display())));
        }

        let key = EncryptionKey::generate().map_err(|e| ConfigError::MasterKey(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, key.to_hex()).map_err(|e| ConfigError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        tracing::info!(path = %path.display(), "generated new master key file");
        Ok(key)
    }
}
