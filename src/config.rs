//! Configuration for the bank sync engine
//!
//! Layered: built-in defaults → optional TOML file → `BANK_SYNC__*`
//! environment variables (e.g. `BANK_SYNC__BANK__BASE_URL`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Upstream bank API
    #[serde(default)]
    pub bank: BankConfig,

    /// Pagination and pacing
    #[serde(default)]
    pub sync: SyncSettings,

    /// Orchestrator retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bank API configuration, including the client fingerprint sent in headers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    /// Base URL, without trailing slash. Required.
    #[serde(default)]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_os_name")]
    pub os_name: String,

    #[serde(default = "default_os_version")]
    pub os_version: String,

    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            origin: default_origin(),
            app_name: default_app_name(),
            app_version: default_app_version(),
            os_name: default_os_name(),
            os_version: default_os_version(),
            language: default_language(),
        }
    }
}

impl BankConfig {
    /// Configuration pointing at a mock server
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Pagination and upstream pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pause between list pages
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,

    /// Pause between transaction detail calls
    #[serde(default = "default_detail_delay")]
    pub detail_delay_ms: u64,

    /// Page the transaction list to completion instead of stopping at the
    /// first page that is not entirely new
    #[serde(default)]
    pub exhaustive_discovery: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_delay_ms: default_page_delay(),
            detail_delay_ms: default_detail_delay(),
            exhaustive_discovery: false,
        }
    }
}

impl SyncSettings {
    /// No pacing delays
    pub fn for_testing() -> Self {
        Self {
            page_delay_ms: 0,
            detail_delay_ms: 0,
            ..Default::default()
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn detail_delay(&self) -> Duration {
        Duration::from_millis(self.detail_delay_ms)
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Audit events older than this are deleted by maintenance
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u32,

    #[serde(default = "default_event_purge_batch")]
    pub event_purge_batch: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            event_retention_days: default_event_retention_days(),
            event_purge_batch: default_event_purge_batch(),
        }
    }
}

impl StorageConfig {
    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.event_retention_days))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_cors: true,
        }
    }
}

/// Periodic fan-out schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_accounts_interval")]
    pub accounts_interval_secs: u64,

    #[serde(default = "default_transactions_interval")]
    pub transactions_interval_secs: u64,

    /// Event retention and session purge
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            accounts_interval_secs: default_accounts_interval(),
            transactions_interval_secs: default_transactions_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36".to_string()
}

fn default_origin() -> String {
    "https://b2b.kapitalbank.uz".to_string()
}

fn default_app_name() -> String {
    "Uzum Business".to_string()
}

fn default_app_version() -> String {
    "2.2.0".to_string()
}

fn default_os_name() -> String {
    "Windows".to_string()
}

fn default_os_version() -> String {
    "10".to_string()
}

fn default_language() -> String {
    "ru-RU".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_page_delay() -> u64 {
    3_000
}

fn default_detail_delay() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    60
}

fn default_max_delay() -> u64 {
    15 * 60
}

fn default_database_path() -> String {
    "bank_sync.db".to_string()
}

fn default_event_retention_days() -> u32 {
    30
}

fn default_event_purge_batch() -> usize {
    1000
}

fn default_maintenance_interval() -> u64 {
    24 * 60 * 60
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_accounts_interval() -> u64 {
    4 * 60 * 60
}

fn default_transactions_interval() -> u64 {
    60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BANK_SYNC")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject configurations that cannot reach the bank
    pub fn validate(&self) -> Result<(), String> {
        if self.bank.base_url.trim().is_empty() {
            return Err("bank.base_url is not configured".to_string());
        }
        if self.sync.page_size == 0 {
            return Err("sync.page_size must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let settings = Settings::default();
        assert_eq!(settings.sync.page_size, 100);
        assert_eq!(settings.sync.page_delay(), Duration::from_secs(3));
        assert_eq!(settings.sync.detail_delay(), Duration::from_secs(1));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.bank.timeout(), Duration::from_secs(30));
        assert!(!settings.sync.exhaustive_discovery);
        assert_eq!(settings.storage.event_retention(), chrono::Duration::days(30));
        assert_eq!(settings.scheduler.maintenance_interval_secs, 86_400);
    }

    #[test]
    fn test_validate_requires_base_url() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_err());

        settings.bank.base_url = "https://bank.example".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[bank]\nbase_url = \"https://bank.example\"\n\n[sync]\npage_size = 25\nexhaustive_discovery = true"
        )
        .unwrap();

        let settings = Settings::load(file.path().to_str()).unwrap();

        assert_eq!(settings.bank.base_url, "https://bank.example");
        assert_eq!(settings.sync.page_size, 25);
        assert!(settings.sync.exhaustive_discovery);
        // untouched sections keep defaults
        assert_eq!(settings.retry.base_delay_secs, 60);
    }

    #[test]
    fn test_testing_sync_settings_have_no_delays() {
        let sync = SyncSettings::for_testing();
        assert_eq!(sync.page_delay(), Duration::ZERO);
        assert_eq!(sync.detail_delay(), Duration::ZERO);
        assert_eq!(sync.page_size, 100);
    }
}
