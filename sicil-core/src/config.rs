//! Configuration management for Sicil.
//!
//! Configuration is loaded in order of precedence:
//! 1. Defaults
//! 2. Config file (~/.sicil/config.toml)
//! 3. Environment variables
//! 4. CLI flags (handled at CLI layer)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Remote dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Where the JSON dataset is downloaded from
    #[serde(default)]
    pub url: String,

    /// A snapshot younger than this is served without refetching
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Upper bound for a single download
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Serve the previous snapshot when a refresh fails instead of failing the lookup
    #[serde(default)]
    pub serve_stale: bool,

    /// Field holding the record array of a page element
    #[serde(default = "default_page_field")]
    pub page_field: String,

    /// Identifier field of the record subject
    #[serde(default = "default_subject_field")]
    pub subject_field: String,

    /// Identifier field of the agent (counsel) attached to the record
    #[serde(default = "default_agent_field")]
    pub agent_field: String,
}

fn default_refresh_interval_secs() -> u64 {
    900
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_page_field() -> String {
    "Veri".to_string()
}

fn default_subject_field() -> String {
    "KISI_TC_KIMLIK_NO".to_string()
}

fn default_agent_field() -> String {
    "AVUKAT_TC_KIMLIK_NO".to_string()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            refresh_interval_secs: default_refresh_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            serve_stale: false,
            page_field: default_page_field(),
            subject_field: default_subject_field(),
            agent_field: default_agent_field(),
        }
    }
}

impl DatasetConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Quota ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Database path (defaults to ~/.sicil/users.db)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Lookups granted to a freshly created account
    #[serde(default = "default_initial_searches")]
    pub initial_searches: i64,

    /// Invites needed before the referral bonus is granted. Never below
    /// [`MIN_BONUS_THRESHOLD`]: a bonus holder has always invited at least that many.
    #[serde(default = "default_bonus_threshold")]
    pub bonus_threshold: i64,

    /// Lookups added by the one-time referral bonus
    #[serde(default = "default_bonus_amount")]
    pub bonus_amount: i64,
}

/// Lowest accepted `ledger.bonus_threshold`
pub const MIN_BONUS_THRESHOLD: i64 = 3;

fn default_initial_searches() -> i64 {
    3
}

fn default_bonus_threshold() -> i64 {
    3
}

fn default_bonus_amount() -> i64 {
    30
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            initial_searches: default_initial_searches(),
            bonus_threshold: default_bonus_threshold(),
            bonus_amount: default_bonus_amount(),
        }
    }
}

/// Referral configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferralConfig {
    /// Prefix the user id is appended to, e.g. `https://t.me/<bot>?start=`
    #[serde(default)]
    pub link_prefix: String,
}

/// Membership gate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Groups a user must belong to before using the service
    #[serde(default)]
    pub required_groups: Vec<String>,

    /// Bot token used to query group membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub referral: ReferralConfig,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Returns the default Sicil configuration directory (~/.sicil)
    pub fn sicil_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".sicil"))
    }

    /// Returns the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::sicil_dir().map(|d| d.join("config.toml"))
    }

    /// Returns the default database path
    pub fn default_db_path() -> Option<PathBuf> {
        Self::sicil_dir().map(|d| d.join("users.db"))
    }

    /// Database path from config, falling back to the default location
    pub fn db_path(&self) -> Option<PathBuf> {
        self.ledger.db_path.clone().or_else(Self::default_db_path)
    }

    /// Load configuration from the default path with environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("SICIL_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        // PORT is what most hosting platforms inject
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Ok(host) = std::env::var("SICIL_HOST") {
            self.server.host = host;
        }

        if let Ok(url) = std::env::var("SICIL_DATASET_URL") {
            self.dataset.url = url;
        }

        if let Ok(secs) = std::env::var("SICIL_REFRESH_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                self.dataset.refresh_interval_secs = secs;
            }
        }

        if let Ok(path) = std::env::var("SICIL_DB_PATH") {
            self.ledger.db_path = Some(PathBuf::from(path));
        }

        if let Ok(token) = std::env::var("SICIL_BOT_TOKEN") {
            self.membership.bot_token = Some(token);
        }

        if let Ok(prefix) = std::env::var("SICIL_REFERRAL_LINK_PREFIX") {
            self.referral.link_prefix = prefix;
        }

        if let Ok(level) = std::env::var("SICIL_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Reject values the services cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.fetch_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dataset.fetch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.ledger.initial_searches < 0 || self.ledger.bonus_amount < 0 {
            return Err(ConfigError::ValidationError(
                "ledger quotas must not be negative".to_string(),
            ));
        }
        if self.ledger.bonus_threshold < MIN_BONUS_THRESHOLD {
            return Err(ConfigError::ValidationError(format!(
                "ledger.bonus_threshold must be at least {}",
                MIN_BONUS_THRESHOLD
            )));
        }
        if !self.membership.required_groups.is_empty() && self.membership.bot_token.is_none() {
            return Err(ConfigError::ValidationError(
                "membership.required_groups needs membership.bot_token".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to a specific file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get the server URL
    pub fn server_url(&self) -> String {
        let host = if self.server.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.server.host.as_str()
        };
        format!("http://{}:{}", host, self.server.port)
    }

    /// Ensure the Sicil directory exists
    pub fn ensure_dirs() -> std::io::Result<()> {
        if let Some(dir) = Self::sicil_dir() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.dataset.refresh_interval_secs, 900);
        assert_eq!(config.dataset.page_field, "Veri");
        assert_eq!(config.dataset.subject_field, "KISI_TC_KIMLIK_NO");
        assert_eq!(config.dataset.agent_field, "AVUKAT_TC_KIMLIK_NO");
        assert!(!config.dataset.serve_stale);
        assert_eq!(config.ledger.initial_searches, 3);
        assert_eq!(config.ledger.bonus_threshold, 3);
        assert_eq!(config.ledger.bonus_amount, 30);
        assert!(config.membership.required_groups.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.server.port, parsed.server.port);
        assert_eq!(config.dataset.page_field, parsed.dataset.page_field);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[dataset]
url = "https://example.org/registry.json"
serve_stale = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dataset.url, "https://example.org/registry.json");
        assert!(config.dataset.serve_stale);
        // Defaults still applied
        assert_eq!(config.dataset.fetch_timeout_secs, 60);
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_bonus_threshold_floor() {
        let mut config = Config::default();
        config.ledger.bonus_threshold = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.ledger.bonus_threshold = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_groups_require_token() {
        let mut config = Config::default();
        config.membership.required_groups = vec!["@registry_news".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.membership.bot_token = Some("123:abc".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.server.port = 8088;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 8088);
    }
}
