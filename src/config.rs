//! Engine configuration
//!
//! Parsed from TOML. The engine does not own the configuration lifecycle:
//! the caller loads (or reloads) an [`AppConfig`] snapshot and hands it to
//! the engine, which atomically replaces its account set.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{CoreError, Result};
use crate::types::{Account, ProtocolKind};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configured mail accounts
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Spam classification settings, shared across accounts unless an
    /// account overrides the threshold
    #[serde(default)]
    pub spam: SpamConfig,

    /// Sync scheduler tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Classification pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Database file path; defaults to `<data dir>/nicemail/cache.db`
    pub db_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn has_accounts(&self) -> bool {
        !self.accounts.is_empty()
    }
}

/// How to connect to one mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Display name for the account
    pub name: String,

    /// Email address; also the account identifier
    pub address: String,

    /// Incoming server hostname
    pub incoming_server: String,

    /// Protocol to use
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolKind,

    /// Server port (default: 993 for IMAP over TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login username (defaults to the address)
    pub username: Option<String>,

    /// Password or credential reference
    pub password: Option<String>,

    /// Use TLS encryption
    #[serde(default = "default_true")]
    pub use_ssl: bool,

    /// Polling cadence override in seconds
    pub poll_interval_secs: Option<u64>,

    /// Spam threshold override for this account
    pub spam_threshold: Option<f32>,
}

impl AccountConfig {
    /// Session-immutable account record derived from this config entry
    pub fn to_account(&self) -> Account {
        Account {
            id: self.address.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            protocol: self.protocol,
            host: self.incoming_server.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_ssl: self.use_ssl,
        }
    }
}

/// Spam classification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    /// Provider name, informational
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key; absent or empty means classification is disabled
    pub api_key: Option<String>,

    /// Model identifier sent to the provider
    #[serde(default = "default_model")]
    pub model: String,

    /// Spam probability threshold in [0, 1]
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Feature flag; `false` disables classification even with a key
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl SpamConfig {
    /// Classification runs only when enabled and a non-empty key is set.
    /// When inactive every new message short-circuits to `not_evaluated`
    /// without any network call.
    pub fn is_active(&self) -> bool {
        self.enabled && self.api_key.as_deref().map_or(false, |k| !k.is_empty())
    }
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            model: default_model(),
            threshold: default_threshold(),
            enabled: true,
            api_base: default_api_base(),
        }
    }
}

/// Sync scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling cadence between successful sync cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// First backoff delay after a transient failure, in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Timeout applied to network operations, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Classification pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum messages per provider call
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Batch time window in milliseconds; a batch is dispatched when it is
    /// full or the window expires, whichever comes first
    #[serde(default = "default_batch_window")]
    pub batch_window_ms: u64,

    /// Attempts per message before giving up with `not_evaluated`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Provider request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            batch_window_ms: default_batch_window(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_protocol() -> ProtocolKind {
    ProtocolKind::Imap
}

fn default_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "chatgpt".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_threshold() -> f32 {
    0.6
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_backoff_base() -> u64 {
    2_000
}

fn default_backoff_cap() -> u64 {
    300_000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_batch() -> usize {
    10
}

fn default_batch_window() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    15
}

/// Load application configuration from disk
pub struct ConfigLoader;

impl ConfigLoader {
    /// Candidate config files, checked in order
    fn default_locations() -> Vec<PathBuf> {
        let mut locations = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            locations.push(config_dir.join("nicemail.toml"));
            locations.push(config_dir.join("nicemail").join("config.toml"));
        }
        locations
    }

    /// Load from `override_path` when given, otherwise the first default
    /// location that exists. A missing config is not an error; an empty
    /// configuration is returned.
    pub fn load(override_path: Option<&Path>) -> Result<AppConfig> {
        if let Some(path) = override_path {
            return Self::load_file(path);
        }
        for path in Self::default_locations() {
            if path.exists() {
                return Self::load_file(&path);
            }
        }
        info!("No configuration file found, starting with empty config");
        Ok(AppConfig::default())
    }

    fn load_file(path: &Path) -> Result<AppConfig> {
        info!("Loading configuration from {:?}", path);
        let content = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [[accounts]]
            name = "Personal"
            address = "grandma@example.com"
            incoming_server = "imap.example.com"
            username = "grandma"
            password = "hunter2"

            [spam]
            api_key = "sk-test"
            threshold = 0.7

            [scheduler]
            poll_interval_secs = 30
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.accounts.len(), 1);

        let account = &config.accounts[0];
        assert_eq!(account.protocol, ProtocolKind::Imap);
        assert_eq!(account.port, 993);
        assert!(account.use_ssl);

        assert!(config.spam.is_active());
        assert_eq!(config.spam.threshold, 0.7);
        assert_eq!(config.spam.model, "gpt-4o-mini");
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.pipeline.max_batch, 10);
    }

    #[test]
    fn test_spam_disabled_without_key() {
        let config = SpamConfig::default();
        assert!(!config.is_active());

        let empty_key = SpamConfig {
            api_key: Some(String::new()),
            ..SpamConfig::default()
        };
        assert!(!empty_key.is_active());

        let disabled = SpamConfig {
            api_key: Some("sk-test".into()),
            enabled: false,
            ..SpamConfig::default()
        };
        assert!(!disabled.is_active());
    }

    #[test]
    fn test_account_conversion() {
        let toml = r#"
            name = "Work"
            address = "me@work.example"
            incoming_server = "mail.work.example"
        "#;
        let account_config: AccountConfig = toml::from_str(toml).unwrap();
        let account = account_config.to_account();
        assert_eq!(account.id, "me@work.example");
        assert_eq!(account.login_user(), "me@work.example");
    }

    #[test]
    fn test_empty_config() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(!config.has_accounts());
        assert!(!config.spam.is_active());
    }
}
