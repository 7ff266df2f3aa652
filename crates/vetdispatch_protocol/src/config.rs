//! Dispatch configuration, loaded from TOML.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What happens when a case reaches its deadline without an accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationMode {
    /// Expire the case and tell the owner
    #[default]
    Expire,
    /// Ask the candidate source again and notify newcomers, up to `escalation_max_rounds`
    Rebroadcast,
    /// Expire and flag the case for an operator
    OperatorReview,
}

/// Outbound notification transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SenderKind {
    /// Write messages to the log only (development)
    #[default]
    Log,
    /// POST each message as JSON to a mail relay
    Webhook,
}

/// Main configuration for the dispatch engine and its binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Path to the SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Base URL used to build response links in outbound messages
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// HTTP bind address for the respond endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_case_ttl")]
    pub case_ttl_secs: u64,

    #[serde(default = "default_emergency_case_ttl")]
    pub emergency_case_ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum concurrent sends during one fan-out
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Attempts per recipient, including the first one
    #[serde(default = "default_send_max_attempts")]
    pub send_max_attempts: u32,

    #[serde(default = "default_send_retry_base")]
    pub send_retry_base_ms: u64,

    #[serde(default = "default_selection_max_attempts")]
    pub selection_max_attempts: u32,

    #[serde(default = "default_selection_backoff_base")]
    pub selection_backoff_base_ms: u64,

    #[serde(default = "default_selection_backoff_max")]
    pub selection_backoff_max_ms: u64,

    #[serde(default)]
    pub escalation: EscalationMode,

    #[serde(default = "default_escalation_max_rounds")]
    pub escalation_max_rounds: u32,

    #[serde(default)]
    pub sender: SenderKind,

    /// Mail relay endpoint, required when `sender = "webhook"`
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Root directory for the database and logs: `$VETDISPATCH_HOME` or `~/.vetdispatch`.
pub fn vetdispatch_home() -> PathBuf {
    if let Ok(override_path) = std::env::var(defaults::HOME_ENV_VAR) {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(defaults::HOME_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(defaults::HOME_DIR_NAME))
}

fn default_database_path() -> String {
    vetdispatch_home()
        .join(defaults::DEFAULT_DATABASE_FILE)
        .to_string_lossy()
        .to_string()
}

fn default_public_base_url() -> String {
    defaults::DEFAULT_PUBLIC_BASE_URL.to_string()
}

fn default_bind_addr() -> String {
    defaults::DEFAULT_BIND_ADDR.to_string()
}

fn default_case_ttl() -> u64 {
    defaults::DEFAULT_CASE_TTL_SECS
}

fn default_emergency_case_ttl() -> u64 {
    defaults::DEFAULT_EMERGENCY_CASE_TTL_SECS
}

fn default_sweep_interval() -> u64 {
    defaults::DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_fanout_concurrency() -> usize {
    defaults::DEFAULT_FANOUT_CONCURRENCY
}

fn default_send_timeout() -> u64 {
    defaults::DEFAULT_SEND_TIMEOUT_MS
}

fn default_send_max_attempts() -> u32 {
    defaults::DEFAULT_SEND_MAX_ATTEMPTS
}

fn default_send_retry_base() -> u64 {
    defaults::DEFAULT_SEND_RETRY_BASE_MS
}

fn default_selection_max_attempts() -> u32 {
    defaults::DEFAULT_SELECTION_MAX_ATTEMPTS
}

fn default_selection_backoff_base() -> u64 {
    defaults::DEFAULT_SELECTION_BACKOFF_BASE_MS
}

fn default_selection_backoff_max() -> u64 {
    defaults::DEFAULT_SELECTION_BACKOFF_MAX_MS
}

fn default_escalation_max_rounds() -> u32 {
    defaults::DEFAULT_ESCALATION_MAX_ROUNDS
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            public_base_url: default_public_base_url(),
            bind_addr: default_bind_addr(),
            case_ttl_secs: default_case_ttl(),
            emergency_case_ttl_secs: default_emergency_case_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            fanout_concurrency: default_fanout_concurrency(),
            send_timeout_ms: default_send_timeout(),
            send_max_attempts: default_send_max_attempts(),
            send_retry_base_ms: default_send_retry_base(),
            selection_max_attempts: default_selection_max_attempts(),
            selection_backoff_base_ms: default_selection_backoff_base(),
            selection_backoff_max_ms: default_selection_backoff_max(),
            escalation: EscalationMode::default(),
            escalation_max_rounds: default_escalation_max_rounds(),
            sender: SenderKind::default(),
            webhook_url: None,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: DispatchConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fanout_concurrency == 0 {
            return Err(ConfigError::Invalid("fanout_concurrency must be > 0".into()));
        }
        if self.send_max_attempts == 0 {
            return Err(ConfigError::Invalid("send_max_attempts must be > 0".into()));
        }
        if self.selection_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "selection_max_attempts must be > 0".into(),
            ));
        }
        if self.case_ttl_secs == 0 || self.emergency_case_ttl_secs == 0 {
            return Err(ConfigError::Invalid("case TTLs must be > 0".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be > 0".into()));
        }
        if self.sender == SenderKind::Webhook
            && self
                .webhook_url
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(ConfigError::Invalid(
                "sender = \"webhook\" requires webhook_url".into(),
            ));
        }
        if !self.public_base_url.starts_with("http://")
            && !self.public_base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "public_base_url must be an http(s) URL, got '{}'",
                self.public_base_url
            )));
        }
        Ok(())
    }

    /// Time-to-live for a newly opened case.
    pub fn case_ttl(&self, is_emergency: bool) -> Duration {
        if is_emergency {
            Duration::from_secs(self.emergency_case_ttl_secs)
        } else {
            Duration::from_secs(self.case_ttl_secs)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = DispatchConfig::default();
        config.validate().unwrap();
        assert!(config.database_path.ends_with(defaults::DEFAULT_DATABASE_FILE));
        assert_eq!(config.escalation, EscalationMode::Expire);
        assert_eq!(config.case_ttl(true), Duration::from_secs(600));
        assert_eq!(config.case_ttl(false), Duration::from_secs(1_800));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: DispatchConfig = toml::from_str(
            r#"
            case_ttl_secs = 120
            escalation = "rebroadcast"
            escalation_max_rounds = 2
            "#,
        )
        .unwrap();
        assert_eq!(parsed.case_ttl_secs, 120);
        assert_eq!(parsed.escalation, EscalationMode::Rebroadcast);
        assert_eq!(parsed.fanout_concurrency, defaults::DEFAULT_FANOUT_CONCURRENCY);
    }

    #[test]
    fn test_webhook_requires_url() {
        let config = DispatchConfig {
            sender: SenderKind::Webhook,
            ..DispatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = DispatchConfig {
            fanout_concurrency: 0,
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vetdispatch.toml");
        let config = DispatchConfig {
            database_path: "dispatch.db".to_string(),
            sender: SenderKind::Webhook,
            webhook_url: Some("https://relay.example/send".to_string()),
            ..DispatchConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = DispatchConfig::load(&path).unwrap();
        assert_eq!(loaded.database_path, "dispatch.db");
        assert_eq!(loaded.sender, SenderKind::Webhook);
    }
}
