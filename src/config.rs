//! Configuration management
//!
//! Settings are loaded once at startup from a TOML file. Accounts with a
//! blank host, username or password are kept in the list but skipped by the
//! coordinator with a warning; a malformed file is process-fatal.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::supervisor::SupervisorConfig;

/// Top-level settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Mailbox accounts to synchronize
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub indexer: IndexerSettings,

    #[serde(default)]
    pub classifier: ClassifierSettings,
}

/// One IMAP account. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier used in status records and message records
    pub id: String,

    /// IMAP server hostname
    #[serde(default)]
    pub host: String,

    /// IMAP server port (993 for implicit TLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl AccountConfig {
    /// An account missing host, username or password is skipped entirely.
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
            && !self.username.trim().is_empty()
            && !self.password.trim().is_empty()
    }
}

/// Sync engine tuning. Missing fields fall back to the defaults below, so a
/// partial `[sync]` section is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Historical window for the one-shot backfill, in days
    pub backfill_days: i64,
    /// Connect attempt ceiling per startup cycle
    pub connect_attempts: u32,
    /// Linear backoff step between connect attempts, in seconds
    pub backoff_seconds: u64,
    /// Keep-alive watchdog period, in minutes
    pub watchdog_minutes: u64,
    /// Sidecar mailbox poll interval, in seconds
    pub poll_interval_seconds: u64,
    /// Bounded wait for an orderly logout on shutdown, in seconds
    pub logout_grace_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backfill_days: 30,
            connect_attempts: 3,
            backoff_seconds: 2,
            // Re-issue keep-alive just under the common 30-minute NAT timeout
            watchdog_minutes: 29,
            poll_interval_seconds: 60,
            logout_grace_seconds: 5,
        }
    }
}

impl SyncSettings {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_attempts: self.connect_attempts,
            backoff_step: Duration::from_secs(self.backoff_seconds),
            watchdog_period: Duration::from_secs(self.watchdog_minutes * 60),
            backfill_days: self.backfill_days,
            logout_grace: Duration::from_secs(self.logout_grace_seconds),
        }
    }
}

/// Downstream document store endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerSettings {
    pub url: String,
    pub index: String,
    pub timeout_seconds: u64,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".into(),
            index: "emails".into(),
            timeout_seconds: 10,
        }
    }
}

/// Chat-completion classifier endpoint (Ollama-compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub url: String,
    pub model: String,
    pub enabled: bool,
    pub timeout_seconds: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".into(),
            model: "mistral:latest".into(),
            enabled: true,
            timeout_seconds: 30,
        }
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("onebox-sync").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("onebox-sync")
                .join("config.toml"),
        );
    }

    paths
}

/// Load settings from an explicit path, or the first default path that
/// exists. No file at all yields empty settings: the process still starts
/// and reports every account as unconfigured.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    if let Some(path) = path {
        return load_from_path(path);
    }

    for candidate in default_config_paths() {
        if candidate.exists() {
            return load_from_path(&candidate);
        }
    }

    info!("no config file found, using empty settings");
    Ok(Settings::default())
}

fn load_from_path(path: &Path) -> Result<Settings> {
    info!(path = %path.display(), "loading configuration");

    let content = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let settings: Settings = toml::from_str(&content)?;
    Ok(settings)
}

fn default_imap_port() -> u16 {
    993
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_settings() {
        let raw = r#"
            [[accounts]]
            id = "work"
            host = "imap.example.com"
            username = "user@example.com"
            password = "hunter2"

            [[accounts]]
            id = "spare"

            [sync]
            backfill_days = 7
            connect_attempts = 5
            backoff_seconds = 1
            watchdog_minutes = 10
            poll_interval_seconds = 15
            logout_grace_seconds = 2

            [indexer]
            url = "http://es:9200"
            index = "mail"
            timeout_seconds = 3

            [classifier]
            url = "http://llm:11434"
            model = "llama3"
            enabled = false
            timeout_seconds = 5
        "#;

        let settings: Settings = toml::from_str(raw).unwrap();
        assert_eq!(settings.accounts.len(), 2);
        assert_eq!(settings.accounts[0].port, 993);
        assert!(settings.accounts[0].is_configured());
        assert!(!settings.accounts[1].is_configured());
        assert_eq!(settings.sync.backfill_days, 7);
        assert_eq!(settings.indexer.index, "mail");
        assert!(!settings.classifier.enabled);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let raw = r#"
            [sync]
            backfill_days = 7

            [classifier]
            enabled = false
        "#;

        let settings: Settings = toml::from_str(raw).unwrap();
        assert_eq!(settings.sync.backfill_days, 7);
        assert_eq!(settings.sync.connect_attempts, 3);
        assert_eq!(settings.sync.watchdog_minutes, 29);
        assert!(!settings.classifier.enabled);
        assert_eq!(settings.classifier.model, "mistral:latest");
        assert_eq!(settings.indexer.timeout_seconds, 10);
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let settings: Settings = toml::from_str("").unwrap();
        assert!(settings.accounts.is_empty());
        assert_eq!(settings.sync.connect_attempts, 3);
        assert_eq!(settings.sync.watchdog_minutes, 29);
        assert_eq!(settings.indexer.url, "http://localhost:9200");
    }

    #[test]
    fn supervisor_config_converts_units() {
        let sync = SyncSettings::default();
        let config = sync.supervisor_config();
        assert_eq!(config.backoff_step, Duration::from_secs(2));
        assert_eq!(config.watchdog_period, Duration::from_secs(29 * 60));
        assert_eq!(config.backfill_days, 30);
    }

    #[test]
    fn blank_fields_mean_unconfigured() {
        let account = AccountConfig {
            id: "a".into(),
            host: "imap.example.com".into(),
            port: 993,
            username: "  ".into(),
            password: "p".into(),
        };
        assert!(!account.is_configured());
    }
}
