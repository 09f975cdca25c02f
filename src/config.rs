//! TOML configuration for the mail core.

use crate::error::{Error, Result};
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub imap: ImapSettings,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// The single system-wide mail retrieval account.
///
/// Exactly one of these is active at a time; polling and admin connection
/// tests both read it, but never share a live session.
#[derive(Clone, serde::Deserialize)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

/// Mailbox retention and message pruning knobs.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RetentionConfig {
    /// Mailbox lifetime in days when the domain has no override.
    #[serde(default = "default_retention_days")]
    pub default_days: u32,
    /// Per-domain retention overrides, keyed by domain name.
    #[serde(default)]
    pub domain_days: HashMap<String, u32>,
    #[serde(default = "default_expiry_sweep_interval")]
    pub expiry_sweep_interval_secs: u64,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
    /// Age-based message pruning toggle. Independent of mailbox expiry.
    #[serde(default = "default_true")]
    pub auto_prune: bool,
    #[serde(default = "default_retention_days")]
    pub prune_after_days: u32,
    /// Hard cap on messages returned by a single inbox listing.
    #[serde(default = "default_message_list_cap")]
    pub message_list_cap: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_days: default_retention_days(),
            domain_days: HashMap::new(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval(),
            prune_interval_secs: default_prune_interval(),
            auto_prune: true,
            prune_after_days: default_retention_days(),
            message_list_cap: default_message_list_cap(),
        }
    }
}

impl RetentionConfig {
    /// Resolve the retention window for a domain, falling back to the
    /// global default.
    pub fn days_for_domain(&self, domain: &str) -> u32 {
        self.domain_days
            .get(&domain.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_days)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|error| Error::Config(format!("{}: {error}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.imap.host.trim().is_empty() {
            return Err(Error::Config("imap.host must not be empty".into()));
        }
        if self.imap.username.trim().is_empty() {
            return Err(Error::Config("imap.username must not be empty".into()));
        }
        if self.retention.default_days == 0 {
            return Err(Error::Config(
                "retention.default_days must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

fn default_expiry_sweep_interval() -> u64 {
    3600
}

fn default_prune_interval() -> u64 {
    86400
}

fn default_message_list_cap() -> i64 {
    50
}

fn default_database_url() -> String {
    "sqlite://ephemail.db".to_string()
}
