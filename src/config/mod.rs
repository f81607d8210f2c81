//! Configuration management

use crate::collab::{InMemoryCatalog, StaticIdentity};
use crate::session::UserId;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub liveness: LivenessConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub catalog: CatalogConfig,
}

/// Network and storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the server listens on
    pub bind: SocketAddr,

    /// Write session records to `state_dir`
    pub persist: bool,

    /// Directory for session records (defaults under the user data dir)
    pub state_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            persist: true,
            state_dir: None,
        }
    }
}

/// Session rules and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub default_reading_secs: u32,
    pub default_consultation_secs: u32,
    pub min_reading_secs: u32,
    pub max_reading_secs: u32,
    pub min_consultation_secs: u32,
    pub max_consultation_secs: u32,

    /// FEEDBACK completes on its own after this many seconds (0 = never)
    pub feedback_timeout_secs: u32,

    /// How long an ended session stays addressable before eviction
    pub retain_ended_secs: u64,

    /// After a restart, participants who have not resubscribed within this
    /// window are treated as disconnected
    pub reconnect_grace_secs: u64,

    pub max_chat_length: usize,

    /// Per-connection outbound event queue
    pub subscriber_buffer: usize,

    /// Upper bound on simultaneous connections subscribed to one session
    pub max_connections_per_session: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_reading_secs: 120,
            default_consultation_secs: 480,
            min_reading_secs: 10,
            max_reading_secs: 1800,
            min_consultation_secs: 60,
            max_consultation_secs: 3600,
            feedback_timeout_secs: 900,
            retain_ended_secs: 300,
            reconnect_grace_secs: 60,
            max_chat_length: 2000,
            subscriber_buffer: 256,
            max_connections_per_session: 32,
        }
    }
}

impl SessionsConfig {
    pub fn feedback_timeout(&self) -> Option<u32> {
        (self.feedback_timeout_secs > 0).then_some(self.feedback_timeout_secs)
    }

    pub fn retain_ended(&self) -> Duration {
        Duration::from_secs(self.retain_ended_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }
}

/// Heartbeat-based disconnect detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// A connection silent for this long counts as disconnected
    pub heartbeat_timeout_secs: u64,

    /// How often stale connections are swept
    pub sweep_interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 45,
            sweep_interval_secs: 15,
        }
    }
}

impl LivenessConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Credential tokens for the bundled identity resolver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// token -> user id
    pub tokens: BTreeMap<String, String>,

    /// Treat unknown tokens as user ids (development only)
    pub allow_anonymous: bool,
}

impl AuthConfig {
    pub fn resolver(&self) -> StaticIdentity {
        let tokens = self
            .tokens
            .iter()
            .map(|(token, user)| (token.clone(), UserId::new(user.clone())))
            .collect();
        StaticIdentity::new(tokens).with_anonymous(self.allow_anonymous)
    }
}

/// Case ids for the bundled case catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// topic -> case ids
    pub topics: BTreeMap<String, Vec<String>>,

    /// recall date (YYYY-MM-DD) -> case ids
    pub recall: BTreeMap<NaiveDate, Vec<String>>,
}

impl CatalogConfig {
    pub fn catalog(&self) -> InMemoryCatalog {
        let catalog = self
            .topics
            .iter()
            .fold(InMemoryCatalog::new(), |c, (topic, cases)| {
                c.with_topic(topic.clone(), cases.iter().cloned())
            });
        self.recall.iter().fold(catalog, |c, (date, cases)| {
            c.with_recall(*date, cases.iter().cloned())
        })
    }
}

impl Config {
    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from an explicit path, or return defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("practica")
            .join("config.toml")
    }

    /// Directory session records are written to, if persistence is on
    pub fn state_dir(&self) -> Option<PathBuf> {
        if !self.server.persist {
            return None;
        }
        Some(
            self.server
                .state_dir
                .clone()
                .or_else(|| dirs::data_dir().map(|d| d.join("practica").join("sessions")))
                .unwrap_or_else(|| std::env::temp_dir().join("practica").join("sessions")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sessions.default_reading_secs, 120);
        assert_eq!(config.server.bind.port(), 7420);
        assert!(!config.auth.allow_anonymous);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind = "0.0.0.0:9000"
            persist = false

            [sessions]
            feedback_timeout_secs = 0

            [auth]
            allow_anonymous = true
            tokens = { "t-1" = "alice" }

            [catalog.topics]
            cardiology = ["chest-pain", "syncope"]

            [catalog.recall]
            "2024-03-01" = ["recall-a"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind.port(), 9000);
        assert!(config.state_dir().is_none());
        assert_eq!(config.sessions.feedback_timeout(), None);
        assert_eq!(config.sessions.max_chat_length, 2000);
        assert_eq!(config.auth.tokens.get("t-1").map(String::as_str), Some("alice"));
        assert_eq!(config.catalog.topics["cardiology"].len(), 2);
        assert_eq!(config.catalog.recall.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.liveness.heartbeat_timeout_secs, 45);
    }
}
