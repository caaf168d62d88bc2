//! Configuration loading and persistence.
//!
//! Handles reading and writing the durcit-sync configuration file. Session
//! credentials are NOT part of the config; they live in the shared
//! credential store (see [`crate::session::storage`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the sync client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST API.
    pub api_url: String,
    /// WebSocket URL of the STOMP endpoint.
    pub ws_url: String,
    /// Push destination prefix; the member id is appended to form the channel.
    pub channel_prefix: String,
    /// Broadcast topic for emoji reaction updates; empty disables it.
    pub emoji_topic: String,
    /// Seconds a subscribe may go unacknowledged before the attempt fails.
    pub subscribe_timeout_secs: u64,
    /// Override for the credential file location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: constants::DEFAULT_API_URL.to_string(),
            ws_url: constants::DEFAULT_WS_URL.to_string(),
            channel_prefix: constants::DEFAULT_CHANNEL_PREFIX.to_string(),
            emoji_topic: constants::DEFAULT_EMOJI_TOPIC.to_string(),
            subscribe_timeout_secs: constants::SUBSCRIBE_ACK_TIMEOUT.as_secs(),
            credentials_path: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/durcit-test`
    /// 2. `DURCIT_CONFIG_DIR` env var: explicit override
    /// 3. `DURCIT_ENV=test`: `tmp/durcit-test` (integration tests)
    /// 4. Default: platform config dir (Linux: ~/.config/durcit)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/durcit-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("DURCIT_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_test_mode() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/durcit-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("durcit")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(api_url) = lookup("DURCIT_API_URL") {
            self.api_url = api_url;
        }

        if let Some(ws_url) = lookup("DURCIT_WS_URL") {
            self.ws_url = ws_url;
        }

        if let Some(prefix) = lookup("DURCIT_CHANNEL_PREFIX") {
            self.channel_prefix = prefix;
        }

        if let Some(topic) = lookup("DURCIT_EMOJI_TOPIC") {
            self.emoji_topic = topic;
        }

        if let Some(timeout) = lookup("DURCIT_SUBSCRIBE_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.subscribe_timeout_secs = secs;
            }
        }

        if let Some(path) = lookup("DURCIT_CREDENTIALS") {
            self.credentials_path = Some(PathBuf::from(path));
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Subscribe acknowledgment timeout. Never zero.
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs.max(1))
    }

    /// Location of the shared credential file.
    pub fn credentials_file(&self) -> Result<PathBuf> {
        match &self.credentials_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join(constants::CREDENTIALS_FILE)),
        }
    }

    /// Emoji update topic, unless disabled.
    pub fn emoji_topic(&self) -> Option<&str> {
        Some(self.emoji_topic.trim()).filter(|t| !t.is_empty())
    }

    /// Push channel for a member.
    pub fn channel_for(&self, member_id: &str) -> String {
        format!("{}{}", self.channel_prefix, member_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:8080");
        assert_eq!(config.ws_url, "ws://localhost:8080/ws/websocket");
        assert_eq!(config.subscribe_timeout_secs, 10);
        assert_eq!(config.emoji_topic(), Some("/topic/emojiUpdate"));
        assert!(config.credentials_path.is_none());
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_url": "https://durcit.example"}"#).unwrap();
        assert_eq!(config.api_url, "https://durcit.example");
        assert_eq!(config.channel_prefix, "/topic/pushs/");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DURCIT_API_URL", "https://api.durcit.example"),
            ("DURCIT_WS_URL", "wss://api.durcit.example/ws/websocket"),
            ("DURCIT_SUBSCRIBE_TIMEOUT", "3"),
            ("DURCIT_CREDENTIALS", "/tmp/creds.json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.api_url, "https://api.durcit.example");
        assert_eq!(config.ws_url, "wss://api.durcit.example/ws/websocket");
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.credentials_file().unwrap(),
            PathBuf::from("/tmp/creds.json")
        );
    }

    #[test]
    fn test_invalid_timeout_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| {
            (key == "DURCIT_SUBSCRIBE_TIMEOUT").then(|| "soon".to_string())
        });
        assert_eq!(config.subscribe_timeout_secs, 10);
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = Config {
            subscribe_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_emoji_topic_disables_updates() {
        let mut config = Config::default();
        config.apply_overrides(|key| (key == "DURCIT_EMOJI_TOPIC").then(String::new));
        assert_eq!(config.emoji_topic(), None);
    }

    #[test]
    fn test_channel_for_member() {
        let config = Config::default();
        assert_eq!(config.channel_for("42"), "/topic/pushs/42");
    }
}
