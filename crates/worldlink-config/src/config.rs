//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use worldlink_net::{ClientSettings, DEFAULT_GAME_WS, HandledPacket, RateLimits, ReconnectPolicy};

use crate::error::ConfigError;

const APP_NAME: &str = "worldlink";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection lifecycle settings.
    pub client: ClientConfig,
    /// Service URLs.
    pub endpoints: EndpointConfig,
    /// Outbound pacing.
    pub rate_limits: RateLimitConfig,
    /// Credentials and the world to join.
    pub account: AccountConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Connection lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Retry failed joins and rejoin after drops.
    pub reconnectable: bool,
    /// Retries allowed per attempt window.
    pub reconnect_count: u32,
    /// Delay between retries in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Attempt window length in milliseconds.
    pub reconnect_time_gap_ms: u64,
    /// How long to wait for the init frame after the socket opens.
    pub handshake_timeout_ms: u64,
    /// Delay before the init event is delivered again.
    pub init_redelivery_ms: u64,
    /// Protocol chores answered automatically.
    pub handle_packets: Vec<HandledPacket>,
}

/// Service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Account/collection API.
    pub api: String,
    /// Game server HTTP endpoint (room types, version).
    pub game_http: String,
    /// Game server WebSocket endpoint.
    pub game_ws: String,
}

/// Token-bucket limits per window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket window in milliseconds.
    pub interval_ms: u64,
    /// Bulk limit before the init frame arrives.
    pub bulk_initial: u32,
    /// Chat limit before the init frame arrives.
    pub chat_initial: u32,
    pub bulk_default: u32,
    /// Bulk limit for world owners.
    pub bulk_elevated: u32,
    pub chat_default: u32,
    /// Chat limit for world owners.
    pub chat_elevated: u32,
}

/// Account credentials. Either `token` or `email` + `password`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccountConfig {
    pub token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    /// World to join on startup.
    pub world_id: Option<String>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info,worldlink_net=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnectable: true,
            reconnect_count: 5,
            reconnect_interval_ms: 4000,
            reconnect_time_gap_ms: 10_000,
            handshake_timeout_ms: 10_000,
            init_redelivery_ms: 1500,
            handle_packets: vec![HandledPacket::Ping],
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api: "https://api.pw-staging.rnc.priddle.nl".to_string(),
            game_http: "https://server.pw-staging.rnc.priddle.nl".to_string(),
            game_ws: DEFAULT_GAME_WS.to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            bulk_initial: 100,
            chat_initial: 10,
            bulk_default: 125,
            bulk_elevated: 200,
            chat_default: 5,
            chat_elevated: 10,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Conversion ---

impl Config {
    /// Runtime settings for a `GameClient`.
    pub fn to_client_settings(&self) -> ClientSettings {
        let client = &self.client;
        let limits = &self.rate_limits;
        ClientSettings {
            reconnect: ReconnectPolicy {
                enabled: client.reconnectable,
                max_attempts: client.reconnect_count,
                retry_interval: Duration::from_millis(client.reconnect_interval_ms),
                attempt_window: Duration::from_millis(client.reconnect_time_gap_ms),
            },
            handle_packets: client.handle_packets.iter().copied().collect(),
            handshake_timeout: Duration::from_millis(client.handshake_timeout_ms),
            init_redelivery: Duration::from_millis(client.init_redelivery_ms),
            rate_limits: RateLimits {
                interval: Duration::from_millis(limits.interval_ms),
                bulk_initial: limits.bulk_initial,
                chat_initial: limits.chat_initial,
                bulk_default: limits.bulk_default,
                bulk_elevated: limits.bulk_elevated,
                chat_default: limits.chat_default,
                chat_elevated: limits.chat_elevated,
            },
            game_ws: self.endpoints.game_ws.clone(),
        }
    }
}

/// Platform config directory for the client, e.g. `~/.config/worldlink`.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Returns `Some(new_config)` if the file on disk differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("reconnect_count: 5"));
        assert!(ron_str.contains("bulk_elevated: 200"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.client.handle_packets.push(HandledPacket::Init);
        config.account.world_id = Some("w0rld".to_string());
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(client: (reconnect_count: 2), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.client.reconnect_count, 2);
        assert_eq!(config.client.reconnect_interval_ms, 4000);
        assert_eq!(config.rate_limits, RateLimitConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_client_settings_mapping() {
        let mut config = Config::default();
        config.client.reconnectable = false;
        config.client.reconnect_interval_ms = 250;
        config.rate_limits.chat_elevated = 20;
        config.endpoints.game_ws = "ws://localhost:5000".to_string();

        let settings = config.to_client_settings();
        assert!(!settings.reconnect.enabled);
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.reconnect.retry_interval, Duration::from_millis(250));
        assert_eq!(settings.rate_limits.for_role(true), (200, 20));
        assert!(settings.handles(HandledPacket::Ping));
        assert_eq!(settings.game_ws, "ws://localhost:5000");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.account.token = Some("secret".to_string());
        config.client.reconnect_count = 9;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.client.reconnectable = false;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(!result.unwrap().client.reconnectable);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
