//! Configuration management for the streaming service.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default per-worker in-flight cap.
pub const DEFAULT_UPLOAD_THREADS: usize = 8;

/// Default maximum bot workers per channel.
pub const DEFAULT_BG_BOTS_LIMIT: usize = 4;

/// Default idle TTL for a channel worker set (seconds).
pub const DEFAULT_POOL_IDLE_TTL_SECS: u64 = 1800;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Telegram API configuration
    pub telegram: TelegramConfig,

    /// Metadata cache configuration
    pub cache: CacheConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Seconds to wait for in-flight requests on shutdown
    pub graceful_shutdown_secs: u64,
}

/// Telegram API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Telegram API ID (get from my.telegram.org)
    pub api_id: i32,

    /// Telegram API hash
    pub api_hash: String,

    /// Maximum bot workers per channel worker set
    pub bg_bots_limit: usize,

    /// Always stream through the user-session worker, ignoring bot tokens
    pub disable_stream_bots: bool,

    /// Evict channel worker sets idle for longer than this (seconds)
    pub pool_idle_ttl_secs: u64,

    /// Upload/stream tuning shared with the write path
    pub uploads: UploadsConfig,
}

/// Settings shared between the (external) upload path and the readers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    /// Process-wide encryption secret for encrypted files
    pub encryption_key: String,

    /// Suggested per-worker in-flight cap
    pub threads: usize,
}

/// Metadata cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry TTL in seconds (0 = keep until evicted)
    pub ttl_secs: u64,

    /// Maximum number of cached entries
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            telegram: TelegramConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8080,
            graceful_shutdown_secs: 10,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        TelegramConfig {
            api_id: 0,
            api_hash: String::new(),
            bg_bots_limit: DEFAULT_BG_BOTS_LIMIT,
            disable_stream_bots: false,
            pool_idle_ttl_secs: DEFAULT_POOL_IDLE_TTL_SECS,
            uploads: UploadsConfig::default(),
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        UploadsConfig {
            encryption_key: String::new(),
            threads: DEFAULT_UPLOAD_THREADS,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: 0,
            capacity: 4096,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Create a config from defaults and environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(api_id) = std::env::var("TELEGRAM_APP_ID") {
            if let Ok(id) = api_id.trim().parse::<i32>() {
                self.telegram.api_id = id;
            }
        }

        if let Ok(api_hash) = std::env::var("TELEGRAM_APP_HASH") {
            let hash = api_hash.trim().to_string();
            if !hash.is_empty() {
                self.telegram.api_hash = hash;
            }
        }

        if let Ok(key) = std::env::var("TGDRIVE_ENCRYPTION_KEY") {
            if !key.is_empty() {
                self.telegram.uploads.encryption_key = key;
            }
        }

        if let Ok(port) = std::env::var("TGDRIVE_PORT") {
            if let Ok(port) = port.trim().parse::<u16>() {
                self.server.port = port;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.telegram.api_id == 0 {
            return Err(Error::InvalidConfig("Telegram API ID is required".to_string()));
        }

        if self.telegram.api_hash.is_empty() {
            return Err(Error::InvalidConfig("Telegram API hash is required".to_string()));
        }

        if self.telegram.uploads.threads == 0 {
            return Err(Error::InvalidConfig(
                "uploads.threads must be greater than 0".to_string(),
            ));
        }

        if self.telegram.bg_bots_limit == 0 {
            return Err(Error::InvalidConfig(
                "bg_bots_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Idle TTL for channel worker sets
    pub fn pool_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.telegram.pool_idle_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.telegram.api_id = 12345;
        config.telegram.api_hash = "abcdef".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.telegram.uploads.threads, DEFAULT_UPLOAD_THREADS);
        assert_eq!(config.telegram.bg_bots_limit, DEFAULT_BG_BOTS_LIMIT);
        assert!(!config.telegram.disable_stream_bots);
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = Config::default();
        assert!(config.validate().is_err());

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let mut config = valid_config();
        config.telegram.uploads.threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_parse() {
        let json = r#"{"telegram": {"api_id": 7, "api_hash": "h", "bg_bots_limit": 2}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.telegram.api_id, 7);
        assert_eq!(config.telegram.bg_bots_limit, 2);
        assert_eq!(config.server.port, 8080);
    }
}
