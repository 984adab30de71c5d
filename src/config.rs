//! Configuration management for StreamVault
//!
//! All settings come from the environment. Required keys fail validation
//! with a pointer to the variable name; everything else has a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default HTTP bind port
pub const DEFAULT_PORT: u16 = 7860;

/// Default per-blob upstream fetch timeout in seconds
pub const DEFAULT_GETFILE_TIMEOUT_SECS: u64 = 60;

/// Default ingest size cap in MiB
pub const DEFAULT_MAX_FILE_SIZE_MIB: u64 = 500;

/// Default ingest duration cap in hours
pub const DEFAULT_MAX_DURATION_HOURS: u64 = 2;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Telegram API configuration
    pub telegram: TelegramConfig,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Metadata database configuration
    pub database: DatabaseConfig,

    /// Ingest limits and external fetcher configuration
    pub ingest: IngestConfig,
}

/// Telegram API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram API ID (get from my.telegram.org)
    pub api_id: i32,

    /// Telegram API hash
    pub api_hash: String,

    /// Bot token from BotFather
    pub bot_token: String,

    /// Archive channel: ingest target and stream source
    pub archive_channel_id: i64,

    /// Session file path
    pub session_file: PathBuf,

    /// Optional SOCKS5/HTTP proxy URL for the upstream connection
    pub proxy_url: Option<String>,

    /// Per-blob fetch timeout in seconds; triggers the self-heal path
    pub getfile_timeout_secs: u64,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Public base URL used when synthesising stream links
    pub public_url: String,
}

/// Metadata database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// MongoDB connection string; never logged unmasked
    pub uri: String,

    /// Database name
    pub name: String,
}

/// Ingest limits and external fetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum accepted file size in MiB
    pub max_file_size_mib: u64,

    /// Maximum accepted media duration in hours
    pub max_duration_hours: u64,

    /// Optional cookies blob handed to the external URL fetcher
    pub cookies: Option<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        TelegramConfig {
            api_id: 0,
            api_hash: String::new(),
            bot_token: String::new(),
            archive_channel_id: 0,
            session_file: PathBuf::from("streamvault.session"),
            proxy_url: None,
            getfile_timeout_secs: DEFAULT_GETFILE_TIMEOUT_SECS,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            public_url: String::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            uri: "mongodb://localhost:27017".to_string(),
            name: "streamvault".to_string(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            max_file_size_mib: DEFAULT_MAX_FILE_SIZE_MIB,
            max_duration_hours: DEFAULT_MAX_DURATION_HOURS,
            cookies: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            telegram: TelegramConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    /// Build configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(id) = env_parse::<i32>("API_ID") {
            self.telegram.api_id = id;
        }
        if let Some(hash) = env_string("API_HASH") {
            self.telegram.api_hash = hash;
        }
        if let Some(token) = env_string("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(id) = env_parse::<i64>("ARCHIVE_CHANNEL_ID") {
            self.telegram.archive_channel_id = id;
        }
        if let Some(path) = env_string("SESSION_FILE") {
            self.telegram.session_file = PathBuf::from(path);
        }
        if let Some(proxy) = env_string("PROXY_URL") {
            self.telegram.proxy_url = Some(proxy);
        }
        if let Some(secs) = env_parse::<u64>("TG_GETFILE_TIMEOUT") {
            self.telegram.getfile_timeout_secs = secs;
        }

        if let Some(port) = env_parse::<u16>("PORT") {
            self.server.port = port;
        }
        if let Some(url) = env_string("PUBLIC_URL") {
            self.server.public_url = url.trim_end_matches('/').to_string();
        }

        if let Some(uri) = env_string("MONGO_URL") {
            self.database.uri = uri;
        }
        if let Some(name) = env_string("MONGO_DB_NAME") {
            self.database.name = name;
        }

        if let Some(mib) = env_parse::<u64>("MAX_FILE_SIZE_MB") {
            self.ingest.max_file_size_mib = mib;
        }
        if let Some(hours) = env_parse::<u64>("MAX_VIDEO_DURATION_HOURS") {
            self.ingest.max_duration_hours = hours;
        }
        if let Some(cookies) = env_string("YTDLP_COOKIES") {
            self.ingest.cookies = Some(cookies);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.telegram.api_id == 0 {
            return Err(Error::Config("API_ID is required".to_string()));
        }
        if self.telegram.api_hash.is_empty() {
            return Err(Error::Config("API_HASH is required".to_string()));
        }
        if self.telegram.bot_token.is_empty() {
            return Err(Error::Config("BOT_TOKEN is required".to_string()));
        }
        if self.telegram.archive_channel_id == 0 {
            return Err(Error::Config("ARCHIVE_CHANNEL_ID is required".to_string()));
        }
        if self.server.public_url.is_empty() {
            return Err(Error::Config("PUBLIC_URL is required".to_string()));
        }
        if self.database.uri.is_empty() {
            return Err(Error::Config("MONGO_URL is required".to_string()));
        }
        if self.database.name.is_empty() {
            return Err(Error::Config("MONGO_DB_NAME is required".to_string()));
        }
        Ok(())
    }

    /// Ingest size cap in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.ingest.max_file_size_mib * 1024 * 1024
    }

    /// Ingest duration cap in seconds.
    pub fn max_duration_secs(&self) -> u64 {
        self.ingest.max_duration_hours * 3600
    }

    /// Synthesise the public stream URL for an archived message.
    pub fn stream_link(&self, channel_id: i64, msg_id: i64) -> String {
        format!(
            "{}/stream/{}/{}",
            self.server.public_url, channel_id, msg_id
        )
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.telegram.api_id = 12345;
        config.telegram.api_hash = "abcdef".to_string();
        config.telegram.bot_token = "123:token".to_string();
        config.telegram.archive_channel_id = -1001234567890;
        config.server.public_url = "https://vault.example".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.telegram.getfile_timeout_secs, 60);
        assert_eq!(config.ingest.max_file_size_mib, 500);
        assert_eq!(config.ingest.max_duration_hours, 2);
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_caps_in_base_units() {
        let config = valid_config();
        assert_eq!(config.max_file_size_bytes(), 500 * 1024 * 1024);
        assert_eq!(config.max_duration_secs(), 7200);
    }

    #[test]
    fn test_stream_link() {
        let config = valid_config();
        assert_eq!(
            config.stream_link(-1001234567890, 159),
            "https://vault.example/stream/-1001234567890/159"
        );
    }
}
