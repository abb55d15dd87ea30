//! Configuration management for Crosspost

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{CredentialFormat, StorageBackend};
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub destination: DestinationConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Destination session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub storage: StorageBackend,
    /// Where the destination cookies live (file storage)
    pub credential_path: String,
    /// Keyring account name (keyring storage)
    pub keyring_account: String,
    pub credential_format: CredentialFormat,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    /// Cookie that carries the anti-forgery token
    pub token_cookie: String,
    /// Domain scope for the token cookie
    pub token_domain: String,
    /// Domain scope for every other cookie
    pub default_domain: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            storage: StorageBackend::File,
            credential_path: "~/.config/crosspost/destination.cookies".to_string(),
            keyring_account: "default".to_string(),
            credential_format: CredentialFormat::Blob,
            timeout_secs: 10,
            proxy: None,
            token_cookie: "XSRF-TOKEN".to_string(),
            token_domain: ".m.weibo.cn".to_string(),
            default_domain: ".weibo.cn".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Destination endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub base_url: String,
    pub config_url: String,
    pub compose_referer: String,
    pub send_url: String,
    pub delete_url: String,
    pub upload_url: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self::with_base("https://m.weibo.cn")
    }
}

impl DestinationConfig {
    /// Build every endpoint under a single origin
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            base_url: format!("{}/", base),
            config_url: format!("{}/api/config", base),
            compose_referer: format!("{}/compose", base),
            send_url: format!("{}/api/statuses/update", base),
            delete_url: format!("{}/profile/delMyblog", base),
            upload_url: format!("{}/api/statuses/uploadPic", base),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_api")]
    pub api_base: String,
    pub bearer_token: String,
    #[serde(default)]
    pub handles: Vec<String>,
    /// Optional file with one handle per line, re-read every cycle
    #[serde(default)]
    pub handles_file: Option<String>,
    /// Poll interval in humantime notation ("60s", "2m")
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Poll interval for the very first fetch
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Fetch size for the first poll after new handles appear
    #[serde(default = "default_initial_max_results")]
    pub initial_max_results: u32,
    #[serde(default = "default_source_url_base")]
    pub source_url_base: String,
}

fn default_source_api() -> String {
    "https://api.twitter.com".to_string()
}

fn default_interval() -> String {
    "60s".to_string()
}

fn default_initial_interval() -> String {
    "10s".to_string()
}

fn default_max_results() -> u32 {
    10
}

fn default_initial_max_results() -> u32 {
    20
}

fn default_source_url_base() -> String {
    "https://twitter.com".to_string()
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Result<Duration> {
        parse_interval("source.interval", &self.interval)
    }

    pub fn first_interval(&self) -> Result<Duration> {
        parse_interval("source.initial_interval", &self.initial_interval)
    }
}

fn parse_interval(field: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    if duration.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "interval must be greater than zero".to_string(),
        }
        .into());
    }
    Ok(duration)
}

/// Local media directories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub profile_dir: String,
    pub image_dir: String,
    pub video_dir: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            profile_dir: "~/.local/share/crosspost/profile".to_string(),
            image_dir: "~/.local/share/crosspost/image".to_string(),
            video_dir: "~/.local/share/crosspost/video".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.source.bearer_token.trim().is_empty() {
            return Err(ConfigError::MissingField("source.bearer_token".to_string()).into());
        }
        self.source.poll_interval()?;
        self.source.first_interval()?;
        Ok(())
    }
}

/// Expand `~` in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSPOST_CONFIG") {
        return Ok(expand_path(&path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
[database]
path = "/tmp/crosspost.db"

[source]
bearer_token = "AAAA"
handles = ["Genshin_7"]
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.session.timeout_secs, 10);
        assert_eq!(config.session.token_cookie, "XSRF-TOKEN");
        assert_eq!(config.session.credential_format, CredentialFormat::Blob);
        assert_eq!(config.destination.config_url, "https://m.weibo.cn/api/config");
        assert_eq!(config.source.max_results, 10);
        assert_eq!(config.source.poll_interval().unwrap(), Duration::from_secs(60));
        assert_eq!(config.source.first_interval().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_bearer_token_rejected() {
        let content = r#"
[database]
path = "/tmp/crosspost.db"

[source]
bearer_token = "  "
"#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(err.to_string().contains("source.bearer_token"));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let content = format!("{}interval = \"soon\"\n", MINIMAL);
        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("source.interval"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let content = format!("{}interval = \"0s\"\n", MINIMAL);
        assert!(Config::from_toml(&content).is_err());
    }

    #[test]
    fn test_destination_with_base_trims_slash() {
        let endpoints = DestinationConfig::with_base("http://127.0.0.1:9000/");
        assert_eq!(endpoints.base_url, "http://127.0.0.1:9000/");
        assert_eq!(endpoints.compose_referer, "http://127.0.0.1:9000/compose");
        assert_eq!(endpoints.upload_url, "http://127.0.0.1:9000/api/statuses/uploadPic");
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        std::env::set_var("CROSSPOST_CONFIG", "/tmp/crosspost-test/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("CROSSPOST_CONFIG");
        assert_eq!(path, PathBuf::from("/tmp/crosspost-test/config.toml"));
    }
}
