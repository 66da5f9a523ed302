use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let configured_path =
            std::env::var("POLLS_CONFIG").unwrap_or_else(|_| "config/polls.toml".to_string());
        assert!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("POLLS_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/polls.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        // POLLS__DATABASE__URL and friends win over files
        builder = builder.add_source(
            Environment::with_prefix("POLLS")
                .prefix_separator("__")
                .separator("__"),
        );

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self> {
        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize application configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        assert!(
            !self.database.url.is_empty(),
            "Database URL must be specified"
        );
        assert!(
            self.server.port > 0,
            "Server port must be greater than zero"
        );
        assert!(
            self.database.max_connections >= self.database.min_connections.unwrap_or(1),
            "Max connections must be >= min connections"
        );
        assert!(
            self.database.max_connections <= 128,
            "Connection pool oversized"
        );
        self.session.ensure_bounds()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(self.port != 0, "HTTP port cannot be zero");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "SessionConfig::default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "SessionConfig::default_max_capacity")]
    pub max_capacity: u64,
    /// Adds the `Secure` attribute; enable when served over TLS
    #[serde(default)]
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: Self::default_cookie_name(),
            ttl_seconds: Self::default_ttl_seconds(),
            max_capacity: Self::default_max_capacity(),
            secure_cookie: false,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        assert!(self.ttl_seconds >= 60, "Session TTL must be >= 60 seconds");
        Duration::from_secs(self.ttl_seconds)
    }

    fn ensure_bounds(&self) -> Result<()> {
        assert!(
            !self.cookie_name.is_empty(),
            "Session cookie name must be non-empty"
        );
        assert!(
            self.cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
            "Session cookie name must be a plain token"
        );
        assert!(
            self.ttl_seconds >= 60,
            "Session TTL must be at least one minute"
        );
        assert!(
            self.ttl_seconds <= 30 * 86_400,
            "Session TTL cannot exceed thirty days"
        );
        assert!(
            self.max_capacity >= 100,
            "Session store capacity must be at least 100"
        );
        Ok(())
    }

    fn default_cookie_name() -> String {
        "sid".to_string()
    }

    const fn default_ttl_seconds() -> u64 {
        14 * 86_400
    }

    const fn default_max_capacity() -> u64 {
        100_000
    }
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
