//! Portcullis Configuration System
//!
//! TOML-based configuration with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub repository: RepositoryConfig,
    pub kms: KmsConfig,
    pub bootstrap: BootstrapConfig,
}

/// SQL store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://./data/portcullis.db?mode=rwc`
    pub url: String,
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout_secs: 30,
        }
    }
}

/// Settings injected into every repository at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Row cap applied to list operations when the caller passes no limit
    pub default_limit: i64,
    /// Retries for transient storage conflicts
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10_000,
            max_retries: 20,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Capped exponential backoff between transaction retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 10,
            max_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

/// Root key for the envelope-encryption wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    pub key_id: String,
    /// Base64-encoded 32-byte AES key
    pub root_key: String,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            key_id: "root".to_string(),
            root_key: String::new(),
        }
    }
}

/// Seed data created by `pc-bootstrap` on an empty store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub org_name: String,
    pub auth_method_name: String,
    pub min_user_name_length: u32,
    pub min_password_length: u32,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            org_name: "default".to_string(),
            auth_method_name: "password".to_string(),
            min_user_name_length: 3,
            min_password_length: 8,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::ValidationError("database.url is empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be at least 1".into(),
            ));
        }
        if self.repository.default_limit == 0 {
            return Err(ConfigError::ValidationError(
                "repository.default_limit must be non-zero".into(),
            ));
        }
        let backoff = &self.repository.backoff;
        if backoff.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "repository.backoff.multiplier must be >= 1.0, got {}",
                backoff.multiplier
            )));
        }
        if backoff.initial_ms > backoff.max_ms {
            return Err(ConfigError::ValidationError(format!(
                "repository.backoff.initial_ms ({}) exceeds max_ms ({})",
                backoff.initial_ms, backoff.max_ms
            )));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Portcullis Configuration
# Environment variables (PORTCULLIS_*) override these settings

[database]
url = "sqlite://./data/portcullis.db?mode=rwc"
max_connections = 4
acquire_timeout_secs = 30

[repository]
default_limit = 10000
max_retries = 20

[repository.backoff]
initial_ms = 10
max_ms = 1000
multiplier = 2.0

[kms]
key_id = "root"
root_key = ""  # base64 32-byte key, generate with `pc-bootstrap --generate-key`

[bootstrap]
org_name = "default"
auth_method_name = "password"
min_user_name_length = 3
min_password_length = 8
"#
        .to_string()
    }
}
