//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "portcullis.toml",
    "config.toml",
    "./config/portcullis.toml",
    "/etc/portcullis/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit variable source.
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match self.find_config_file(&lookup) {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        apply_overrides(&mut config, &lookup);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching defaults");
        }

        if let Some(path) = lookup("PORTCULLIS_CONFIG").map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parsed<T: FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn apply_overrides<F: Fn(&str) -> Option<String>>(config: &mut AppConfig, lookup: &F) {
    // Database
    if let Some(val) = lookup("PORTCULLIS_DATABASE_URL") {
        config.database.url = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_DATABASE_MAX_CONNECTIONS") {
        config.database.max_connections = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_DATABASE_ACQUIRE_TIMEOUT_SECS") {
        config.database.acquire_timeout_secs = val;
    }

    // Repository
    if let Some(val) = parsed(lookup, "PORTCULLIS_REPOSITORY_DEFAULT_LIMIT") {
        config.repository.default_limit = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_REPOSITORY_MAX_RETRIES") {
        config.repository.max_retries = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_BACKOFF_INITIAL_MS") {
        config.repository.backoff.initial_ms = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_BACKOFF_MAX_MS") {
        config.repository.backoff.max_ms = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_BACKOFF_MULTIPLIER") {
        config.repository.backoff.multiplier = val;
    }

    // KMS
    if let Some(val) = lookup("PORTCULLIS_KMS_KEY_ID") {
        config.kms.key_id = val;
    }
    if let Some(val) = lookup("PORTCULLIS_KMS_ROOT_KEY") {
        config.kms.root_key = val;
    }

    // Bootstrap
    if let Some(val) = lookup("PORTCULLIS_BOOTSTRAP_ORG_NAME") {
        config.bootstrap.org_name = val;
    }
    if let Some(val) = lookup("PORTCULLIS_BOOTSTRAP_AUTH_METHOD_NAME") {
        config.bootstrap.auth_method_name = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_BOOTSTRAP_MIN_USER_NAME_LENGTH") {
        config.bootstrap.min_user_name_length = val;
    }
    if let Some(val) = parsed(lookup, "PORTCULLIS_BOOTSTRAP_MIN_PASSWORD_LENGTH") {
        config.bootstrap.min_password_length = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nurl = \"sqlite://./test.db\"\nmax_connections = 3").unwrap();

        let config = ConfigLoader::with_path(file.path())
            .load_with(|_| None)
            .unwrap();
        assert_eq!(config.database.url, "sqlite://./test.db");
        assert_eq!(config.database.max_connections, 3);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[repository]\ndefault_limit = 25").unwrap();

        let env = vars(&[
            ("PORTCULLIS_REPOSITORY_DEFAULT_LIMIT", "7"),
            ("PORTCULLIS_KMS_KEY_ID", "k2"),
            ("PORTCULLIS_BACKOFF_MULTIPLIER", "1.5"),
        ]);
        let config = ConfigLoader::with_path(file.path())
            .load_with(|k| env.get(k).cloned())
            .unwrap();

        assert_eq!(config.repository.default_limit, 7);
        assert_eq!(config.kms.key_id, "k2");
        assert_eq!(config.repository.backoff.multiplier, 1.5);
    }

    #[test]
    fn test_unparseable_override_is_ignored() {
        let env = vars(&[("PORTCULLIS_REPOSITORY_MAX_RETRIES", "lots")]);
        let config = ConfigLoader::with_path("/nonexistent/portcullis.toml")
            .load_with(|k| env.get(k).cloned())
            .unwrap();
        assert_eq!(config.repository.max_retries, 20);
    }

    #[test]
    fn test_invalid_override_fails_validation() {
        let env = vars(&[("PORTCULLIS_DATABASE_MAX_CONNECTIONS", "0")]);
        let result = ConfigLoader::with_path("/nonexistent/portcullis.toml")
            .load_with(|k| env.get(k).cloned());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database\nurl = ").unwrap();
        let result = ConfigLoader::with_path(file.path()).load_with(|_| None);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
