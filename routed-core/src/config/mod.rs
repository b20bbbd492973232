mod loader;
pub mod value;

use std::collections::HashMap;
use std::path::Path;

pub use value::{ConfigValue, FromConfigValue};

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// The requested key was not found in the configuration.
    NotFound(String),
    /// The value could not be converted to the requested type.
    TypeMismatch { key: String, expected: &'static str },
    /// An I/O or YAML parsing error occurred while loading config files.
    Load(String),
    /// A section was present but semantically invalid.
    Invalid { key: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(key) => write!(f, "Config key not found: {key}"),
            ConfigError::TypeMismatch { key, expected } => {
                write!(f, "Config type mismatch for '{key}': expected {expected}")
            }
            ConfigError::Load(msg) => write!(f, "Config load error: {msg}"),
            ConfigError::Invalid { key, message } => {
                write!(f, "Invalid config at '{key}': {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Application configuration loaded from YAML files, `.env` files, and
/// environment variables, flattened into dot-separated keys.
///
/// Resolution order (lowest to highest priority):
/// 1. `routed.yaml` (base)
/// 2. `routed-{profile}.yaml` (profile override)
/// 3. `.env` file (loaded into the process environment)
/// 4. `.env.{profile}` file
/// 5. Environment variables (`SECURITY_IP_FILTER_ENABLED` overrides
///    `security.ip_filter.enabled`)
///
/// `.env` files never overwrite already-set environment variables.
/// The active profile is `ROUTED_PROFILE` > argument > `"dev"`.
#[derive(Debug, Clone)]
pub struct RoutedConfig {
    values: HashMap<String, ConfigValue>,
    profile: String,
}

impl RoutedConfig {
    /// Load configuration for the given profile from the working directory.
    pub fn load(profile: &str) -> Result<Self, ConfigError> {
        let active_profile =
            std::env::var("ROUTED_PROFILE").unwrap_or_else(|_| profile.to_string());

        let mut values = HashMap::new();

        loader::load_yaml_file(Path::new("routed.yaml"), &mut values)?;

        let profile_path = format!("routed-{active_profile}.yaml");
        loader::load_yaml_file(Path::new(&profile_path), &mut values)?;

        let _ = dotenvy::dotenv();
        let profile_env = format!(".env.{active_profile}");
        let _ = dotenvy::from_filename(&profile_env);

        // Convention: `security.ip_filter.enabled` <-> `SECURITY_IP_FILTER_ENABLED`
        for (env_key, env_val) in std::env::vars() {
            let config_key = env_key.to_lowercase().replace('_', ".");
            values.insert(config_key, ConfigValue::String(env_val));
        }

        Ok(RoutedConfig {
            values,
            profile: active_profile,
        })
    }

    /// Create a config from a YAML string (useful for testing).
    pub fn from_yaml_str(yaml: &str, profile: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        loader::load_yaml_str(yaml, &mut values)?;
        Ok(RoutedConfig {
            values,
            profile: profile.to_string(),
        })
    }

    /// Create an empty config (useful for testing).
    pub fn empty() -> Self {
        RoutedConfig {
            values: HashMap::new(),
            profile: "test".to_string(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Get a typed value for a key.
    pub fn get<T: FromConfigValue>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        T::from_config_value(value, key)
    }

    /// Get a typed value, falling back to a default when the key is absent.
    pub fn get_or<T: FromConfigValue>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.values.get(key) {
            Some(value) => T::from_config_value(value, key),
            None => Ok(default),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All keys starting with `prefix`, sorted. Used to walk indexed
    /// sections such as `rate_limit.policies.N`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
