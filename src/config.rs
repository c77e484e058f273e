//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use chrono::TimeDelta;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::keys::{KeyPolicy, token};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` references.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Where the collections live
    pub storage: StorageConfig,
    /// Key issuance defaults
    pub keys: KeysConfig,
    /// Admin access
    pub admin: AdminConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Durable collection locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the JSON collections
    pub data_dir: PathBuf,
    /// Key collection file name
    pub keys_file: String,
    /// Blacklist file name
    pub blacklist_file: String,
    /// Notification queue file name
    pub notifications_file: String,
    /// Retired token list file name
    pub retired_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            keys_file: "keys.json".to_string(),
            blacklist_file: "blacklist.json".to_string(),
            notifications_file: "notifications.json".to_string(),
            retired_file: "retired_tokens.json".to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path of the key collection
    #[must_use]
    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join(&self.keys_file)
    }

    /// Full path of the blacklist
    #[must_use]
    pub fn blacklist_path(&self) -> PathBuf {
        self.data_dir.join(&self.blacklist_file)
    }

    /// Full path of the notification queue
    #[must_use]
    pub fn notifications_path(&self) -> PathBuf {
        self.data_dir.join(&self.notifications_file)
    }

    /// Full path of the retired token list
    #[must_use]
    pub fn retired_path(&self) -> PathBuf {
        self.data_dir.join(&self.retired_file)
    }
}

/// Longest configurable key lifetime: 100 years.
pub const MAX_TTL_HOURS: u32 = 100 * 365 * 24;

/// Key issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Lifetime of client-issued keys, in hours
    pub default_ttl_hours: u32,
    /// Seats on client-issued keys
    pub default_max_users: u32,
    /// Seats on custom keys when the admin leaves it blank
    pub custom_max_users: u32,
    /// Prefix of generated tokens
    pub token_prefix: String,
    /// How often expired keys are swept (`0s` disables the sweeper)
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 24,
            default_max_users: 2,
            custom_max_users: 1,
            token_prefix: token::DEFAULT_PREFIX.to_string(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl KeysConfig {
    /// Issuance policy for [`KeyManager`](crate::keys::KeyManager).
    #[must_use]
    pub fn policy(&self) -> KeyPolicy {
        KeyPolicy {
            ttl: TimeDelta::hours(i64::from(self.default_ttl_hours)),
            max_users: self.default_max_users,
            custom_max_users: self.custom_max_users,
        }
    }
}

/// Admin access configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Shared admin secret.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (generates random token)
    pub token: Option<String>,
}

impl AdminConfig {
    /// Resolve the admin token (expand env vars, generate if `auto`)
    #[must_use]
    pub fn resolve_token(&self) -> Option<String> {
        self.token.as_ref().map(|token| {
            if token == "auto" {
                let random_bytes: [u8; 32] = rand::random();
                format!(
                    "adm_{}",
                    base64::Engine::encode(
                        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                        random_bytes
                    )
                )
            } else if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| token.clone())
            } else {
                token.clone()
            }
        })
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (KEYGATE_ prefix)
        figment = figment.merge(Env::prefixed("KEYGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before `env:` resolution)
        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the key lifecycle cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.keys.default_ttl_hours == 0 {
            return Err(Error::Config("keys.default_ttl_hours must be at least 1".into()));
        }
        if self.keys.default_ttl_hours > MAX_TTL_HOURS {
            return Err(Error::Config(format!(
                "keys.default_ttl_hours must be at most {MAX_TTL_HOURS}"
            )));
        }
        if self.keys.default_max_users == 0 || self.keys.custom_max_users == 0 {
            return Err(Error::Config("keys max users must be at least 1".into()));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), env::var("HOME")) {
                (Some(rest), Ok(home)) => format!("{home}{rest}"),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}
