//! TOML-based configuration for the query engine.
//!
//! Supports a config file (mantis-query.toml) with environment variable
//! expansion in paths.
//!
//! Example configuration:
//! ```toml
//! [security]
//! max_depth = 10
//! max_clauses = 100
//! max_regex_length = 500
//! regex_safety_check = true
//! max_formula_length = 1000
//! max_formula_depth = 64
//!
//! [engine]
//! default_max_limit = 1000
//! default_preview_limit = 100
//! dialect = "sqlite"
//!
//! [cache]
//! enabled = true
//! backend = "sqlite"
//! path = "${HOME}/.cache/mantis-query/results.db"
//! default_ttl_seconds = 300
//!
//! [source]
//! database = "./data/shop.db"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::filter::SecurityLimits;
use crate::sql::dialect::Dialect;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub security: SecurityLimits,
    pub engine: EngineSettings,
    pub cache: CacheSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Row limit ceiling when a dataset sets no `max_limit`.
    pub default_max_limit: u64,

    /// Limit for requests that name none, when the dataset has no preview limit.
    pub default_preview_limit: u64,

    /// Dialect SQL is rendered in.
    pub dialect: Dialect,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_max_limit: 1000,
            default_preview_limit: 100,
            dialect: Dialect::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: CacheBackend,

    /// Database file for the sqlite backend (supports ${ENV_VAR} expansion).
    pub path: Option<String>,

    /// TTL when the dataset sets no `cache_ttl_seconds`.
    pub default_ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            path: None,
            default_ttl_seconds: 300,
        }
    }
}

impl CacheSettings {
    /// Cache database path with environment variables expanded.
    ///
    /// Falls back to `<cache dir>/mantis-query/results.db`.
    pub fn resolved_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.path {
            Some(path) => Ok(PathBuf::from(expand_env_vars(path)?)),
            None => dirs::cache_dir()
                .map(|dir| dir.join("mantis-query").join("results.db"))
                .ok_or_else(|| {
                    SettingsError::InvalidConfig("no cache directory available".to_string())
                }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceSettings {
    /// SQLite database file (supports ${ENV_VAR} expansion).
    pub database: Option<String>,
}

impl SourceSettings {
    pub fn resolved_database(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.database
            .as_deref()
            .map(|path| expand_env_vars(path).map(PathBuf::from))
            .transpose()
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `MANTIS_QUERY_CONFIG`
    /// 2. `./mantis-query.toml`
    /// 3. `~/.config/mantis-query/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("MANTIS_QUERY_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("mantis-query.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("mantis-query").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let security = &self.security;
        if [
            security.max_depth,
            security.max_clauses,
            security.max_formula_length,
            security.max_formula_depth,
        ]
        .contains(&0)
        {
            return Err(SettingsError::InvalidConfig(
                "security limits must be positive".to_string(),
            ));
        }
        if self.engine.default_max_limit == 0 {
            return Err(SettingsError::InvalidConfig(
                "engine.default_max_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // Lone $
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
