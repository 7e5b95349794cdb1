//! Engine configuration from the environment

use crate::memory::ScopeRegistry;
use crate::runtime::{DEFAULT_IDLE_TIMEOUT, DEFAULT_QUEUE_DEPTH};
use crate::storage::{MemoryStorage, SqliteStorage, Storage, StorageError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Settings file {path} is not valid JSON: {source}")]
    InvalidJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Settings file {0} must contain a JSON object")]
    NotAnObject(PathBuf),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite file for bot state; in-memory storage when unset
    pub db_path: Option<PathBuf>,
    pub queue_depth: usize,
    pub idle_timeout: Duration,
    pub reset_state_on_error: bool,
    /// Scope used for paths without a known scope prefix; `None` disables
    /// the fallback
    pub default_scope: Option<String>,
    /// JSON file exposed read-only as the `settings` memory scope
    pub settings_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reset_state_on_error: true,
            default_scope: Some(crate::memory::DEFAULT_SCOPE.to_string()),
            settings_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            db_path: var("TURNWISE_DB_PATH").map(PathBuf::from),
            queue_depth: var("TURNWISE_QUEUE_DEPTH")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.queue_depth),
            idle_timeout: var("TURNWISE_IDLE_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .map_or(defaults.idle_timeout, Duration::from_secs),
            reset_state_on_error: var("TURNWISE_RESET_STATE_ON_ERROR")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.reset_state_on_error),
            default_scope: match var("TURNWISE_DEFAULT_SCOPE") {
                Some(v) if v.eq_ignore_ascii_case("none") => None,
                Some(v) => Some(v.trim().to_string()),
                None => defaults.default_scope,
            },
            settings_path: var("TURNWISE_SETTINGS").map(PathBuf::from),
        }
    }

    /// Contents of the settings file, or an empty map when none is set
    pub fn load_settings(&self) -> Result<Map<String, Value>, ConfigError> {
        match &self.settings_path {
            Some(path) => read_settings(path),
            None => Ok(Map::new()),
        }
    }

    /// Scope registry with the default scopes, this config's settings and
    /// default scope
    pub fn scope_registry(&self) -> Result<ScopeRegistry, ConfigError> {
        Ok(ScopeRegistry::with_defaults(self.load_settings()?)
            .with_default_scope(self.default_scope.as_deref()))
    }

    pub fn open_storage(&self) -> Result<Arc<dyn Storage>, ConfigError> {
        let Some(path) = &self.db_path else {
            tracing::info!("Using in-memory storage");
            return Ok(Arc::new(MemoryStorage::new()));
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        tracing::info!(path = %path.display(), "Opening state database");
        Ok(Arc::new(SqliteStorage::open(path)?))
    }
}

fn read_settings(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_str(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::NotAnObject(path.to_path_buf())),
        Err(source) => Err(ConfigError::InvalidJson {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
