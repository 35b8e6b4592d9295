use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::db::ExecutionEngineConditions;

const MAX_RECENT_SCRIPTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration directory is available on this system")]
    NoConfigDir,

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub conditions: ExecutionEngineConditions,
    /// Added to every reported line number.
    pub starting_line: usize,
    pub variables: BTreeMap<String, String>,
    pub recent_scripts: Vec<PathBuf>,
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            conditions: ExecutionEngineConditions::default(),
            starting_line: 0,
            variables: BTreeMap::new(),
            recent_scripts: Vec::new(),
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("sql_batch_engine");
            path.push("config.json");
            path
        })
    }

    /// Defaults when the file is missing or unreadable.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::new(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("failed to read {}: {err}", path.display());
                return Self::new();
            }
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("ignoring malformed config {}: {err}", path.display());
                Self::new()
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(write_error)?;
        tracing::debug!("saved config to {}", path.display());
        Ok(())
    }

    pub fn add_recent_script(&mut self, path: &Path) {
        self.recent_scripts.retain(|existing| existing != path);
        self.recent_scripts.insert(0, path.to_path_buf());
        self.recent_scripts.truncate(MAX_RECENT_SCRIPTS);
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}
