use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::core::config::data::{path_display, Config};

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config at {}: {source}", path_display(.path))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config at {}: {source}", path_display(.path))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not determine the {0} directory for this platform")]
    NoProjectDir(&'static str),
}

fn project_dirs(kind: &'static str) -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("org", "parley", "parley").ok_or(ConfigError::NoProjectDir(kind))
}

/// Write `contents` to `path` through a temp file in the same directory so
/// readers never see a partial file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir)?;
    }

    let mut temp_file = match parent {
        Some(dir) => NamedTempFile::new_in(dir)?,
        None => NamedTempFile::new()?,
    };
    temp_file.write_all(contents)?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

impl Config {
    /// Load the config at `config_path`; a missing file yields the defaults.
    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            debug!(path = %path_display(config_path), "no config file, using defaults");
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_atomically(config_path, contents.as_bytes()).map_err(|source| {
            ConfigError::Write {
                path: config_path.to_path_buf(),
                source,
            }
        })?;
        debug!(path = %path_display(config_path), "config saved");
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs("config")?.config_dir().join("config.toml"))
    }

    /// Directory holding one saved conversation tree per character.
    pub fn trees_dir() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs("data")?.data_dir().join("trees"))
    }
}
