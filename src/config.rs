//! Layered configuration: CLI flag, then environment, then TOML file, then defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::scale::DEFAULT_TARGET_MAX;

pub const DEFAULT_CONFIG_FILE: &str = "grade-import.toml";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{0} must be set (flag, environment or config file)")]
    Missing(&'static str),

    #[error("default max marks must be a positive number, got {0}")]
    InvalidMaxMarks(f64),
}

/// Values as they appear in the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api_base_url: Option<String>,
    school_id: Option<String>,
    default_max_marks: Option<f64>,
    timeout_secs: Option<u64>,
}

/// Flag/environment values collected by clap.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub school_id: Option<String>,
    pub default_max_marks: Option<f64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub school_id: Option<String>,
    pub default_max_marks: f64,
    pub timeout_secs: u64,
}

impl Config {
    pub fn load(overrides: Overrides) -> Result<Self, ConfigError> {
        let file = match overrides.config_path.as_deref() {
            Some(path) => read_file(path)?,
            None => {
                let implicit = Path::new(DEFAULT_CONFIG_FILE);
                if implicit.exists() {
                    read_file(implicit)?
                } else {
                    FileConfig::default()
                }
            }
        };

        Self::merge(overrides, file)
    }

    fn merge(overrides: Overrides, file: FileConfig) -> Result<Self, ConfigError> {
        let default_max_marks = overrides
            .default_max_marks
            .or(file.default_max_marks)
            .unwrap_or(DEFAULT_TARGET_MAX);
        if !default_max_marks.is_finite() || default_max_marks <= 0.0 {
            return Err(ConfigError::InvalidMaxMarks(default_max_marks));
        }

        Ok(Config {
            api_base_url: overrides
                .api_base_url
                .or(file.api_base_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            school_id: overrides.school_id.or(file.school_id),
            default_max_marks,
            timeout_secs: overrides
                .timeout_secs
                .or(file.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn require_api_base_url(&self) -> Result<&str, ConfigError> {
        self.api_base_url
            .as_deref()
            .ok_or(ConfigError::Missing("GRADES_API_URL"))
    }

    pub fn require_school_id(&self) -> Result<&str, ConfigError> {
        self.school_id
            .as_deref()
            .ok_or(ConfigError::Missing("GRADES_SCHOOL_ID"))
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
