//! Configuration parsing for the resolver.
//!
//! Matches the key=value format `resolve` looks for next to the input file
//! (or at `--config <path>`). Precedence: CLI flags > config file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Recognized configuration, merging spec Section 6's options with the
/// ambient paths a runnable binary needs (input/export/registry locations,
/// log level).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parallel worker count. Default: logical cores.
    pub workers: usize,
    /// Checkpoint commit batch size.
    pub batch_size: usize,
    /// Stop after processing this many un-completed records.
    pub limit: Option<usize>,
    /// Re-run rows previously marked ERROR instead of skipping them.
    pub retry_errors: bool,
    /// Path to the checkpoint store's database file.
    pub checkpoint_path: PathBuf,
    /// If false, skip the LLM adapter entirely and always use the
    /// heuristic normalizer.
    pub model_backed_normalization: bool,
    /// Minimum spacing, across all workers combined, between LLM-dependent
    /// submissions.
    pub llm_min_interval_ms: u64,

    // Ambient additions (not in spec Section 6, needed to run the binary).
    pub input_path: PathBuf,
    pub export_path: PathBuf,
    pub registry_path: PathBuf,
    pub fts_path: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            batch_size: 100,
            limit: None,
            retry_errors: false,
            checkpoint_path: PathBuf::from("checkpoint.db"),
            model_backed_normalization: true,
            llm_min_interval_ms: 250,
            input_path: PathBuf::from("input.csv"),
            export_path: PathBuf::from("export.csv"),
            registry_path: PathBuf::from("registry"),
            fts_path: PathBuf::from("registry/fts"),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "workers" => self.workers = Self::parse_int(key, value)?,
            "batch_size" => self.batch_size = Self::parse_int(key, value)?,
            "limit" => {
                self.limit = if value.is_empty() {
                    None
                } else {
                    Some(Self::parse_int(key, value)?)
                };
            }
            "retry_errors" => self.retry_errors = Self::parse_bool(key, value)?,
            "checkpoint_path" => self.checkpoint_path = PathBuf::from(value),
            "model_backed_normalization" => {
                self.model_backed_normalization = Self::parse_bool(key, value)?;
            }
            "llm_min_interval_ms" => self.llm_min_interval_ms = Self::parse_int(key, value)? as u64,
            "input_path" => self.input_path = PathBuf::from(value),
            "export_path" => self.export_path = PathBuf::from(value),
            "registry_path" => self.registry_path = PathBuf::from(value),
            "fts_path" => self.fts_path = PathBuf::from(value),
            "log_level" => self.log_level = value.to_string(),
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<usize, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value (accepts the same synonyms as `resolve`'s CLI flags).
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root (e.g. the input
    /// file's directory, for config-file-relative paths).
    pub fn resolve_paths(&mut self, root: &Path) {
        if self.checkpoint_path.is_relative() {
            self.checkpoint_path = root.join(&self.checkpoint_path);
        }
        if self.input_path.is_relative() {
            self.input_path = root.join(&self.input_path);
        }
        if self.export_path.is_relative() {
            self.export_path = root.join(&self.export_path);
        }
        if self.registry_path.is_relative() {
            self.registry_path = root.join(&self.registry_path);
        }
        if self.fts_path.is_relative() {
            self.fts_path = root.join(&self.fts_path);
        }
    }
}
