//! Config manager for loading, saving, and atomic updates.
//!
//! Key features:
//! - Atomic writes (write to temp file, then rename)
//! - Existing files are never rewritten, so hand-written comments survive

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::settings::Settings;
use crate::atomic::write_atomic;

/// Errors that can occur during config operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Failed to parse config for editing: {0}")]
    EditParseError(#[from] toml_edit::TomlError),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// A cascade lookup found no value at any level and the key has no default.
    #[error("Configuration key '{key}' is not set (scope: {scope}) and has no default")]
    ConfigMissing { key: String, scope: String },

    /// A value exists but has the wrong type for the caller.
    #[error("Configuration key '{key}' expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Result type for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Manages application configuration.
///
/// Handles loading and atomic saving of `settings.toml`.
pub struct ConfigManager {
    /// Path to the config file.
    config_path: PathBuf,
    /// Current settings loaded in memory.
    settings: Settings,
}

impl ConfigManager {
    /// Create a new config manager with the given config file path.
    ///
    /// Does not load the config - call `load()` or `load_or_create()` after.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            settings: Settings::default(),
        }
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get a reference to the current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load config from file.
    ///
    /// Returns error if file doesn't exist.
    pub fn load(&mut self) -> ConfigResult<()> {
        if !self.config_path.exists() {
            return Err(ConfigError::NotFound(self.config_path.clone()));
        }

        let content = fs::read_to_string(&self.config_path)?;
        self.settings = toml::from_str(&content)?;
        Ok(())
    }

    /// Load config from file, creating with defaults if it doesn't exist.
    ///
    /// An existing file is never rewritten here: it may carry hand-written
    /// `[stages]` and `[contexts]` tables with comments.
    pub fn load_or_create(&mut self) -> ConfigResult<()> {
        if self.config_path.exists() {
            self.load()
        } else {
            self.settings = Settings::default();
            self.save()
        }
    }

    /// Ensure the jobs and logs directories exist.
    pub fn ensure_dirs_exist(&self) -> ConfigResult<()> {
        for dir in [self.jobs_root(), self.logs_folder()] {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    /// Get the jobs root path.
    pub fn jobs_root(&self) -> PathBuf {
        PathBuf::from(&self.settings.paths.jobs_root)
    }

    /// Get the logs folder path.
    pub fn logs_folder(&self) -> PathBuf {
        PathBuf::from(&self.settings.paths.logs_folder)
    }

    /// Save the entire config atomically.
    pub fn save(&self) -> ConfigResult<()> {
        let content = self.generate_config_with_comments()?;
        write_atomic(&self.config_path, content.as_bytes())?;
        Ok(())
    }

    /// Generate config content with helpful comments.
    fn generate_config_with_comments(&self) -> ConfigResult<String> {
        let mut output = String::new();

        output.push_str("# Subflow Configuration\n");
        output.push_str(
            "# Stage tables ([stages.<name>]) and execution contexts ([contexts.<id>]) may be added by hand.\n\n",
        );

        let sections: [(&str, &str, String); 4] = [
            (
                "Job and log directories",
                "paths",
                toml::to_string_pretty(&self.settings.paths)?,
            ),
            (
                "Logging configuration",
                "logging",
                toml::to_string_pretty(&self.settings.logging)?,
            ),
            (
                "Manifest persistence",
                "dispatcher",
                toml::to_string_pretty(&self.settings.dispatcher)?,
            ),
            (
                "Global defaults for configuration keys",
                "defaults",
                toml::to_string_pretty(&self.settings.defaults)?,
            ),
        ];

        for (comment, table, body) in sections {
            output.push_str(&format!("# {}\n[{}]\n", comment, table));
            for line in body.lines() {
                output.push_str(line);
                output.push('\n');
            }
            output.push('\n');
        }

        if !self.settings.stages.is_empty() || !self.settings.contexts.is_empty() {
            #[derive(serde::Serialize)]
            struct Extra<'a> {
                stages: &'a std::collections::BTreeMap<String, toml::Table>,
                contexts:
                    &'a std::collections::BTreeMap<String, super::settings::ContextSettings>,
            }
            output.push_str(&toml::to_string_pretty(&Extra {
                stages: &self.settings.stages,
                contexts: &self.settings.contexts,
            })?);
        }

        Ok(output)
    }
}
