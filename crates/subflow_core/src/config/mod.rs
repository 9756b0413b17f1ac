//! Configuration for Subflow.
//!
//! This module provides:
//! - TOML-based application settings
//! - Atomic file writes (write to temp, then rename)
//! - Per-job override files edited without losing comments
//! - The configuration cascade (stage → job → global → declared default)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use subflow_core::config::{ConfigCascade, ConfigManager, ConfigScope, GlobalLayer};
//!
//! let mut config = ConfigManager::new(".config/settings.toml");
//! config.load_or_create().unwrap();
//!
//! let global = Arc::new(GlobalLayer::from_settings(config.settings()));
//! let cascade = ConfigCascade::for_job(global, "jobs/abc".as_ref()).unwrap();
//! let model = cascade.get_str("whisper.model", ConfigScope::Stage("transcribe")).unwrap();
//! println!("transcribing with {}", model);
//! ```

mod cascade;
pub mod keys;
mod manager;
mod overrides;
mod settings;

pub use cascade::{ConfigCascade, ConfigScope, ConfigValue, GlobalLayer, StageConfig};
pub use manager::{ConfigError, ConfigManager, ConfigResult};
pub use overrides::{JobOverrides, OVERRIDES_FILE};
pub use settings::{ContextSettings, DispatcherSettings, LoggingSettings, PathSettings, Settings};
