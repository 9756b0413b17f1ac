//! Layered configuration lookup.
//!
//! Resolution order for a key is stage scope, then job scope, then the
//! global defaults from `settings.toml`, then the key's declared default.
//! The first defined value wins.
//!
//! The global layer is loaded once per process and shared read-only.
//! The job layer is re-read from `<job>/overrides.toml` whenever a stage
//! starts, so a resumed run picks up edits for stages that have not run yet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::keys::{self, DefaultValue, ValueKind};
use super::manager::{ConfigError, ConfigResult};
use super::overrides::JobOverrides;
use super::settings::Settings;

/// A resolved configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl ConfigValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
        }
    }

    /// Parse a CLI-style literal: `true`/`false`, integers, floats, else string.
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            Self::Bool(b)
        } else if let Ok(i) = raw.parse::<i64>() {
            Self::Integer(i)
        } else if let Ok(n) = raw.parse::<f64>() {
            Self::Number(n)
        } else {
            Self::String(raw.to_string())
        }
    }

    /// Render for environment variables.
    pub fn to_env_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Number(n) => n.to_string(),
        }
    }

    fn matches_kind(&self, kind: ValueKind) -> bool {
        matches!(
            (self, kind),
            (Self::String(_), ValueKind::String)
                | (Self::Bool(_), ValueKind::Bool)
                | (Self::Integer(_), ValueKind::Integer)
                | (Self::Integer(_), ValueKind::Number)
                | (Self::Number(_), ValueKind::Number)
        )
    }
}

impl From<DefaultValue> for ConfigValue {
    fn from(d: DefaultValue) -> Self {
        match d {
            DefaultValue::Str(s) => Self::String(s.to_string()),
            DefaultValue::Bool(b) => Self::Bool(b),
            DefaultValue::Integer(i) => Self::Integer(i),
            DefaultValue::Number(n) => Self::Number(n),
        }
    }
}

impl From<&toml::Value> for ConfigValue {
    fn from(v: &toml::Value) -> Self {
        match v {
            toml::Value::String(s) => Self::String(s.clone()),
            toml::Value::Boolean(b) => Self::Bool(*b),
            toml::Value::Integer(i) => Self::Integer(*i),
            toml::Value::Float(f) => Self::Number(*f),
            other => Self::String(other.to_string()),
        }
    }
}

/// Where a lookup starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope<'a> {
    Global,
    Job,
    Stage(&'a str),
}

impl std::fmt::Display for ConfigScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Job => f.write_str("job"),
            Self::Stage(name) => write!(f, "stage:{}", name),
        }
    }
}

/// Global layer taken from application settings.
#[derive(Debug, Clone, Default)]
pub struct GlobalLayer {
    pub defaults: toml::Table,
    pub stages: BTreeMap<String, toml::Table>,
}

impl GlobalLayer {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            defaults: settings.defaults.clone(),
            stages: settings.stages.clone(),
        }
    }
}

/// Layered lookup over global, job and stage tables.
#[derive(Debug, Clone)]
pub struct ConfigCascade {
    global: Arc<GlobalLayer>,
    job: JobOverrides,
    overrides_path: Option<PathBuf>,
}

impl ConfigCascade {
    /// Cascade with only the global layer.
    pub fn new(global: Arc<GlobalLayer>) -> Self {
        Self {
            global,
            job: JobOverrides::default(),
            overrides_path: None,
        }
    }

    /// Cascade for a job; loads `<job_dir>/overrides.toml`.
    pub fn for_job(global: Arc<GlobalLayer>, job_dir: &Path) -> ConfigResult<Self> {
        let path = JobOverrides::path_in(job_dir);
        let job = JobOverrides::load(&path)?;
        Ok(Self {
            global,
            job,
            overrides_path: Some(path),
        })
    }

    /// Cascade with explicit in-memory job overrides (no backing file).
    pub fn with_overrides(global: Arc<GlobalLayer>, job: JobOverrides) -> Self {
        Self {
            global,
            job,
            overrides_path: None,
        }
    }

    /// Re-read the job override file from disk.
    pub fn refresh_job_layer(&mut self) -> ConfigResult<()> {
        if let Some(path) = &self.overrides_path {
            self.job = JobOverrides::load(path)?;
        }
        Ok(())
    }

    /// Resolve a key starting at `scope`.
    pub fn resolve(&self, key: &str, scope: ConfigScope<'_>) -> ConfigResult<ConfigValue> {
        if let Some(v) = self.lookup_layers(key, scope) {
            return Ok(v);
        }
        match keys::find(key).and_then(|k| k.default) {
            Some(d) => Ok(d.into()),
            None => Err(ConfigError::ConfigMissing {
                key: key.to_string(),
                scope: scope.to_string(),
            }),
        }
    }

    /// Resolve a key, returning `fallback` instead of `ConfigMissing`.
    pub fn resolve_or(&self, key: &str, scope: ConfigScope<'_>, fallback: ConfigValue) -> ConfigValue {
        self.resolve(key, scope).unwrap_or(fallback)
    }

    /// Resolve a key that may legitimately be absent.
    pub fn resolve_opt(&self, key: &str, scope: ConfigScope<'_>) -> Option<ConfigValue> {
        self.resolve(key, scope).ok()
    }

    pub fn get_str(&self, key: &str, scope: ConfigScope<'_>) -> ConfigResult<String> {
        match self.resolve(key, scope)? {
            ConfigValue::String(s) => Ok(s),
            other => Err(mismatch(key, "string", &other)),
        }
    }

    pub fn get_bool(&self, key: &str, scope: ConfigScope<'_>) -> ConfigResult<bool> {
        match self.resolve(key, scope)? {
            ConfigValue::Bool(b) => Ok(b),
            other => Err(mismatch(key, "bool", &other)),
        }
    }

    pub fn get_i64(&self, key: &str, scope: ConfigScope<'_>) -> ConfigResult<i64> {
        match self.resolve(key, scope)? {
            ConfigValue::Integer(i) => Ok(i),
            other => Err(mismatch(key, "integer", &other)),
        }
    }

    pub fn get_f64(&self, key: &str, scope: ConfigScope<'_>) -> ConfigResult<f64> {
        match self.resolve(key, scope)? {
            ConfigValue::Number(n) => Ok(n),
            ConfigValue::Integer(i) => Ok(i as f64),
            other => Err(mismatch(key, "number", &other)),
        }
    }

    /// Type-check every declared key present in any layer.
    ///
    /// Run before planning so a bad override fails the job before any
    /// stage executes.
    pub fn validate_declared(&self) -> ConfigResult<()> {
        let mut tables: Vec<&toml::Table> = vec![&self.global.defaults, &self.job.job];
        tables.extend(self.global.stages.values());
        tables.extend(self.job.stages.values());

        for table in tables {
            for declared in keys::DECLARED_KEYS {
                if let Some(raw) = lookup(table, declared.name) {
                    let v = ConfigValue::from(raw);
                    if !v.matches_kind(declared.kind) {
                        return Err(ConfigError::TypeMismatch {
                            key: declared.name.to_string(),
                            expected: declared.kind.as_str(),
                            found: v.kind_name(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// View of the cascade bound to one stage.
    pub fn for_stage(&self, stage: &str) -> StageConfig {
        StageConfig {
            stage: stage.to_string(),
            cascade: self.clone(),
        }
    }

    fn lookup_layers(&self, key: &str, scope: ConfigScope<'_>) -> Option<ConfigValue> {
        if let ConfigScope::Stage(stage) = scope {
            let stage_hit = self
                .job
                .stages
                .get(stage)
                .and_then(|t| lookup(t, key))
                .or_else(|| self.global.stages.get(stage).and_then(|t| lookup(t, key)));
            if let Some(v) = stage_hit {
                return Some(v.into());
            }
        }
        if matches!(scope, ConfigScope::Stage(_) | ConfigScope::Job) {
            if let Some(v) = lookup(&self.job.job, key) {
                return Some(v.into());
            }
        }
        lookup(&self.global.defaults, key).map(Into::into)
    }

    /// Merged stage tables for `stage` (job file wins).
    fn stage_table(&self, stage: &str) -> BTreeMap<String, ConfigValue> {
        let mut merged = BTreeMap::new();
        for table in [self.global.stages.get(stage), self.job.stages.get(stage)]
            .into_iter()
            .flatten()
        {
            flatten_into(&mut merged, "", table);
        }
        merged
    }
}

/// Configuration as seen by one stage at the moment it starts.
#[derive(Debug, Clone)]
pub struct StageConfig {
    stage: String,
    cascade: ConfigCascade,
}

impl StageConfig {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn resolve(&self, key: &str) -> ConfigResult<ConfigValue> {
        self.cascade.resolve(key, ConfigScope::Stage(&self.stage))
    }

    pub fn resolve_opt(&self, key: &str) -> Option<ConfigValue> {
        self.cascade.resolve_opt(key, ConfigScope::Stage(&self.stage))
    }

    pub fn get_str(&self, key: &str) -> ConfigResult<String> {
        self.cascade.get_str(key, ConfigScope::Stage(&self.stage))
    }

    pub fn get_bool(&self, key: &str) -> ConfigResult<bool> {
        self.cascade.get_bool(key, ConfigScope::Stage(&self.stage))
    }

    pub fn get_i64(&self, key: &str) -> ConfigResult<i64> {
        self.cascade.get_i64(key, ConfigScope::Stage(&self.stage))
    }

    pub fn get_f64(&self, key: &str) -> ConfigResult<f64> {
        self.cascade.get_f64(key, ConfigScope::Stage(&self.stage))
    }

    /// Environment variables for an isolated runtime.
    ///
    /// Declared keys resolve through the full cascade; undeclared keys
    /// from the stage tables are passed through as well.
    /// `whisper.model` becomes `SUBFLOW_WHISPER_MODEL`.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut vars: BTreeMap<String, String> = BTreeMap::new();
        for declared in keys::DECLARED_KEYS {
            if let Some(v) = self.resolve_opt(declared.name) {
                vars.insert(env_name(declared.name), v.to_env_string());
            }
        }
        for (key, v) in self.cascade.stage_table(&self.stage) {
            vars.insert(env_name(&key), v.to_env_string());
        }
        vars.into_iter().collect()
    }
}

fn mismatch(key: &str, expected: &'static str, found: &ConfigValue) -> ConfigError {
    ConfigError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.kind_name(),
    }
}

/// Look up `key` literally, then as a dotted path through nested tables.
fn lookup<'t>(table: &'t toml::Table, key: &str) -> Option<&'t toml::Value> {
    if let Some(v) = table.get(key) {
        return Some(v);
    }
    let mut parts = key.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn flatten_into(out: &mut BTreeMap<String, ConfigValue>, prefix: &str, table: &toml::Table) {
    for (k, v) in table {
        let full = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{}.{}", prefix, k)
        };
        match v {
            toml::Value::Table(inner) => flatten_into(out, &full, inner),
            other => {
                out.insert(full, other.into());
            }
        }
    }
}

fn env_name(key: &str) -> String {
    let body: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("SUBFLOW_{}", body)
}
