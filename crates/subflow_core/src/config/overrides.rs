//! Per-job override file (`<job>/overrides.toml`).
//!
//! ```toml
//! [job]
//! "whisper.model" = "medium"
//!
//! [stages.translate]
//! "retry.max_attempts" = 5
//! ```
//!
//! Edits go through toml_edit so hand-written comments survive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use toml_edit::{value, DocumentMut, Item, Table};

use super::cascade::ConfigValue;
use super::manager::ConfigResult;
use crate::atomic::write_atomic;

/// File name of the override file inside a job directory.
pub const OVERRIDES_FILE: &str = "overrides.toml";

/// Parsed job and stage layers from an override file.
#[derive(Debug, Clone, Default)]
pub struct JobOverrides {
    pub job: toml::Table,
    pub stages: BTreeMap<String, toml::Table>,
}

impl JobOverrides {
    /// Path of the override file for a job directory.
    pub fn path_in(job_dir: &Path) -> PathBuf {
        job_dir.join(OVERRIDES_FILE)
    }

    /// Load overrides; a missing file is an empty layer.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let mut table: toml::Table = toml::from_str(&content)?;

        let job = match table.remove("job") {
            Some(toml::Value::Table(t)) => t,
            _ => toml::Table::new(),
        };

        let mut stages = BTreeMap::new();
        if let Some(toml::Value::Table(stage_tables)) = table.remove("stages") {
            for (name, v) in stage_tables {
                if let toml::Value::Table(t) = v {
                    stages.insert(name, t);
                }
            }
        }

        Ok(Self { job, stages })
    }

    /// Set a job-scoped override.
    pub fn set_job(path: &Path, key: &str, v: &ConfigValue) -> ConfigResult<()> {
        edit(path, |doc| {
            let job = ensure_table(doc.as_table_mut(), "job");
            job[key] = to_item(v);
        })
    }

    /// Set a stage-scoped override.
    pub fn set_stage(path: &Path, stage: &str, key: &str, v: &ConfigValue) -> ConfigResult<()> {
        edit(path, |doc| {
            let stages = ensure_table(doc.as_table_mut(), "stages");
            stages.set_implicit(true);
            let stage_table = ensure_table(stages, stage);
            stage_table[key] = to_item(v);
        })
    }
}

fn edit(path: &Path, apply: impl FnOnce(&mut DocumentMut)) -> ConfigResult<()> {
    let mut doc: DocumentMut = if path.exists() {
        fs::read_to_string(path)?.parse()?
    } else {
        DocumentMut::new()
    };
    apply(&mut doc);
    write_atomic(path, doc.to_string().as_bytes())?;
    Ok(())
}

fn ensure_table<'a>(parent: &'a mut Table, name: &str) -> &'a mut Table {
    let item = parent.entry(name).or_insert(Item::Table(Table::new()));
    if !item.is_table() {
        *item = Item::Table(Table::new());
    }
    match item {
        Item::Table(t) => t,
        _ => unreachable!("entry was just made a table"),
    }
}

fn to_item(v: &ConfigValue) -> Item {
    match v {
        ConfigValue::String(s) => value(s.as_str()),
        ConfigValue::Bool(b) => value(*b),
        ConfigValue::Integer(i) => value(*i),
        ConfigValue::Number(n) => value(*n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let o = JobOverrides::load(&JobOverrides::path_in(dir.path())).unwrap();
        assert!(o.job.is_empty());
        assert!(o.stages.is_empty());
    }

    #[test]
    fn set_and_reload_preserves_comments() {
        let dir = tempdir().unwrap();
        let path = JobOverrides::path_in(dir.path());
        fs::write(&path, "# tuned for anime\n[job]\n\"whisper.model\" = \"medium\"\n").unwrap();

        JobOverrides::set_stage(
            &path,
            "translate",
            "retry.max_attempts",
            &ConfigValue::Integer(5),
        )
        .unwrap();
        JobOverrides::set_job(&path, "whisper.vad_filter", &ConfigValue::Bool(false)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("# tuned for anime"));

        let o = JobOverrides::load(&path).unwrap();
        assert_eq!(o.job["whisper.model"].as_str(), Some("medium"));
        assert_eq!(o.job["whisper.vad_filter"].as_bool(), Some(false));
        assert_eq!(
            o.stages["translate"]["retry.max_attempts"].as_integer(),
            Some(5)
        );
    }
}
