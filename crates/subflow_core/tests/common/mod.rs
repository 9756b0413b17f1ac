//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

use subflow_core::config::GlobalLayer;
use subflow_core::jobs::{
    FsStorage, Job, JobRequest, JobStore, LanguageConfig, ManifestStorage, PersistPolicy,
    MANIFEST_FILE,
};
use subflow_core::models::{FeatureFlags, WorkflowMode};
use subflow_core::orchestrator::{
    ContextSelector, Dispatcher, ExecutionContext, StageError, StageInvocation, StageReport,
};
use subflow_core::planner::builtin_registry;

/// Context ids used by the built-in registry.
pub const CONTEXT_IDS: &[&str] = &[
    "ffmpeg", "demucs", "whisper", "pyannote", "vision", "network", "llm", "in-process",
];

/// What the mock does for one invocation of a stage.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    Interrupt,
    /// Report success without writing the declared outputs.
    SucceedWithoutOutputs,
    /// Write every declared output, then report failure.
    FailAfterWritingOutputs(String),
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Execution context that writes every declared output and records calls.
#[derive(Default)]
pub struct MockContext {
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    hooks: Mutex<HashMap<String, Hook>>,
    calls: Mutex<Vec<String>>,
}

impl MockContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue behaviors for a stage; once drained the stage succeeds.
    pub fn script(&self, stage: &str, behaviors: impl IntoIterator<Item = Behavior>) {
        self.scripts
            .lock()
            .entry(stage.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn fail_times(&self, stage: &str, times: usize) {
        self.script(
            stage,
            (0..times).map(|i| Behavior::Fail(format!("{} failure #{}", stage, i + 1))),
        );
    }

    /// Run `hook` whenever `stage` is invoked, before it reports.
    pub fn on_invoke(&self, stage: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().insert(stage.to_string(), Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, stage: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == stage).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl ExecutionContext for MockContext {
    fn invoke(&self, invocation: &StageInvocation<'_>) -> StageReport {
        let stage = invocation.stage.name.clone();
        self.calls.lock().push(stage.clone());
        if let Some(hook) = self.hooks.lock().get(&stage) {
            hook();
        }

        let behavior = self
            .scripts
            .lock()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Succeed);
        let duration = Duration::from_millis(1);

        match behavior {
            Behavior::Succeed => match write_outputs(invocation) {
                Ok(()) => StageReport::succeeded(duration),
                Err(e) => StageReport::failed(duration, e),
            },
            Behavior::SucceedWithoutOutputs => StageReport::succeeded(duration),
            Behavior::FailAfterWritingOutputs(message) => {
                let error = match write_outputs(invocation) {
                    Ok(()) => StageError::command_failed("mock", Some(1), message),
                    Err(e) => e,
                };
                StageReport::failed(duration, error)
            }
            Behavior::Fail(message) => {
                StageReport::failed(duration, StageError::command_failed("mock", Some(1), message))
            }
            Behavior::Interrupt => StageReport::interrupted(duration),
        }
    }

    fn supports_interruption(&self) -> bool {
        true
    }
}

/// Writes each declared output with the stage name and attempt number.
fn write_outputs(invocation: &StageInvocation<'_>) -> Result<(), StageError> {
    for output in &invocation.stage.outputs {
        let path = invocation.io.write_output(output)?;
        let body = format!(
            "{{\"stage\":\"{}\",\"attempt\":{}}}",
            invocation.stage.name, invocation.attempt
        );
        std::fs::write(&path, body).map_err(|e| StageError::io_error("write", e))?;
    }
    Ok(())
}

/// Formatted tracing output collected for assertions.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Subscriber that records warnings and errors into this buffer.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Storage whose manifest writes can be made to fail.
#[derive(Default)]
pub struct FlakyStorage {
    /// `None`: writes succeed. `Some(n)`: `n` more writes succeed, then all fail.
    allowance: Mutex<Option<u32>>,
}

impl FlakyStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_after(&self, writes: u32) {
        *self.allowance.lock() = Some(writes);
    }

    pub fn heal(&self) {
        *self.allowance.lock() = None;
    }
}

impl ManifestStorage for FlakyStorage {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        FsStorage.read(path)
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        if path.file_name().is_some_and(|n| n == MANIFEST_FILE) {
            let mut allowance = self.allowance.lock();
            if let Some(remaining) = allowance.as_mut() {
                if *remaining == 0 {
                    return Err(io::Error::other("disk full"));
                }
                *remaining -= 1;
            }
        }
        FsStorage.write_atomic(path, content)
    }
}

/// Job root, mock contexts and a global layer with zero retry backoff.
pub struct Harness {
    pub dir: TempDir,
    pub mock: Arc<MockContext>,
    pub global: Arc<GlobalLayer>,
}

impl Harness {
    pub fn new() -> Self {
        let defaults: toml::Table = toml::from_str("[retry]\nbackoff_ms = 0\n").unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            mock: MockContext::new(),
            global: Arc::new(GlobalLayer {
                defaults,
                ..Default::default()
            }),
        }
    }

    pub fn jobs_root(&self) -> std::path::PathBuf {
        self.dir.path().join("jobs")
    }

    /// A fresh store, as a new process would open it.
    pub fn store(&self) -> Arc<JobStore> {
        Arc::new(JobStore::new(self.jobs_root()))
    }

    pub fn store_with(&self, storage: Arc<dyn ManifestStorage>) -> Arc<JobStore> {
        Arc::new(
            JobStore::new(self.jobs_root())
                .with_storage(storage)
                .with_persist_policy(PersistPolicy {
                    retries: 0,
                    backoff: Duration::ZERO,
                }),
        )
    }

    pub fn selector(&self) -> ContextSelector {
        let mut selector = ContextSelector::new();
        for id in CONTEXT_IDS {
            selector.register(*id, self.mock.clone());
        }
        selector
    }

    pub fn dispatcher(&self, store: Arc<JobStore>) -> Dispatcher {
        self.dispatcher_with(store, self.selector())
    }

    pub fn dispatcher_with(&self, store: Arc<JobStore>, selector: ContextSelector) -> Dispatcher {
        Dispatcher::new(
            Arc::new(builtin_registry()),
            store,
            Arc::clone(&self.global),
            selector,
        )
    }

    pub fn create_job(&self, mode: WorkflowMode, flags: FeatureFlags) -> Job {
        let languages = LanguageConfig::new("ja").with_target("en");
        self.store()
            .create_job(JobRequest::new(mode, languages, flags).with_id("job-1"))
            .unwrap()
    }
}
