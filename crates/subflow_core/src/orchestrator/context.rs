//! Execution contexts: where a stage body actually runs.
//!
//! A stage definition names a context id. The dispatcher looks the id up in a
//! `ContextSelector` and hands the context a `StageInvocation`. Contexts never
//! touch the manifest; they only report what happened.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::errors::{StageError, StepResult};
use crate::config::{ContextSettings, StageConfig};
use crate::jobs::Job;
use crate::logging::JobLogger;
use crate::planner::{StageDefinition, IN_PROCESS};
use crate::stageio::StageIo;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to keep reading output after the child exits while nothing arrives.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Handle for cancelling a running dispatch.
///
/// Checked between stages; interruptible contexts also watch it while a
/// stage runs.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a context needs to run one attempt of one stage.
pub struct StageInvocation<'a> {
    pub job: &'a Job,
    pub stage: &'a StageDefinition,
    pub io: &'a StageIo,
    pub config: &'a StageConfig,
    /// Resolved input artifacts by name.
    pub inputs: BTreeMap<String, PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub cancel: &'a CancelHandle,
    pub logger: &'a JobLogger,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Succeeded,
    Failed,
    /// Cancelled while running; the stage should return to pending.
    Interrupted,
}

/// Result of one invocation.
#[derive(Debug)]
pub struct StageReport {
    pub status: ReportStatus,
    pub duration: Duration,
    pub error: Option<StageError>,
}

impl StageReport {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            status: ReportStatus::Succeeded,
            duration,
            error: None,
        }
    }

    pub fn failed(duration: Duration, error: StageError) -> Self {
        Self {
            status: ReportStatus::Failed,
            duration,
            error: Some(error),
        }
    }

    pub fn interrupted(duration: Duration) -> Self {
        Self {
            status: ReportStatus::Interrupted,
            duration,
            error: Some(StageError::Interrupted),
        }
    }

    fn from_result(duration: Duration, result: StepResult<()>) -> Self {
        match result {
            Ok(()) => Self::succeeded(duration),
            Err(StageError::Interrupted) => Self::interrupted(duration),
            Err(e) => Self::failed(duration, e),
        }
    }
}

/// Runs stage invocations.
pub trait ExecutionContext: Send + Sync {
    fn invoke(&self, invocation: &StageInvocation<'_>) -> StageReport;

    /// Whether a running stage can be stopped through the cancel handle.
    fn supports_interruption(&self) -> bool {
        false
    }
}

/// Body of a stage that runs inside the orchestrator process.
pub trait StageBody: Send + Sync {
    fn run(&self, io: &StageIo, config: &StageConfig) -> StepResult<()>;
}

impl<F> StageBody for F
where
    F: Fn(&StageIo, &StageConfig) -> StepResult<()> + Send + Sync,
{
    fn run(&self, io: &StageIo, config: &StageConfig) -> StepResult<()> {
        self(io, config)
    }
}

/// Context holding in-process stage bodies keyed by stage name.
#[derive(Default)]
pub struct InProcessContext {
    bodies: HashMap<String, Arc<dyn StageBody>>,
}

impl InProcessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with the bodies of the built-in in-process stages.
    pub fn builtin() -> Self {
        let mut ctx = Self::new();
        for (name, body) in crate::stages::builtin_bodies() {
            ctx.register(name, body);
        }
        ctx
    }

    pub fn register(&mut self, stage: impl Into<String>, body: Arc<dyn StageBody>) -> &mut Self {
        self.bodies.insert(stage.into(), body);
        self
    }

    /// Register a body (builder pattern).
    pub fn with_body(mut self, stage: impl Into<String>, body: impl StageBody + 'static) -> Self {
        self.register(stage, Arc::new(body));
        self
    }

    pub fn has_body(&self, stage: &str) -> bool {
        self.bodies.contains_key(stage)
    }
}

impl ExecutionContext for InProcessContext {
    fn invoke(&self, invocation: &StageInvocation<'_>) -> StageReport {
        let started = Instant::now();
        let Some(body) = self.bodies.get(&invocation.stage.name) else {
            return StageReport::failed(
                started.elapsed(),
                StageError::other(format!(
                    "No in-process body registered for stage '{}'",
                    invocation.stage.name
                )),
            );
        };
        let result = body.run(invocation.io, invocation.config);
        StageReport::from_result(started.elapsed(), result)
    }
}

/// Context that runs each stage as a child process.
///
/// The child learns where it is through `SUBFLOW_*` environment variables
/// (see [`stage_env`]) and signals failure with a nonzero exit code.
pub struct SubprocessContext {
    id: String,
    settings: ContextSettings,
    poll_interval: Duration,
}

impl SubprocessContext {
    pub fn new(id: impl Into<String>, settings: ContextSettings) -> Self {
        Self {
            id: id.into(),
            settings,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn build_command(&self, invocation: &StageInvocation<'_>) -> Command {
        let io = invocation.io;
        let mut cmd = Command::new(&self.settings.program);
        for arg in &self.settings.args {
            cmd.arg(substitute(arg, invocation));
        }

        let working_dir = self
            .settings
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| io.job_dir().to_path_buf());
        cmd.current_dir(working_dir);

        cmd.envs(&self.settings.env);
        cmd.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so a kill also reaches whatever the program spawned
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl ExecutionContext for SubprocessContext {
    fn invoke(&self, invocation: &StageInvocation<'_>) -> StageReport {
        let started = Instant::now();
        let logger = invocation.logger;
        let mut cmd = self.build_command(invocation);

        logger.command(&format!("{:?}", cmd));
        tracing::debug!(context = %self.id, stage = %invocation.stage.name, "Running {:?}", cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StageReport::failed(
                    started.elapsed(),
                    StageError::command_failed(
                        &self.settings.program,
                        None,
                        format!("failed to spawn: {}", e),
                    ),
                );
            }
        };

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, false, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, true, tx);
        }
        let mut output = OutputPump::new(logger, rx);
        let deadline = invocation.timeout.map(|limit| started + limit);

        let exit = wait_for_exit(
            &mut child,
            &mut output,
            invocation.cancel,
            deadline,
            self.poll_interval,
        );
        match exit {
            Exit::Exited(_) => output.finish(),
            // Readers may be held open by orphans; take what is buffered and go
            _ => output.drain_ready(),
        }
        let last_stderr = output.last_stderr;

        let elapsed = started.elapsed();
        match exit {
            Exit::Exited(status) if status.success() => StageReport::succeeded(elapsed),
            Exit::Exited(status) => {
                let message = last_stderr.unwrap_or_else(|| format!("exited with {}", status));
                StageReport::failed(
                    elapsed,
                    StageError::command_failed(&self.settings.program, status.code(), message),
                )
            }
            Exit::Cancelled => {
                logger.warn(&format!("Stage '{}' interrupted", invocation.stage.name));
                StageReport::interrupted(elapsed)
            }
            Exit::TimedOut => {
                let limit = invocation.timeout.unwrap_or_default();
                StageReport::failed(elapsed, StageError::Timeout { limit })
            }
            Exit::WaitFailed(e) => {
                StageReport::failed(elapsed, StageError::io_error("wait for stage process", e))
            }
        }
    }

    fn supports_interruption(&self) -> bool {
        true
    }
}

enum Exit {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
    WaitFailed(std::io::Error),
}

/// Poll the child until it exits, the cancel handle fires or the deadline
/// passes, forwarding output in between.
fn wait_for_exit(
    child: &mut Child,
    output: &mut OutputPump<'_>,
    cancel: &CancelHandle,
    deadline: Option<Instant>,
    poll_interval: Duration,
) -> Exit {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Exit::Exited(status),
            Ok(None) => {}
            Err(e) => {
                kill(child);
                return Exit::WaitFailed(e);
            }
        }
        if cancel.is_cancelled() {
            kill(child);
            return Exit::Cancelled;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            kill(child);
            return Exit::TimedOut;
        }
        output.pump(poll_interval);
    }
}

/// Kill the child and its process group.
fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: plain signal delivery to the group created at spawn.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

struct OutputLine {
    text: String,
    is_stderr: bool,
}

/// Read `stream` line by line on a detached thread. Invalid UTF-8 is
/// replaced, never fatal, so the pipe is drained until the writer closes it.
fn spawn_reader(stream: impl Read + Send + 'static, is_stderr: bool, tx: Sender<OutputLine>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(OutputLine { text, is_stderr }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Forwards child output to the job logger.
/// Lines of the form `PROGRESS: <percent>` become progress updates.
struct OutputPump<'a> {
    logger: &'a JobLogger,
    rx: Receiver<OutputLine>,
    open: bool,
    /// Last non-empty stderr line, used as the failure message.
    last_stderr: Option<String>,
}

impl<'a> OutputPump<'a> {
    fn new(logger: &'a JobLogger, rx: Receiver<OutputLine>) -> Self {
        Self {
            logger,
            rx,
            open: true,
            last_stderr: None,
        }
    }

    /// Wait up to `wait` for output and forward whatever arrives.
    fn pump(&mut self, wait: Duration) {
        if !self.open {
            thread::sleep(wait);
            return;
        }
        match self.rx.recv_timeout(wait) {
            Ok(line) => {
                self.handle(line);
                self.drain_ready();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.open = false,
        }
    }

    /// Read until both pipes close or output goes quiet for `OUTPUT_GRACE`.
    fn finish(&mut self) {
        while self.open {
            match self.rx.recv_timeout(OUTPUT_GRACE) {
                Ok(line) => self.handle(line),
                Err(_) => self.open = false,
            }
        }
    }

    fn drain_ready(&mut self) {
        while let Ok(line) = self.rx.try_recv() {
            self.handle(line);
        }
    }

    fn handle(&mut self, line: OutputLine) {
        if let Some(percent) = parse_progress(&line.text) {
            self.logger.progress(percent);
            return;
        }
        self.logger.output_line(&line.text, line.is_stderr);
        let trimmed = line.text.trim();
        if line.is_stderr && !trimmed.is_empty() {
            self.last_stderr = Some(trimmed.to_string());
        }
    }
}

fn parse_progress(line: &str) -> Option<u32> {
    let value = line.trim().strip_prefix("PROGRESS:")?;
    let percent: u32 = value.trim().trim_end_matches('%').parse().ok()?;
    Some(percent.min(100))
}

fn substitute(arg: &str, invocation: &StageInvocation<'_>) -> String {
    arg.replace("{stage}", &invocation.stage.name)
        .replace("{stage_dir}", &path_str(invocation.io.stage_dir()))
        .replace("{job_dir}", &path_str(invocation.io.job_dir()))
        .replace("{job_id}", &invocation.job.id)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Environment handed to a stage: job location, resolved inputs, languages
/// and every configuration value visible to the stage.
pub fn stage_env(
    job: &Job,
    io: &StageIo,
    config: &StageConfig,
    inputs: &BTreeMap<String, PathBuf>,
    attempt: u32,
) -> Vec<(String, String)> {
    let mut env = config.env();

    let inputs_json = serde_json::Value::Object(
        inputs
            .iter()
            .map(|(name, path)| (name.clone(), serde_json::Value::String(path_str(path))))
            .collect(),
    );

    env.push(("SUBFLOW_JOB_ID".into(), job.id.clone()));
    env.push(("SUBFLOW_JOB_DIR".into(), path_str(io.job_dir())));
    env.push(("SUBFLOW_STAGE".into(), io.stage().to_string()));
    env.push(("SUBFLOW_STAGE_DIR".into(), path_str(io.stage_dir())));
    env.push(("SUBFLOW_LATEST_DIR".into(), path_str(&io.latest_dir())));
    env.push(("SUBFLOW_INPUTS".into(), inputs_json.to_string()));
    env.push(("SUBFLOW_ATTEMPT".into(), attempt.to_string()));
    env.push(("SUBFLOW_SOURCE_LANGUAGE".into(), job.languages.source.clone()));
    if let Some(target) = &job.languages.target {
        env.push(("SUBFLOW_TARGET_LANGUAGE".into(), target.clone()));
    }
    if let Some(input) = &job.input {
        env.push(("SUBFLOW_INPUT".into(), path_str(input)));
    }
    env
}

/// Maps context ids to execution contexts.
#[derive(Clone, Default)]
pub struct ContextSelector {
    contexts: HashMap<String, Arc<dyn ExecutionContext>>,
}

impl ContextSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector with the built-in in-process bodies and one subprocess
    /// context per `[contexts.<id>]` table.
    pub fn from_settings(contexts: &BTreeMap<String, ContextSettings>) -> Self {
        let mut selector = Self::new();
        selector.register(IN_PROCESS, Arc::new(InProcessContext::builtin()));
        for (id, settings) in contexts {
            if settings.program.is_empty() {
                tracing::warn!(context = %id, "Context has no program configured; skipping");
                continue;
            }
            selector.register(id.clone(), Arc::new(SubprocessContext::new(id, settings.clone())));
        }
        selector
    }

    pub fn register(&mut self, id: impl Into<String>, context: Arc<dyn ExecutionContext>) -> &mut Self {
        self.contexts.insert(id.into(), context);
        self
    }

    /// Register a context (builder pattern).
    pub fn with(mut self, id: impl Into<String>, context: impl ExecutionContext + 'static) -> Self {
        self.register(id, Arc::new(context));
        self
    }

    pub fn get(&self, id: &str) -> StepResult<Arc<dyn ExecutionContext>> {
        self.contexts
            .get(id)
            .cloned()
            .ok_or_else(|| StageError::ContextUnavailable(id.to_string()))
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.contexts.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
