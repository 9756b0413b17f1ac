//! Runs a job's plan stage by stage.
//!
//! The manifest is the only record of progress. Every stage transition is
//! persisted before the next step is taken, so a run stopped at any point
//! can be resumed by calling [`Dispatcher::run`] again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::context::{stage_env, CancelHandle, ContextSelector, ReportStatus, StageInvocation, StageReport};
use super::errors::{OrchestratorError, OrchestratorResult, StageError, StepResult};
use crate::config::keys::{RETRY_BACKOFF_MS, RETRY_MAX_ATTEMPTS, STAGE_TIMEOUT_SECS};
use crate::config::{ConfigCascade, GlobalLayer, StageConfig};
use crate::jobs::{Job, JobStore, Manifest, TransitionDetails};
use crate::logging::{JobLogger, LogConfig};
use crate::models::{JobStatus, StageStatus};
use crate::planner::{
    Criticality, Idempotency, InputSource, Plan, PlanError, Planner, StageDefinition, StageRegistry,
};
use crate::stageio::{StageIoError, StageLayout};

/// Shared console sink for job log lines.
pub type SharedLogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stages to re-run even if they already succeeded or were skipped.
    pub force_rerun: Vec<String>,
    /// Also re-run everything downstream of a forced stage. Without it only
    /// [`Idempotency::RerunSafe`] dependents follow.
    pub cascade_rerun: bool,
    /// Stops this run at the next stage boundary, or immediately for
    /// interruptible contexts.
    pub cancel: CancelHandle,
}

impl RunOptions {
    pub fn force(mut self, stage: impl Into<String>) -> Self {
        self.force_rerun.push(stage.into());
        self
    }

    pub fn cascading(mut self) -> Self {
        self.cascade_rerun = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

/// An optional stage that failed without stopping the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedStage {
    pub stage: String,
    pub error: String,
    /// Planned stages that consume its outputs and now run without them.
    pub downstream: Vec<String>,
}

/// The stage that stopped the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStage {
    pub stage: String,
    /// Total attempts recorded for the stage, across runs.
    pub attempts: u32,
    pub error: String,
}

/// What one dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub job_id: String,
    pub job_status: JobStatus,
    /// Stages that succeeded in this run.
    pub executed: Vec<String>,
    /// Stages an earlier run already finished, by success or by skipping.
    pub skipped_done: Vec<String>,
    pub degraded: Vec<DegradedStage>,
    pub failed: Option<FailedStage>,
    /// Stage that was running when the run was cancelled.
    pub interrupted: Option<String>,
    /// Attempts made in this run, per stage.
    pub attempts: BTreeMap<String, u32>,
}

impl DispatchOutcome {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_status: JobStatus::Running,
            executed: Vec::new(),
            skipped_done: Vec::new(),
            degraded: Vec::new(),
            failed: None,
            interrupted: None,
            attempts: BTreeMap::new(),
        }
    }

    /// Human-readable report of the run.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        match self.job_status {
            JobStatus::Completed => {
                if self.executed.is_empty() && self.degraded.is_empty() {
                    lines.push(format!("Job {} is already complete; nothing to do", self.job_id));
                } else {
                    lines.push(format!(
                        "Job {} completed: {} stage(s) run, {} already done",
                        self.job_id,
                        self.executed.len(),
                        self.skipped_done.len()
                    ));
                }
            }
            JobStatus::Failed => {
                if let Some(failed) = &self.failed {
                    lines.push(format!(
                        "Job {} failed at stage '{}' after {} attempt(s): {}",
                        self.job_id, failed.stage, failed.attempts, failed.error
                    ));
                } else {
                    lines.push(format!("Job {} failed", self.job_id));
                }
                lines.push(format!("Resume with `subflow run {}`", self.job_id));
            }
            JobStatus::Cancelled => {
                match &self.interrupted {
                    Some(stage) => lines.push(format!(
                        "Job {} cancelled while '{}' was running",
                        self.job_id, stage
                    )),
                    None => lines.push(format!("Job {} cancelled", self.job_id)),
                }
                lines.push(format!("Resume with `subflow run {}`", self.job_id));
            }
            other => lines.push(format!("Job {} is {}", self.job_id, other)),
        }

        for d in &self.degraded {
            let impact = if d.downstream.is_empty() {
                "no downstream stages affected".to_string()
            } else {
                format!("degraded: {}", d.downstream.join(", "))
            };
            lines.push(format!("  optional stage '{}' failed ({}); {}", d.stage, d.error, impact));
        }
        lines.join("\n")
    }
}

/// How one stage ended after all its attempts in this run.
enum StageEnd {
    Succeeded,
    Degraded(DegradedStage),
    Failed(FailedStage),
    Interrupted,
}

/// Sequential stage dispatcher.
///
/// One dispatcher can serve several jobs on separate threads. Running the
/// same job from two dispatchers at once is not supported.
pub struct Dispatcher {
    registry: Arc<StageRegistry>,
    store: Arc<JobStore>,
    global: Arc<GlobalLayer>,
    contexts: ContextSelector,
    log_config: LogConfig,
    log_callback: Option<SharedLogCallback>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<JobStore>,
        global: Arc<GlobalLayer>,
        contexts: ContextSelector,
    ) -> Self {
        Self {
            registry,
            store,
            global,
            contexts,
            log_config: LogConfig::default(),
            log_callback: None,
        }
    }

    pub fn with_log_config(mut self, config: LogConfig) -> Self {
        self.log_config = config;
        self
    }

    /// Also send job log lines to `callback` (e.g. the console).
    pub fn with_log_callback(mut self, callback: SharedLogCallback) -> Self {
        self.log_callback = Some(callback);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Plan for the job's current mode and flags.
    pub fn plan_for(&self, job: &Job) -> OrchestratorResult<Plan> {
        Ok(Planner::new(&self.registry).plan(job.mode, &job.features)?)
    }

    /// Run (or resume) a job.
    ///
    /// Configuration and plan errors are returned before the manifest is
    /// touched. A fatal stage failure is not an `Err`: it is recorded and
    /// reported through `DispatchOutcome::job_status`.
    pub fn run(&self, job_id: &str, options: &RunOptions) -> OrchestratorResult<DispatchOutcome> {
        let job = self.store.load_job(job_id)?;
        let mut cascade = ConfigCascade::for_job(Arc::clone(&self.global), &job.work_dir)?;
        cascade.validate_declared()?;
        let plan = self.plan_for(&job)?;
        for stage in &options.force_rerun {
            if !plan.contains(stage) {
                return Err(PlanError::invalid(format!("stage '{}' is not in the plan", stage)).into());
            }
        }

        let callback = self.log_callback.clone().map(|cb| {
            let boxed: crate::logging::LogCallback = Box::new(move |line: &str| cb(line));
            boxed
        });
        let logger = JobLogger::new(&job.id, job.logs_dir(), self.log_config.clone(), callback)
            .map_err(|e| OrchestratorError::setup_failed(&job.id, e))?;

        let manifest = self.store.load_manifest(&job.id)?;
        for stage in &manifest.recovered {
            logger.warn(&format!("Stage '{}' was interrupted in a previous run", stage));
        }
        self.store
            .sync_plan(&job.id, plan.mode, &plan.fingerprint, &plan.stages)?;
        for stage in forced_stages(&self.registry, &plan, options) {
            self.store.mark_for_rerun(&job.id, &stage)?;
            logger.info(&format!("Forced re-run of '{}'", stage));
        }
        self.store.set_job_status(&job.id, JobStatus::Running)?;

        logger.phase(&format!(
            "Job {} ({}): {}",
            job.id,
            plan.mode,
            plan.stages.join(" -> ")
        ));
        tracing::info!(job_id = %job.id, mode = %plan.mode, stages = plan.stages.len(), "Dispatching job");

        let mut outcome = DispatchOutcome::new(&job.id);
        for name in &plan.stages {
            if options.cancel.is_cancelled() {
                logger.warn(&format!("Cancelled before stage '{}'", name));
                return self.finish(&job, &logger, outcome, JobStatus::Cancelled);
            }

            let definition = self
                .registry
                .get(name)
                .ok_or_else(|| PlanError::invalid(format!("stage '{}' is not registered", name)))?;

            // Skipped optional stages stay skipped; downstream already ran without them
            match self.store.manifest(&job.id)?.status_of(name) {
                StageStatus::Succeeded | StageStatus::Skipped => {
                    logger.debug(&format!("Stage '{}' already done; skipping", name));
                    outcome.skipped_done.push(name.clone());
                    continue;
                }
                _ => {}
            }

            let end = self.execute_stage(
                &job,
                &plan,
                definition,
                &mut cascade,
                &logger,
                &options.cancel,
                &mut outcome,
            )?;
            match end {
                StageEnd::Succeeded => outcome.executed.push(name.clone()),
                StageEnd::Degraded(degraded) => outcome.degraded.push(degraded),
                StageEnd::Failed(failed) => {
                    outcome.failed = Some(failed);
                    return self.finish(&job, &logger, outcome, JobStatus::Failed);
                }
                StageEnd::Interrupted => {
                    outcome.interrupted = Some(name.clone());
                    return self.finish(&job, &logger, outcome, JobStatus::Cancelled);
                }
            }
        }

        self.finish(&job, &logger, outcome, JobStatus::Completed)
    }

    fn finish(
        &self,
        job: &Job,
        logger: &JobLogger,
        mut outcome: DispatchOutcome,
        status: JobStatus,
    ) -> OrchestratorResult<DispatchOutcome> {
        self.store.set_job_status(&job.id, status)?;
        outcome.job_status = status;

        let summary = outcome.summary();
        match status {
            JobStatus::Completed => logger.success(&summary),
            JobStatus::Failed => logger.error(&summary),
            _ => logger.warn(&summary),
        }
        logger.flush();
        tracing::info!(job_id = %job.id, status = %status, "Dispatch finished");
        Ok(outcome)
    }

    /// Run one stage through its retry budget and apply its criticality.
    #[allow(clippy::too_many_arguments)]
    fn execute_stage(
        &self,
        job: &Job,
        plan: &Plan,
        definition: &StageDefinition,
        cascade: &mut ConfigCascade,
        logger: &JobLogger,
        cancel: &CancelHandle,
        outcome: &mut DispatchOutcome,
    ) -> OrchestratorResult<StageEnd> {
        let name = definition.name.as_str();
        let mut attempt_in_run = 0;

        loop {
            attempt_in_run += 1;
            let record = self.store.record_transition(
                &job.id,
                name,
                StageStatus::Running,
                TransitionDetails::none(),
            )?;
            *outcome.attempts.entry(name.to_string()).or_insert(0) += 1;

            logger.clear_tail();
            logger.stage(&format!("{} (attempt {})", name, record.attempts));

            let manifest = self.store.manifest(&job.id)?;
            let (report, config) = self.attempt(
                job,
                plan,
                definition,
                cascade,
                &manifest,
                logger,
                cancel,
                record.attempts,
            );
            let duration_ms = report.duration.as_millis() as u64;

            match report.status {
                ReportStatus::Succeeded => {
                    self.store.record_transition(
                        &job.id,
                        name,
                        StageStatus::Succeeded,
                        TransitionDetails::none().with_duration_ms(duration_ms),
                    )?;
                    logger.success(&format!("{} finished in {:.1}s", name, report.duration.as_secs_f64()));
                    return Ok(StageEnd::Succeeded);
                }
                ReportStatus::Interrupted => {
                    self.store.record_transition(
                        &job.id,
                        name,
                        StageStatus::Pending,
                        TransitionDetails::error("interrupted by cancellation"),
                    )?;
                    return Ok(StageEnd::Interrupted);
                }
                ReportStatus::Failed => {}
            }

            let error = report
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "stage failed".to_string());
            logger.error(&format!("{} failed: {}", name, error));
            logger.show_tail(name);
            tracing::warn!(job_id = %job.id, stage = name, attempt = record.attempts, "Stage failed: {}", error);

            let max_attempts = self.max_attempts(definition, config.as_ref());
            let details = TransitionDetails::error(error.clone()).with_duration_ms(duration_ms);

            if attempt_in_run < max_attempts && cancel.is_cancelled() {
                self.store
                    .record_transition(&job.id, name, StageStatus::Pending, details)?;
                logger.warn(&format!("Cancelled before retrying {}", name));
                return Ok(StageEnd::Interrupted);
            }
            if attempt_in_run < max_attempts {
                self.store
                    .record_transition(&job.id, name, StageStatus::Failed, details)?;
                let backoff = retry_backoff(config.as_ref());
                logger.info(&format!(
                    "Retrying {} ({}/{}) in {}ms",
                    name,
                    attempt_in_run + 1,
                    max_attempts,
                    backoff.as_millis()
                ));
                thread::sleep(backoff);
                continue;
            }

            if definition.criticality.is_fatal() {
                let record = self
                    .store
                    .record_transition(&job.id, name, StageStatus::Failed, details)?;
                return Ok(StageEnd::Failed(FailedStage {
                    stage: name.to_string(),
                    attempts: record.attempts,
                    error,
                }));
            }

            self.store
                .record_transition(&job.id, name, StageStatus::Skipped, details)?;
            let downstream = plan.downstream_of(name);
            if downstream.is_empty() {
                logger.warn(&format!("Optional stage '{}' skipped", name));
            } else {
                logger.warn(&format!(
                    "Optional stage '{}' skipped; continuing without its outputs: {}",
                    name,
                    downstream.join(", ")
                ));
            }
            return Ok(StageEnd::Degraded(DegradedStage {
                stage: name.to_string(),
                error,
                downstream,
            }));
        }
    }

    /// One attempt. Setup problems (missing inputs, bad config, unknown
    /// context) become a failed report so criticality applies to them too.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        job: &Job,
        plan: &Plan,
        definition: &StageDefinition,
        cascade: &mut ConfigCascade,
        manifest: &Manifest,
        logger: &JobLogger,
        cancel: &CancelHandle,
        attempt: u32,
    ) -> (StageReport, Option<StageConfig>) {
        let started = Instant::now();
        if let Err(e) = cascade.refresh_job_layer() {
            return (StageReport::failed(started.elapsed(), e.into()), None);
        }
        let config = cascade.for_stage(&definition.name);

        let result = self.invoke(job, plan, definition, &config, manifest, logger, cancel, attempt);
        let report = match result {
            Ok(report) => report,
            Err(e) => StageReport::failed(started.elapsed(), e),
        };
        (report, Some(config))
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        job: &Job,
        plan: &Plan,
        definition: &StageDefinition,
        config: &StageConfig,
        manifest: &Manifest,
        logger: &JobLogger,
        cancel: &CancelHandle,
        attempt: u32,
    ) -> StepResult<StageReport> {
        let layout = StageLayout::from_manifest(&job.work_dir, &plan.stages, manifest);
        let io = layout.io_for(&definition.name)?;
        // Anything left by an earlier attempt is partial output
        if let Some(stale) = io.prepare(attempt > 1)? {
            logger.info(&format!("Moved previous outputs aside to {}", stale.display()));
        }

        let mut inputs = BTreeMap::new();
        for input in &definition.inputs {
            let from = match &input.source {
                InputSource::Nearest => None,
                InputSource::FromStage(stage) => Some(stage.as_str()),
            };
            match io.resolve_input(&input.artifact, from) {
                Ok(path) => {
                    inputs.insert(input.artifact.clone(), path);
                }
                Err(StageIoError::ArtifactNotFound { .. }) if !input.required => {}
                Err(e) => return Err(e.into()),
            }
        }

        let context = self.contexts.get(&definition.context)?;
        let invocation = StageInvocation {
            job,
            stage: definition,
            io: &io,
            config,
            env: stage_env(job, &io, config, &inputs, attempt),
            inputs,
            timeout: stage_timeout(definition, config),
            cancel,
            logger,
            attempt,
        };

        let report = context.invoke(&invocation);
        if report.status != ReportStatus::Succeeded {
            return Ok(report);
        }

        if let Some(missing) = definition.outputs.iter().find(|o| io.output(o).is_none()) {
            return Err(StageError::MissingOutput(missing.clone()));
        }
        for artifact in &definition.promoted {
            let path = io.promote(artifact)?;
            logger.debug(&format!("Promoted {} to {}", artifact, path.display()));
        }
        Ok(report)
    }

    /// Attempt budget: `retry.max_attempts` overrides retryable definitions.
    fn max_attempts(&self, definition: &StageDefinition, config: Option<&StageConfig>) -> u32 {
        match definition.criticality {
            Criticality::Retryable { .. } => config
                .and_then(|c| c.get_i64(RETRY_MAX_ATTEMPTS).ok())
                .map(|n| n.clamp(1, u32::MAX as i64) as u32)
                .unwrap_or_else(|| definition.criticality.max_attempts()),
            _ => 1,
        }
    }
}

fn retry_backoff(config: Option<&StageConfig>) -> Duration {
    let ms = config
        .and_then(|c| c.get_i64(RETRY_BACKOFF_MS).ok())
        .unwrap_or(1000)
        .max(0);
    Duration::from_millis(ms as u64)
}

fn stage_timeout(definition: &StageDefinition, config: &StageConfig) -> Option<Duration> {
    match config.get_i64(STAGE_TIMEOUT_SECS) {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
        _ => definition.timeout,
    }
}

/// Forced stages and the dependents that follow them, in plan order.
///
/// Cascading brings every downstream stage; otherwise only re-run-safe
/// dependents are refreshed and skip-if-succeeded ones keep their results.
fn forced_stages(registry: &StageRegistry, plan: &Plan, options: &RunOptions) -> Vec<String> {
    let mut forced: BTreeSet<String> = BTreeSet::new();
    for stage in &options.force_rerun {
        forced.insert(stage.clone());
        forced.extend(plan.downstream_of(stage).into_iter().filter(|dependent| {
            options.cascade_rerun
                || registry
                    .get(dependent)
                    .is_some_and(|def| def.idempotency == Idempotency::RerunSafe)
        }));
    }
    plan.stages
        .iter()
        .filter(|s| forced.contains(*s))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::builtin_registry;
    use crate::models::{Feature, FeatureFlags, WorkflowMode};

    #[test]
    fn forced_stages_cascade_in_plan_order() {
        let registry = builtin_registry();
        let plan = Planner::new(&registry)
            .plan(WorkflowMode::FullPipeline, &FeatureFlags::new())
            .unwrap();

        let only = forced_stages(&registry, &plan, &RunOptions::default().force("transcribe"));
        assert_eq!(only, vec!["transcribe", "format_subtitles"]);

        let cascaded = forced_stages(
            &registry,
            &plan,
            &RunOptions::default().force("transcribe").cascading(),
        );
        assert_eq!(cascaded, vec!["transcribe", "translate", "format_subtitles"]);
    }

    #[test]
    fn rerun_safe_dependents_follow_forced_stage() {
        let registry = builtin_registry();
        let flags = FeatureFlags::new().with(Feature::Diarization).with(Feature::SpeakerLabels);
        let plan = Planner::new(&registry)
            .plan(WorkflowMode::TranscribeOnly, &flags)
            .unwrap();

        let forced = forced_stages(&registry, &plan, &RunOptions::default().force("diarize"));
        assert_eq!(forced, vec!["diarize", "speaker_labels", "format_subtitles"]);
        let forced = forced_stages(&registry, &plan, &RunOptions::default().force("format_subtitles"));
        assert_eq!(forced, vec!["format_subtitles"]);
    }

    #[test]
    fn summary_names_failed_stage_and_resume_command() {
        let mut outcome = DispatchOutcome::new("job-7");
        outcome.job_status = JobStatus::Failed;
        outcome.failed = Some(FailedStage {
            stage: "translate".into(),
            attempts: 3,
            error: "llm failed with exit code 1: rate limited".into(),
        });
        let summary = outcome.summary();
        assert!(summary.contains("failed at stage 'translate' after 3 attempt(s)"));
        assert!(summary.contains("rate limited"));
        assert!(summary.contains("subflow run job-7"));
    }

    #[test]
    fn summary_lists_degraded_downstream() {
        let mut outcome = DispatchOutcome::new("job-8");
        outcome.job_status = JobStatus::Completed;
        outcome.executed = vec!["transcribe".into()];
        outcome.degraded.push(DegradedStage {
            stage: "lyrics_detection".into(),
            error: "model missing".into(),
            downstream: vec!["lyrics_styling".into(), "translate".into()],
        });
        let summary = outcome.summary();
        assert!(summary.contains("completed"));
        assert!(summary.contains("optional stage 'lyrics_detection' failed"));
        assert!(summary.contains("degraded: lyrics_styling, translate"));
    }
}
