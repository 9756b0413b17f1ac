//! Static stage definitions.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use super::error::{PlanError, PlanResult};
use crate::models::{Feature, WorkflowMode};

/// Where a declared input is looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Closest earlier stage that produced the artifact.
    Nearest,
    /// Only the named stage's directory.
    FromStage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub artifact: String,
    pub source: InputSource,
    pub required: bool,
}

/// What a failure does to the job after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Fatal,
    Optional,
}

/// How a stage failure affects the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Aborts the job.
    Fatal,
    /// Stage is skipped with a warning and the job continues.
    Optional,
    /// Re-attempted, then handled per `fallback`.
    Retryable { max_attempts: u32, fallback: Fallback },
}

impl Criticality {
    /// Attempts allowed by the definition itself.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Criticality::Retryable { max_attempts, .. } => (*max_attempts).max(1),
            _ => 1,
        }
    }

    /// Whether exhausting attempts fails the whole job.
    pub fn is_fatal(&self) -> bool {
        match self {
            Criticality::Fatal => true,
            Criticality::Optional => false,
            Criticality::Retryable { fallback, .. } => *fallback == Fallback::Fatal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Fatal => "fatal",
            Criticality::Optional => "optional",
            Criticality::Retryable { fallback: Fallback::Fatal, .. } => "retryable/fatal",
            Criticality::Retryable { fallback: Fallback::Optional, .. } => "retryable/optional",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Idempotency {
    /// Running twice gives the same result.
    RerunSafe,
    /// A succeeded record is never re-run unless forced.
    #[default]
    SkipIfSucceeded,
}

/// Static description of one stage.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: String,
    /// Placement hint among stages with no ordering constraint.
    pub ordinal: u32,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<String>,
    /// Outputs copied to `<job>/latest/` after success.
    pub promoted: Vec<String>,
    /// Execution context id.
    pub context: String,
    pub criticality: Criticality,
    pub idempotency: Idempotency,
    /// Gating flag; stages without one run only when in a mode's base sequence.
    pub feature: Option<Feature>,
    /// Stages that must be in the plan and run before this one.
    pub requires: Vec<String>,
    /// Modes this stage applies to; empty means all.
    pub modes: Vec<WorkflowMode>,
    pub timeout: Option<Duration>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, ordinal: u32, context: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordinal,
            inputs: Vec::new(),
            outputs: Vec::new(),
            promoted: Vec::new(),
            context: context.into(),
            criticality: Criticality::Fatal,
            idempotency: Idempotency::default(),
            feature: None,
            requires: Vec::new(),
            modes: Vec::new(),
            timeout: None,
        }
    }

    pub fn input(mut self, artifact: &str) -> Self {
        self.inputs.push(InputSpec {
            artifact: artifact.into(),
            source: InputSource::Nearest,
            required: true,
        });
        self
    }

    pub fn optional_input(mut self, artifact: &str) -> Self {
        self.inputs.push(InputSpec {
            artifact: artifact.into(),
            source: InputSource::Nearest,
            required: false,
        });
        self
    }

    pub fn input_from(mut self, artifact: &str, stage: &str) -> Self {
        self.inputs.push(InputSpec {
            artifact: artifact.into(),
            source: InputSource::FromStage(stage.into()),
            required: true,
        });
        self
    }

    pub fn output(mut self, artifact: &str) -> Self {
        self.outputs.push(artifact.into());
        self
    }

    /// Declare an output that is also promoted to `latest/`.
    pub fn promoted_output(mut self, artifact: &str) -> Self {
        self.outputs.push(artifact.into());
        self.promoted.push(artifact.into());
        self
    }

    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn retryable(self, max_attempts: u32, fallback: Fallback) -> Self {
        self.criticality(Criticality::Retryable {
            max_attempts,
            fallback,
        })
    }

    pub fn optional(self) -> Self {
        self.criticality(Criticality::Optional)
    }

    pub fn idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }

    pub fn requires(mut self, stage: &str) -> Self {
        self.requires.push(stage.into());
        self
    }

    pub fn modes(mut self, modes: &[WorkflowMode]) -> Self {
        self.modes = modes.to_vec();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    pub fn applies_to(&self, mode: WorkflowMode) -> bool {
        self.modes.is_empty() || self.modes.contains(&mode)
    }

    pub fn produces(&self, artifact: &str) -> bool {
        self.outputs.iter().any(|o| o == artifact)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &InputSpec> {
        self.inputs.iter().filter(|i| i.required)
    }
}

/// All known stages plus each mode's mandatory sequence.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
    base: BTreeMap<WorkflowMode, Vec<String>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; duplicate names are rejected.
    pub fn register(&mut self, definition: StageDefinition) -> PlanResult<()> {
        if self.get(&definition.name).is_some() {
            return Err(PlanError::invalid(format!(
                "stage '{}' registered twice",
                definition.name
            )));
        }
        self.stages.push(definition);
        Ok(())
    }

    /// Set a mode's mandatory stages, in execution order.
    pub fn set_base(&mut self, mode: WorkflowMode, stages: &[&str]) {
        self.base
            .insert(mode, stages.iter().map(|s| s.to_string()).collect());
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn base_sequence(&self, mode: WorkflowMode) -> &[String] {
        self.base.get(&mode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check references and reject cycles among explicit edges
    /// (`requires` and `FromStage` inputs).
    pub fn validate(&self) -> PlanResult<()> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PlanError::invalid(format!("duplicate stage '{}'", stage.name)));
            }
        }

        for stage in &self.stages {
            for target in explicit_edges(stage) {
                if self.get(target).is_none() {
                    return Err(PlanError::invalid(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, target
                    )));
                }
                if target == stage.name {
                    return Err(PlanError::invalid(format!(
                        "stage '{}' depends on itself",
                        stage.name
                    )));
                }
            }
        }

        for (mode, names) in &self.base {
            let mut in_base = BTreeSet::new();
            for name in names {
                let def = self.get(name).ok_or_else(|| {
                    PlanError::invalid(format!("mode {} lists unknown stage '{}'", mode, name))
                })?;
                if !def.applies_to(*mode) {
                    return Err(PlanError::invalid(format!(
                        "mode {} lists stage '{}' which does not apply to it",
                        mode, name
                    )));
                }
                if !in_base.insert(name.as_str()) {
                    return Err(PlanError::invalid(format!(
                        "mode {} lists stage '{}' twice",
                        mode, name
                    )));
                }
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> PlanResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        fn visit<'a>(
            registry: &'a StageRegistry,
            name: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> PlanResult<()> {
            match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    path.push(name);
                    return Err(PlanError::invalid(format!(
                        "dependency cycle: {}",
                        path.join(" -> ")
                    )));
                }
                Mark::Unvisited => {}
            }
            marks.insert(name, Mark::Active);
            path.push(name);
            if let Some(def) = registry.get(name) {
                for target in explicit_edges(def) {
                    visit(registry, target, marks, path)?;
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for stage in &self.stages {
            let mut path = Vec::new();
            visit(self, &stage.name, &mut marks, &mut path)?;
        }
        Ok(())
    }
}

/// Stage names this stage names explicitly as dependencies.
pub(crate) fn explicit_edges(stage: &StageDefinition) -> impl Iterator<Item = &str> {
    stage
        .requires
        .iter()
        .map(String::as_str)
        .chain(stage.inputs.iter().filter_map(|i| match &i.source {
            InputSource::FromStage(s) => Some(s.as_str()),
            InputSource::Nearest => None,
        }))
}
