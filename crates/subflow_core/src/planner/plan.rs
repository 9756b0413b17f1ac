//! Turning a mode and feature flags into an ordered stage list.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::{PlanError, PlanResult};
use super::registry::{InputSource, StageDefinition, StageRegistry};
use crate::models::{FeatureFlags, WorkflowMode};

/// Why a registry stage is not in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "missing", rename_all = "snake_case")]
pub enum OmitReason {
    /// Its feature flag is off.
    FeatureDisabled,
    /// Flag is on but the stage does not apply to this mode.
    NotApplicable,
    /// A stage or artifact it needs is not in the plan.
    MissingDependency(Vec<String>),
}

impl std::fmt::Display for OmitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OmitReason::FeatureDisabled => f.write_str("feature disabled"),
            OmitReason::NotApplicable => f.write_str("not applicable to mode"),
            OmitReason::MissingDependency(missing) => {
                write!(f, "missing dependency: {}", missing.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OmittedStage {
    pub name: String,
    pub reason: OmitReason,
}

/// Ordered stage list for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub mode: WorkflowMode,
    pub stages: Vec<String>,
    pub omitted: Vec<OmittedStage>,
    /// SHA-256 over mode and stage names.
    pub fingerprint: String,
    /// Direct dependencies of each planned stage.
    #[serde(skip)]
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl Plan {
    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s == stage)
    }

    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn dependencies_of(&self, stage: &str) -> Vec<&str> {
        self.dependencies
            .get(stage)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Planned stages that consume `stage`'s outputs, directly or not,
    /// in plan order.
    pub fn downstream_of(&self, stage: &str) -> Vec<String> {
        let mut affected: HashSet<&str> = HashSet::new();
        affected.insert(stage);
        let mut result = Vec::new();
        for name in &self.stages {
            if name == stage {
                continue;
            }
            let hit = self
                .dependencies
                .get(name)
                .is_some_and(|deps| deps.iter().any(|d| affected.contains(d.as_str())));
            if hit {
                affected.insert(name.as_str());
                result.push(name.clone());
            }
        }
        result
    }

    pub fn omitted_reason(&self, stage: &str) -> Option<&OmitReason> {
        self.omitted.iter().find(|o| o.name == stage).map(|o| &o.reason)
    }
}

/// Pure function of registry, mode and flags.
pub struct Planner<'a> {
    registry: &'a StageRegistry,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a StageRegistry) -> Self {
        Self { registry }
    }

    pub fn plan(&self, mode: WorkflowMode, flags: &FeatureFlags) -> PlanResult<Plan> {
        let registry = self.registry;

        let base: Vec<&StageDefinition> = registry
            .base_sequence(mode)
            .iter()
            .map(|name| {
                registry.get(name).ok_or_else(|| {
                    PlanError::invalid(format!("mode {} lists unknown stage '{}'", mode, name))
                })
            })
            .collect::<PlanResult<_>>()?;
        if base.is_empty() {
            return Err(PlanError::invalid(format!("mode {} has no stages", mode)));
        }
        let base_names: HashSet<&str> = base.iter().map(|d| d.name.as_str()).collect();

        let mut omitted = Vec::new();
        let mut candidates: Vec<&StageDefinition> = Vec::new();
        for def in registry.stages() {
            if base_names.contains(def.name.as_str()) {
                continue;
            }
            let Some(feature) = def.feature else {
                continue;
            };
            let enabled = flags.is_enabled(feature);
            let applies = def.applies_to(mode);
            match (applies, enabled) {
                (false, false) => {}
                (false, true) => omitted.push(omit(def, OmitReason::NotApplicable)),
                (true, false) => omitted.push(omit(def, OmitReason::FeatureDisabled)),
                (true, true) => candidates.push(def),
            }
        }

        // Drop candidates whose dependencies are gone until nothing changes
        loop {
            let included: Vec<&StageDefinition> =
                base.iter().chain(candidates.iter()).copied().collect();
            let unmet = candidates
                .iter()
                .enumerate()
                .find_map(|(i, c)| {
                    let missing = unmet_dependencies(c, &included);
                    (!missing.is_empty()).then_some((i, missing))
                });
            let Some((index, missing)) = unmet else {
                break;
            };
            let dropped = candidates.remove(index);
            tracing::warn!(
                stage = %dropped.name,
                missing = %missing.join(", "),
                "Disabling stage: dependency not in plan"
            );
            omitted.push(omit(dropped, OmitReason::MissingDependency(missing)));
        }

        let included: Vec<&StageDefinition> =
            base.iter().chain(candidates.iter()).copied().collect();
        for def in &base {
            let missing = unmet_dependencies(def, &included);
            if !missing.is_empty() {
                return Err(PlanError::invalid(format!(
                    "mandatory stage '{}' of mode {} is missing {}",
                    def.name,
                    mode,
                    missing.join(", ")
                )));
            }
        }

        let dependencies: BTreeMap<String, BTreeSet<String>> = included
            .iter()
            .map(|d| (d.name.clone(), direct_dependencies(d, &included)))
            .collect();

        let mut stages: Vec<String> = base.iter().map(|d| d.name.clone()).collect();
        for def in topological(&candidates, &dependencies)? {
            insert_stage(&mut stages, def, &dependencies, registry)?;
        }

        validate(&stages, &dependencies, registry)?;

        omitted.sort_by(|a, b| a.name.cmp(&b.name));
        let fingerprint = fingerprint(mode, &stages);
        Ok(Plan {
            mode,
            stages,
            omitted,
            fingerprint,
            dependencies,
        })
    }
}

fn omit(def: &StageDefinition, reason: OmitReason) -> OmittedStage {
    OmittedStage {
        name: def.name.clone(),
        reason,
    }
}

/// Earlier producer of `artifact` for `consumer` among `included`.
fn is_producer_for(producer: &StageDefinition, consumer: &StageDefinition, artifact: &str) -> bool {
    producer.name != consumer.name
        && producer.ordinal < consumer.ordinal
        && producer.produces(artifact)
}

/// Requirements of `def` that nothing in `included` satisfies.
fn unmet_dependencies(def: &StageDefinition, included: &[&StageDefinition]) -> Vec<String> {
    let present = |name: &str| included.iter().find(|d| d.name == name);
    let mut missing = Vec::new();

    for required in &def.requires {
        if present(required.as_str()).is_none() {
            missing.push(format!("stage {}", required));
        }
    }

    for input in def.required_inputs() {
        let satisfied = match &input.source {
            InputSource::FromStage(source) => {
                present(source.as_str()).is_some_and(|p| p.produces(&input.artifact))
            }
            InputSource::Nearest => included
                .iter()
                .any(|p| is_producer_for(p, def, &input.artifact)),
        };
        if !satisfied {
            missing.push(input.artifact.clone());
        }
    }
    missing
}

/// Stages that must run before `def`: explicit edges plus earlier producers
/// of any input, required or optional.
fn direct_dependencies(def: &StageDefinition, included: &[&StageDefinition]) -> BTreeSet<String> {
    let mut deps: BTreeSet<String> = def.requires.iter().cloned().collect();
    for input in &def.inputs {
        match &input.source {
            InputSource::FromStage(source) => {
                deps.insert(source.clone());
            }
            InputSource::Nearest => {
                for producer in included {
                    if is_producer_for(producer, def, &input.artifact) {
                        deps.insert(producer.name.clone());
                    }
                }
            }
        }
    }
    deps
}

/// Kahn's algorithm over candidate-to-candidate edges; ties by ordinal,
/// then name.
fn topological<'a>(
    candidates: &[&'a StageDefinition],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> PlanResult<Vec<&'a StageDefinition>> {
    let names: HashSet<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
    let mut pending: BTreeMap<&str, usize> = candidates
        .iter()
        .map(|c| {
            let n = dependencies
                .get(&c.name)
                .map(|deps| deps.iter().filter(|d| names.contains(d.as_str())).count())
                .unwrap_or(0);
            (c.name.as_str(), n)
        })
        .collect();

    let mut ready: BTreeSet<(u32, &str)> = candidates
        .iter()
        .filter(|c| pending[c.name.as_str()] == 0)
        .map(|c| (c.ordinal, c.name.as_str()))
        .collect();

    let mut order = Vec::with_capacity(candidates.len());
    while let Some(next) = ready.pop_first() {
        let Some(def) = candidates.iter().find(|c| c.name == next.1) else {
            continue;
        };
        order.push(*def);
        for other in candidates {
            let depends = dependencies
                .get(&other.name)
                .is_some_and(|deps| deps.contains(&def.name));
            if depends {
                if let Some(n) = pending.get_mut(other.name.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert((other.ordinal, other.name.as_str()));
                    }
                }
            }
        }
    }

    if order.len() != candidates.len() {
        let stuck: Vec<&str> = pending
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(PlanError::invalid(format!(
            "dependency cycle among optional stages: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// Place `def` right after its last dependency, then past stages with a
/// lower ordinal, but never past its first dependent.
fn insert_stage(
    stages: &mut Vec<String>,
    def: &StageDefinition,
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    registry: &StageRegistry,
) -> PlanResult<()> {
    let empty = BTreeSet::new();
    let own = dependencies.get(&def.name).unwrap_or(&empty);

    let lo = stages
        .iter()
        .rposition(|s| own.contains(s))
        .map(|i| i + 1)
        .unwrap_or(0);
    let hi = stages
        .iter()
        .position(|s| dependencies.get(s).is_some_and(|d| d.contains(&def.name)))
        .unwrap_or(stages.len());

    if lo > hi {
        return Err(PlanError::invalid(format!(
            "stage '{}' must run after '{}' but before '{}'",
            def.name,
            stages[lo - 1],
            stages[hi]
        )));
    }

    let ordinal_of = |name: &str| registry.get(name).map(|d| d.ordinal).unwrap_or(u32::MAX);
    let mut pos = lo;
    while pos < hi && ordinal_of(&stages[pos]) <= def.ordinal {
        pos += 1;
    }
    stages.insert(pos, def.name.clone());
    Ok(())
}

/// Every dependency precedes its dependent and every required input has
/// an earlier producer.
fn validate(
    stages: &[String],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    registry: &StageRegistry,
) -> PlanResult<()> {
    let position: BTreeMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    for (i, name) in stages.iter().enumerate() {
        let def = registry
            .get(name)
            .ok_or_else(|| PlanError::invalid(format!("unknown stage '{}'", name)))?;

        for dep in dependencies.get(name).into_iter().flatten() {
            match position.get(dep.as_str()) {
                Some(&j) if j < i => {}
                Some(_) => {
                    return Err(PlanError::invalid(format!(
                        "'{}' is scheduled after its consumer '{}'",
                        dep, name
                    )))
                }
                None if def.requires.contains(dep) => {
                    return Err(PlanError::invalid(format!(
                        "'{}' requires '{}' which is not planned",
                        name, dep
                    )))
                }
                None => {}
            }
        }

        for input in def.required_inputs() {
            let earlier = stages[..i].iter().filter_map(|s| registry.get(s));
            let found = match &input.source {
                InputSource::FromStage(source) => earlier
                    .filter(|p| &p.name == source)
                    .any(|p| p.produces(&input.artifact)),
                InputSource::Nearest => earlier.into_iter().any(|p| p.produces(&input.artifact)),
            };
            if !found {
                return Err(PlanError::invalid(format!(
                    "'{}' needs '{}' but no earlier stage produces it",
                    name, input.artifact
                )));
            }
        }
    }
    Ok(())
}

fn fingerprint(mode: WorkflowMode, stages: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_str().as_bytes());
    for stage in stages {
        hasher.update(b"\n");
        hasher.update(stage.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Feature;
    use crate::planner::builtin_registry;
    use crate::planner::registry::Fallback;

    fn plan(mode: WorkflowMode, flags: FeatureFlags) -> Plan {
        let registry = builtin_registry();
        Planner::new(&registry).plan(mode, &flags).unwrap()
    }

    #[test]
    fn base_sequences_without_features() {
        assert_eq!(
            plan(WorkflowMode::TranscribeOnly, FeatureFlags::new()).stages,
            vec!["extract_audio", "transcribe", "format_subtitles"]
        );
        assert_eq!(
            plan(WorkflowMode::FormatOnly, FeatureFlags::new()).stages,
            vec!["import_transcript", "format_subtitles"]
        );
    }

    #[test]
    fn optional_stages_land_between_their_neighbours() {
        let flags = FeatureFlags::new()
            .with(Feature::VocalSeparation)
            .with(Feature::Diarization)
            .with(Feature::SpeakerLabels)
            .with(Feature::EntityCorrection)
            .with(Feature::Glossary);
        let p = plan(WorkflowMode::FullPipeline, flags);
        assert_eq!(
            p.stages,
            vec![
                "extract_audio",
                "vocal_separation",
                "transcribe",
                "diarize",
                "speaker_labels",
                "glossary_lookup",
                "entity_correction",
                "translate",
                "format_subtitles",
            ]
        );
    }

    #[test]
    fn translate_only_without_lyrics_detection() {
        let flags = FeatureFlags::new().with(Feature::LyricsStyling);
        let p = plan(WorkflowMode::TranslateOnly, flags);

        assert!(p.contains("translate"));
        assert!(!p.contains("lyrics_detection"));
        assert!(!p.contains("lyrics_styling"));
        assert_eq!(p.omitted_reason("lyrics_detection"), Some(&OmitReason::FeatureDisabled));
        assert!(matches!(
            p.omitted_reason("lyrics_styling"),
            Some(OmitReason::MissingDependency(_))
        ));
    }

    #[test]
    fn translate_only_with_lyrics() {
        let flags = FeatureFlags::new()
            .with(Feature::LyricsDetection)
            .with(Feature::LyricsStyling);
        let p = plan(WorkflowMode::TranslateOnly, flags);
        assert_eq!(
            p.stages,
            vec![
                "import_transcript",
                "lyrics_detection",
                "lyrics_styling",
                "translate",
                "format_subtitles",
            ]
        );
    }

    #[test]
    fn speaker_labels_without_diarization_is_dropped() {
        let flags = FeatureFlags::new().with(Feature::SpeakerLabels);
        let p = plan(WorkflowMode::TranscribeOnly, flags);
        assert!(!p.contains("speaker_labels"));
        assert_eq!(
            p.omitted_reason("speaker_labels"),
            Some(&OmitReason::MissingDependency(vec!["speakers.json".into()]))
        );
    }

    #[test]
    fn audio_only_feature_in_text_mode_is_not_applicable() {
        let flags = FeatureFlags::new().with(Feature::VocalSeparation);
        let p = plan(WorkflowMode::TranslateOnly, flags);
        assert_eq!(p.omitted_reason("vocal_separation"), Some(&OmitReason::NotApplicable));
    }

    #[test]
    fn plan_is_deterministic() {
        let flags = FeatureFlags::all_enabled();
        let a = plan(WorkflowMode::FullPipeline, flags.clone());
        let b = plan(WorkflowMode::FullPipeline, flags);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn fingerprint_tracks_stage_list() {
        let a = plan(WorkflowMode::FullPipeline, FeatureFlags::new());
        let b = plan(WorkflowMode::FullPipeline, FeatureFlags::new().with(Feature::Diarization));
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn downstream_is_transitive() {
        let flags = FeatureFlags::new()
            .with(Feature::LyricsDetection)
            .with(Feature::LyricsStyling);
        let p = plan(WorkflowMode::FullPipeline, flags);
        assert_eq!(
            p.downstream_of("lyrics_detection"),
            vec!["lyrics_styling", "translate", "format_subtitles"]
        );
        assert!(p.downstream_of("format_subtitles").is_empty());
    }

    #[test]
    fn base_stage_without_producer_is_invalid() {
        let mut registry = StageRegistry::new();
        registry
            .register(StageDefinition::new("render", 10, "x").input("missing.json"))
            .unwrap();
        registry.set_base(WorkflowMode::FormatOnly, &["render"]);
        let err = Planner::new(&registry)
            .plan(WorkflowMode::FormatOnly, &FeatureFlags::new())
            .unwrap_err();
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn unconstrained_optional_stage_uses_ordinal() {
        let mut registry = StageRegistry::new();
        registry.register(StageDefinition::new("a", 10, "x").output("a.json")).unwrap();
        registry
            .register(StageDefinition::new("b", 30, "x").input("a.json"))
            .unwrap();
        registry
            .register(
                StageDefinition::new("lookup", 20, "x")
                    .feature(Feature::MetadataLookup)
                    .retryable(2, Fallback::Optional),
            )
            .unwrap();
        registry.set_base(WorkflowMode::FormatOnly, &["a", "b"]);

        let p = Planner::new(&registry)
            .plan(
                WorkflowMode::FormatOnly,
                &FeatureFlags::new().with(Feature::MetadataLookup),
            )
            .unwrap();
        assert_eq!(p.stages, vec!["a", "lookup", "b"]);
    }
}
