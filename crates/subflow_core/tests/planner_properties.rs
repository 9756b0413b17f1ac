//! Planner checks over every mode and feature combination of the built-in
//! registry.

use std::collections::HashSet;

use subflow_core::models::{Feature, FeatureFlags, WorkflowMode};
use subflow_core::planner::{builtin_registry, InputSource, OmitReason, Plan, Planner};

fn every_plan() -> Vec<(WorkflowMode, FeatureFlags, Plan)> {
    let registry = builtin_registry();
    let planner = Planner::new(&registry);
    let mut plans = Vec::new();
    for &mode in WorkflowMode::all() {
        for flags in FeatureFlags::combinations(Feature::all()) {
            let plan = planner
                .plan(mode, &flags)
                .unwrap_or_else(|e| panic!("{mode} {:?}: {e}", flags.enabled()));
            plans.push((mode, flags, plan));
        }
    }
    plans
}

#[test]
fn plans_are_deterministic() {
    let registry = builtin_registry();
    let planner = Planner::new(&registry);
    for (mode, flags, plan) in every_plan() {
        assert_eq!(planner.plan(mode, &flags).unwrap(), plan);
    }
}

#[test]
fn required_inputs_have_an_earlier_producer() {
    let registry = builtin_registry();
    for (mode, flags, plan) in every_plan() {
        let mut produced: HashSet<&str> = HashSet::new();
        let mut earlier: HashSet<&str> = HashSet::new();
        for name in &plan.stages {
            let def = registry.get(name).unwrap();
            for input in def.inputs.iter().filter(|i| i.required) {
                let available = match &input.source {
                    InputSource::Nearest => produced.contains(input.artifact.as_str()),
                    InputSource::FromStage(stage) => earlier.contains(stage.as_str()),
                };
                assert!(
                    available,
                    "{mode} {:?}: '{}' needs '{}' before it",
                    flags.enabled(),
                    name,
                    input.artifact
                );
            }
            for dep in plan.dependencies_of(name) {
                assert!(earlier.contains(dep), "{mode}: {name} runs before {dep}");
            }
            for required in &def.requires {
                assert!(earlier.contains(required.as_str()));
            }
            produced.extend(def.outputs.iter().map(String::as_str));
            earlier.insert(name);
        }
    }
}

#[test]
fn gated_stages_are_planned_or_explained() {
    let registry = builtin_registry();
    for (mode, flags, plan) in every_plan() {
        for def in registry.stages() {
            let planned = plan.contains(&def.name);
            let omitted = plan.omitted_reason(&def.name);
            let Some(feature) = def.feature else {
                assert!(omitted.is_none());
                continue;
            };
            if !def.applies_to(mode) {
                assert!(!planned, "{mode}: '{}' does not apply", def.name);
                continue;
            }
            assert!(
                planned != omitted.is_some(),
                "{mode} {:?}: '{}' planned={} omitted={:?}",
                flags.enabled(),
                def.name,
                planned,
                omitted
            );
            if !flags.is_enabled(feature) {
                assert_eq!(omitted, Some(&OmitReason::FeatureDisabled));
            }
        }
        let unique: HashSet<&String> = plan.stages.iter().collect();
        assert_eq!(unique.len(), plan.stages.len());
    }
}

#[test]
fn fingerprint_follows_stage_list() {
    let plans = every_plan();
    for (_, _, a) in &plans {
        for (_, _, b) in plans.iter().step_by(97) {
            assert_eq!(
                a.fingerprint == b.fingerprint,
                a.mode == b.mode && a.stages == b.stages
            );
        }
    }
}

#[test]
fn translate_only_lyrics_styling_needs_detection() {
    let registry = builtin_registry();
    let planner = Planner::new(&registry);

    let plan = planner
        .plan(
            WorkflowMode::TranslateOnly,
            &FeatureFlags::new().with(Feature::LyricsStyling),
        )
        .unwrap();
    assert_eq!(plan.stages, ["import_transcript", "translate", "format_subtitles"]);
    assert!(matches!(
        plan.omitted_reason("lyrics_styling"),
        Some(OmitReason::MissingDependency(_))
    ));

    let plan = planner
        .plan(
            WorkflowMode::TranslateOnly,
            &FeatureFlags::new()
                .with(Feature::LyricsDetection)
                .with(Feature::LyricsStyling),
        )
        .unwrap();
    assert_eq!(
        plan.stages,
        [
            "import_transcript",
            "lyrics_detection",
            "lyrics_styling",
            "translate",
            "format_subtitles"
        ]
    );
    assert_eq!(
        plan.downstream_of("lyrics_detection"),
        ["lyrics_styling", "translate", "format_subtitles"]
    );
}

#[test]
fn audio_features_do_not_apply_to_text_modes() {
    let registry = builtin_registry();
    let plan = Planner::new(&registry)
        .plan(WorkflowMode::FormatOnly, &FeatureFlags::all_enabled())
        .unwrap();
    assert_eq!(plan.stages, ["import_transcript", "format_subtitles"]);
    assert_eq!(
        plan.omitted_reason("vocal_separation"),
        Some(&OmitReason::NotApplicable)
    );
}
