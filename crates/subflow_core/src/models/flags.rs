//! Feature flag set carried by a job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::enums::Feature;

/// Independently toggleable features for a job.
///
/// Unset features are disabled. A `BTreeMap` keeps the serialized form
/// and iteration order stable, which the planner relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeMap<Feature, bool>);

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags with every feature enabled.
    pub fn all_enabled() -> Self {
        Self(Feature::all().iter().map(|f| (*f, true)).collect())
    }

    /// Builder-style enable.
    pub fn with(mut self, feature: Feature) -> Self {
        self.set(feature, true);
        self
    }

    /// Builder-style disable.
    pub fn without(mut self, feature: Feature) -> Self {
        self.set(feature, false);
        self
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) {
        self.0.insert(feature, enabled);
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.0.get(&feature).copied().unwrap_or(false)
    }

    /// Enabled features in stable order.
    pub fn enabled(&self) -> Vec<Feature> {
        self.0
            .iter()
            .filter(|(_, on)| **on)
            .map(|(f, _)| *f)
            .collect()
    }

    /// Every combination of on/off over `features` (for exhaustive checks).
    pub fn combinations(features: &[Feature]) -> Vec<FeatureFlags> {
        (0u32..(1 << features.len()))
            .map(|bits| {
                let mut flags = FeatureFlags::new();
                for (i, f) in features.iter().enumerate() {
                    flags.set(*f, bits & (1 << i) != 0);
                }
                flags
            })
            .collect()
    }
}
