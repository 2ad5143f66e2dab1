//! User trait profile
//!
//! The profile is owned by a [`super::ProfileStore`]; the pipeline only loads
//! it, merges observations into it and hands it back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_COMMUNICATION_STYLE: &str = "supportive";

fn default_communication_style() -> String {
    DEFAULT_COMMUNICATION_STYLE.to_string()
}

/// Stored value and confidence for one trait
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraitEntry {
    pub value: f32,
    pub confidence: f32,
}

/// One trait reading from a single profiler run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitObservation {
    #[serde(alias = "name", alias = "trait")]
    pub trait_name: String,
    pub value: f32,
    pub confidence: f32,
}

impl TraitObservation {
    pub fn new(trait_name: impl Into<String>, value: f32, confidence: f32) -> Self {
        Self {
            trait_name: trait_name.into(),
            value,
            confidence,
        }
    }
}

/// Post-merge state of a trait, as reported in the orchestration result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitUpdate {
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub value: f32,
    pub confidence: f32,
}

/// Inclusive value range a trait is clamped to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraitDomain {
    pub min: f32,
    pub max: f32,
}

impl TraitDomain {
    pub const UNIT: TraitDomain = TraitDomain { min: 0.0, max: 1.0 };

    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.min;
        }
        value.clamp(self.min, self.max)
    }
}

impl Default for TraitDomain {
    fn default() -> Self {
        Self::UNIT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub traits: BTreeMap<String, TraitEntry>,
    #[serde(default = "default_communication_style")]
    pub communication_style: String,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            traits: BTreeMap::new(),
            communication_style: default_communication_style(),
        }
    }

    pub fn get(&self, trait_name: &str) -> Option<&TraitEntry> {
        self.traits.get(trait_name)
    }

    /// Highest-confidence traits first; ties broken by name
    pub fn top_traits(&self, n: usize) -> Vec<(&str, TraitEntry)> {
        let mut traits: Vec<(&str, TraitEntry)> = self
            .traits
            .iter()
            .map(|(name, entry)| (name.as_str(), *entry))
            .collect();
        traits.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence).then(a.0.cmp(b.0)));
        traits.truncate(n);
        traits
    }
}
