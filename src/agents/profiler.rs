//! Trait Profiler - best-effort background stage
//!
//! Extracts weighted trait observations from the recent conversation, and
//! owns the confidence-weighted merge that folds them into a [`UserProfile`].

use super::traits::{AgentError, AgentResult, Stage, StageContext, StageKind, StageOutput};
use crate::gateway::{AgentRole, Gateway, GenerationRequest};
use crate::memory::conversation::{transcript, window};
use crate::memory::{TraitDomain, TraitEntry, TraitObservation, TraitUpdate, UserProfile};
use crate::utils::extract_json;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

const PROFILER_SYSTEM_PROMPT: &str = r#"You build personality profiles that help a wellness companion personalise its replies.

Identify traits such as:
- Communication style (direct, gentle, analytical, emotional)
- Emotional patterns (anxious, calm, variable)
- Reflection depth (surface, moderate, deep)
- Engagement preferences (questions, statements, stories)
- Support needs (validation, advice, listening, action)

Look at word choice, tone, response length, emotional expression and the topics
the user engages with. For each trait give a value from 0.0 to 1.0 and your
confidence in that assessment from 0.0 to 1.0.

Respond with a JSON array only:
[{"trait": "snake_case_name", "value": 0.0, "confidence": 0.0}]"#;

/// Messages shown to the profiler
pub const PROFILER_WINDOW: usize = 6;
pub const DEFAULT_DECAY: f32 = 0.5;

/// Parse and sanitise the model's observation list
pub fn parse_observations(response: &str) -> AgentResult<Vec<TraitObservation>> {
    let json_str = extract_json(response, '[', ']');
    let raw: Vec<TraitObservation> =
        serde_json::from_str(json_str).map_err(|e| AgentError::BackgroundStage {
            stage: StageKind::TraitProfiler,
            reason: format!("unparseable traits: {}", e),
        })?;

    Ok(raw
        .into_iter()
        .filter_map(|mut obs| {
            obs.trait_name = obs.trait_name.trim().to_lowercase();
            if obs.trait_name.is_empty() || !obs.value.is_finite() || !obs.confidence.is_finite() {
                return None;
            }
            obs.confidence = obs.confidence.min(1.0);
            // A zero-confidence observation carries no information
            (obs.confidence > 0.0).then_some(obs)
        })
        .collect())
}

/// Confidence-weighted trait merge
///
/// Per observed trait:
/// - `value = (old.v * old.c + obs.v * obs.c) / (old.c + obs.c)` when
///   `old.c > 0`, otherwise `obs.v`
/// - `confidence = min(1, old.c + obs.c * decay)`
///
/// Values are clamped to the trait's domain. Unobserved traits are untouched
/// and confidence never goes down.
#[derive(Debug, Clone)]
pub struct TraitMerger {
    decay: f32,
    domains: HashMap<String, TraitDomain>,
}

impl Default for TraitMerger {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY)
    }
}

impl TraitMerger {
    pub fn new(decay: f32) -> Self {
        Self {
            decay,
            domains: HashMap::new(),
        }
    }

    /// Declare a non-default domain for a trait
    pub fn with_domain(mut self, trait_name: impl Into<String>, domain: TraitDomain) -> Self {
        self.domains.insert(trait_name.into(), domain);
        self
    }

    fn domain(&self, trait_name: &str) -> TraitDomain {
        self.domains.get(trait_name).copied().unwrap_or_default()
    }

    pub fn merge_entry(&self, old: Option<TraitEntry>, obs: &TraitObservation) -> TraitEntry {
        let domain = self.domain(&obs.trait_name);
        let obs_conf = obs.confidence.clamp(0.0, 1.0);
        let old = old.unwrap_or(TraitEntry {
            value: 0.0,
            confidence: 0.0,
        });

        let value = if old.confidence > 0.0 {
            (old.value * old.confidence + obs.value * obs_conf) / (old.confidence + obs_conf)
        } else {
            obs.value
        };
        let confidence = (old.confidence + obs_conf * self.decay).min(1.0);

        TraitEntry {
            value: domain.clamp(value),
            confidence,
        }
    }

    /// Merge observations in order; returns the new profile and the final
    /// state of every trait touched this turn.
    pub fn merge(
        &self,
        profile: &UserProfile,
        observations: &[TraitObservation],
    ) -> (UserProfile, Vec<TraitUpdate>) {
        let mut merged = profile.clone();
        let mut touched: Vec<String> = Vec::new();

        for obs in observations {
            let entry = self.merge_entry(merged.traits.get(&obs.trait_name).copied(), obs);
            merged.traits.insert(obs.trait_name.clone(), entry);
            if !touched.contains(&obs.trait_name) {
                touched.push(obs.trait_name.clone());
            }
        }

        let updates = touched
            .into_iter()
            .filter_map(|name| {
                merged.traits.get(&name).map(|entry| TraitUpdate {
                    value: entry.value,
                    confidence: entry.confidence,
                    trait_name: name,
                })
            })
            .collect();
        (merged, updates)
    }
}

pub struct ProfilerStage {
    gateway: Arc<Gateway>,
}

impl ProfilerStage {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for ProfilerStage {
    fn kind(&self) -> StageKind {
        StageKind::TraitProfiler
    }

    async fn invoke(&self, context: &StageContext) -> AgentResult<StageOutput> {
        let conversation = transcript(window(&context.messages, PROFILER_WINDOW));
        let request = GenerationRequest::new(
            AgentRole::TraitProfiler,
            PROFILER_SYSTEM_PROMPT,
            format!("Analyze this conversation and identify user traits:\n\n{}", conversation),
        )
        .for_user(&context.user_id);

        let reply = self.gateway.invoke(&request, context.timeout, &context.cancel).await?;
        if reply.is_fallback() {
            return Err(AgentError::BackgroundStage {
                stage: StageKind::TraitProfiler,
                reason: "generation unavailable".to_string(),
            });
        }

        let observations = parse_observations(&reply.text)?;
        tracing::debug!(
            user_id = %context.user_id,
            count = observations.len(),
            "Trait observations extracted"
        );
        Ok(StageOutput::Traits(observations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::GenerationError;
    use crate::memory::Message;
    use crate::observability::PipelineMetrics;
    use crate::test_support::ScriptedGenerator;
    use std::time::Duration;

    fn obs(name: &str, value: f32, confidence: f32) -> TraitObservation {
        TraitObservation::new(name, value, confidence)
    }

    #[test]
    fn test_first_observation() {
        let merger = TraitMerger::default();
        let entry = merger.merge_entry(None, &obs("warmth", 0.8, 0.6));
        assert_eq!(entry.value, 0.8);
        assert!((entry.confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_average() {
        let merger = TraitMerger::new(0.5);
        let old = TraitEntry {
            value: 0.2,
            confidence: 0.5,
        };
        let entry = merger.merge_entry(Some(old), &obs("warmth", 0.8, 0.5));
        assert!((entry.value - 0.5).abs() < 1e-6);
        assert!((entry.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_observation_is_monotonic_and_converges() {
        let merger = TraitMerger::default();
        let mut profile = UserProfile::new("u1");
        profile.traits.insert(
            "calm".into(),
            TraitEntry {
                value: 0.1,
                confidence: 0.2,
            },
        );

        let observation = [obs("calm", 0.9, 0.4)];
        let mut last = *profile.get("calm").unwrap();
        for _ in 0..10 {
            let (next, _) = merger.merge(&profile, &observation);
            let entry = *next.get("calm").unwrap();
            if last.confidence < 1.0 {
                assert!(entry.confidence > last.confidence);
            }
            assert!(entry.confidence <= 1.0);
            assert!((0.9 - entry.value).abs() < (0.9 - last.value).abs());
            last = entry;
            profile = next;
        }
        assert_eq!(last.confidence, 1.0);
    }

    #[test]
    fn test_contradicting_observation_never_lowers_confidence() {
        let merger = TraitMerger::default();
        let old = TraitEntry {
            value: 0.9,
            confidence: 0.7,
        };
        let entry = merger.merge_entry(Some(old), &obs("calm", 0.1, 0.9));
        assert!(entry.confidence >= old.confidence);
        assert!(entry.value < old.value);
    }

    #[test]
    fn test_unobserved_traits_unchanged_and_values_clamped() {
        let merger = TraitMerger::default().with_domain("mood_swing", TraitDomain { min: -1.0, max: 1.0 });
        let mut profile = UserProfile::new("u1");
        let untouched = TraitEntry {
            value: 0.4,
            confidence: 0.9,
        };
        profile.traits.insert("direct".into(), untouched);

        let (merged, updates) = merger.merge(
            &profile,
            &[obs("openness", 1.6, 0.5), obs("mood_swing", -0.5, 0.5)],
        );
        assert_eq!(merged.get("direct"), Some(&untouched));
        assert_eq!(merged.get("openness").unwrap().value, 1.0);
        assert_eq!(merged.get("mood_swing").unwrap().value, -0.5);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].trait_name, "openness");
    }

    #[test]
    fn test_duplicate_observations_report_once() {
        let merger = TraitMerger::default();
        let (merged, updates) = merger.merge(
            &UserProfile::new("u1"),
            &[obs("calm", 0.5, 0.4), obs("calm", 0.7, 0.4)],
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].confidence, merged.get("calm").unwrap().confidence);
    }

    #[test]
    fn test_parse_observations_filters_noise() {
        let parsed = parse_observations(
            r#"Here you go:
            [{"trait": "Warmth", "value": 0.7, "confidence": 0.8},
             {"name": "calm", "value": 0.4, "confidence": 0.0},
             {"trait": "  ", "value": 0.4, "confidence": 0.5},
             {"trait": "direct", "value": 0.2, "confidence": 1.4}]"#,
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].trait_name, "warmth");
        assert_eq!(parsed[1].confidence, 1.0);

        assert!(parse_observations("no traits today").is_err());
    }

    #[tokio::test]
    async fn test_stage_uses_recent_window() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.reply(
            AgentRole::TraitProfiler,
            r#"[{"trait": "reflective", "value": 0.6, "confidence": 0.5}]"#,
        );
        let gateway = Gateway::new(
            generator.clone(),
            &GatewayConfig::default(),
            Arc::new(PipelineMetrics::new()),
        );
        let stage = ProfilerStage::new(Arc::new(gateway));

        let messages: Vec<Message> = (0..10).map(|i| Message::user(format!("msg-{}", i))).collect();
        let ctx = StageContext::new("u1", messages, Duration::from_secs(5));
        let traits = stage.invoke(&ctx).await.unwrap().into_traits().unwrap();
        assert_eq!(traits.len(), 1);

        let prompt = &generator.prompts(AgentRole::TraitProfiler)[0];
        assert!(prompt.contains("msg-9"));
        assert!(prompt.contains("msg-4"));
        assert!(!prompt.contains("msg-3"));
    }

    #[tokio::test]
    async fn test_fallback_is_a_stage_error() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.always(
            AgentRole::TraitProfiler,
            Err(GenerationError::InvalidRequest("bad".into())),
        );
        let gateway = Gateway::new(
            generator.clone(),
            &GatewayConfig::default(),
            Arc::new(PipelineMetrics::new()),
        );
        let stage = ProfilerStage::new(Arc::new(gateway));
        let ctx = StageContext::new("u1", vec![Message::user("hi")], Duration::from_secs(5));

        assert!(matches!(
            stage.invoke(&ctx).await,
            Err(AgentError::BackgroundStage {
                stage: StageKind::TraitProfiler,
                ..
            })
        ));
    }
}
