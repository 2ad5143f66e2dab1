//! Wellness Monitor - best-effort background stage
//!
//! Classifies recent conversation into severity-tagged insights. It does not
//! decide whether to reach out; see [`super::proactive`].

use super::traits::{AgentError, AgentResult, Stage, StageContext, StageKind, StageOutput};
use crate::gateway::{AgentRole, Gateway, GenerationRequest};
use crate::memory::conversation::{transcript, window};
use crate::utils::{clean_json_response, extract_json};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const WELLNESS_SYSTEM_PROMPT: &str = r#"You are a mental wellness specialist identifying patterns in a conversation.

Assess:
- mood: depression, anxiety, stress
- behavioral: sleep, appetite, social withdrawal
- cognitive: rumination, catastrophizing, all-or-nothing thinking
- emotional: intensity, variability, coping
- social: isolation, relationships, support

Severity:
- low: normal variation, general wellness tips are appropriate
- medium: notable concerns, suggest coping strategies and monitoring
- high: significant concerns, recommend professional support

Focus on patterns, not isolated incidents. Be compassionate and non-alarming.

Respond with a JSON array only (empty if nothing stands out):
[{"category": "mood|behavioral|cognitive|emotional|social",
  "insight": "brief description of the pattern",
  "severity": "low|medium|high",
  "recommendations": ["2-4 specific, actionable suggestions"]}]"#;

/// Messages shown to the monitor
pub const WELLNESS_WINDOW: usize = 8;
pub const MAX_RECOMMENDATIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WellnessCategory {
    Mood,
    #[serde(alias = "behavior")]
    Behavioral,
    Cognitive,
    Emotional,
    Social,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellnessInsight {
    pub category: WellnessCategory,
    #[serde(alias = "text")]
    pub insight: String,
    pub severity: Severity,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InsightPayload {
    List(Vec<serde_json::Value>),
    Wrapped { insights: Vec<serde_json::Value> },
    Single(serde_json::Value),
}

fn stage_error(reason: String) -> AgentError {
    AgentError::BackgroundStage {
        stage: StageKind::WellnessMonitor,
        reason,
    }
}

/// Whichever of `[` or `{` opens first decides the payload's shape
fn insight_json(response: &str) -> &str {
    let cleaned = clean_json_response(response);
    match (cleaned.find('['), cleaned.find('{')) {
        (Some(list), Some(object)) if object < list => extract_json(cleaned, '{', '}'),
        (Some(_), _) => extract_json(cleaned, '[', ']'),
        (None, Some(_)) => extract_json(cleaned, '{', '}'),
        (None, None) => cleaned,
    }
}

/// Parse the model's insights, dropping malformed entries.
///
/// Accepts a bare array, `{"insights": [...]}` or a single insight object,
/// with or without surrounding prose.
pub fn parse_insights(response: &str) -> AgentResult<Vec<WellnessInsight>> {
    let payload: InsightPayload = serde_json::from_str(insight_json(response))
        .map_err(|e| stage_error(format!("unparseable insights: {}", e)))?;

    let values = match payload {
        InsightPayload::List(values) | InsightPayload::Wrapped { insights: values } => values,
        InsightPayload::Single(value) if value.is_object() => vec![value],
        InsightPayload::Single(_) => {
            return Err(stage_error("insights must be a list or object".to_string()))
        }
    };

    Ok(values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<WellnessInsight>(value) {
            Ok(mut insight) => {
                insight.recommendations.retain(|r| !r.trim().is_empty());
                insight.recommendations.truncate(MAX_RECOMMENDATIONS);
                Some(insight)
            }
            Err(e) => {
                tracing::debug!("Skipping malformed wellness insight: {}", e);
                None
            }
        })
        .collect())
}

pub struct WellnessStage {
    gateway: Arc<Gateway>,
    window: usize,
}

impl WellnessStage {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            window: WELLNESS_WINDOW,
        }
    }

    /// Analyse everything in the context instead of the recent window
    pub fn full_history(mut self) -> Self {
        self.window = usize::MAX;
        self
    }
}

#[async_trait]
impl Stage for WellnessStage {
    fn kind(&self) -> StageKind {
        StageKind::WellnessMonitor
    }

    async fn invoke(&self, context: &StageContext) -> AgentResult<StageOutput> {
        let conversation = transcript(window(&context.messages, self.window));
        let request = GenerationRequest::new(
            AgentRole::WellnessMonitor,
            WELLNESS_SYSTEM_PROMPT,
            format!(
                "Analyze for mental wellness patterns:\n\nConversation history:\n{}",
                conversation
            ),
        )
        .for_user(&context.user_id);

        let reply = self.gateway.invoke(&request, context.timeout, &context.cancel).await?;
        if reply.is_fallback() {
            return Err(stage_error("generation unavailable".to_string()));
        }

        let insights = parse_insights(&reply.text)?;
        if let Some(max) = insights.iter().map(|i| i.severity).max() {
            tracing::debug!(
                user_id = %context.user_id,
                count = insights.len(),
                max_severity = ?max,
                "Wellness insights extracted"
            );
        }
        Ok(StageOutput::Insights(insights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::memory::Message;
    use crate::observability::PipelineMetrics;
    use crate::test_support::ScriptedGenerator;
    use std::time::Duration;

    #[test]
    fn test_parse_list_with_aliases() {
        let insights = parse_insights(
            r#"```json
            [{"category": "behavior", "insight": "Sleeping less", "severity": "medium",
              "recommendations": ["Wind down earlier", "", "Limit caffeine", "Journal", "Walk", "Stretch"]},
             {"category": "social", "text": "Withdrawing from friends", "severity": "high"}]
            ```"#,
        )
        .unwrap();
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].category, WellnessCategory::Behavioral);
        assert_eq!(insights[0].recommendations.len(), MAX_RECOMMENDATIONS);
        assert_eq!(insights[0].recommendations[1], "Limit caffeine");
        assert_eq!(insights[1].insight, "Withdrawing from friends");
        assert!(insights[1].recommendations.is_empty());
    }

    #[test]
    fn test_parse_wrapped_and_single() {
        let wrapped = parse_insights(
            r#"{"insights": [{"category": "mood", "insight": "Low mood", "severity": "low"}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.len(), 1);

        let single = parse_insights(
            r#"{"category": "cognitive", "insight": "Catastrophizing", "severity": "medium"}"#,
        )
        .unwrap();
        assert_eq!(single[0].category, WellnessCategory::Cognitive);
    }

    #[test]
    fn test_parse_tolerates_surrounding_prose() {
        let insights = parse_insights(
            r#"Here are the insights: [{"category": "mood", "insight": "Low energy", "severity": "medium",
              "recommendations": ["Take a short walk"]}] Let me know if you need more."#,
        )
        .unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].severity, Severity::Medium);

        let single = parse_insights(
            r#"Sure. {"category": "social", "insight": "Isolating", "severity": "high",
              "recommendations": ["Call a friend"]}"#,
        )
        .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].category, WellnessCategory::Social);
        assert_eq!(single[0].recommendations, vec!["Call a friend".to_string()]);
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let insights = parse_insights(
            r#"[{"category": "weather", "insight": "?", "severity": "low"},
                {"category": "emotional", "insight": "Intense swings", "severity": "severe"},
                {"category": "emotional", "insight": "Intense swings", "severity": "high"}]"#,
        )
        .unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].severity, Severity::High);

        assert!(parse_insights("I think they're fine").is_err());
    }

    #[test]
    fn test_insight_serializes_result_schema() {
        let insight = WellnessInsight {
            category: WellnessCategory::Behavioral,
            insight: "Sleeping less".into(),
            severity: Severity::Medium,
            recommendations: vec!["Rest".into()],
        };
        let json = serde_json::to_value(&insight).unwrap();
        assert_eq!(json["category"], "behavioral");
        assert_eq!(json["severity"], "medium");
        assert_eq!(json["insight"], "Sleeping less");
    }

    #[tokio::test]
    async fn test_stage_window() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.reply(AgentRole::WellnessMonitor, "[]");
        let gateway = Gateway::new(
            generator.clone(),
            &GatewayConfig::default(),
            Arc::new(PipelineMetrics::new()),
        );
        let messages: Vec<Message> = (0..12).map(|i| Message::user(format!("line-{}", i))).collect();
        let ctx = StageContext::new("u1", messages, Duration::from_secs(5));

        let gateway = Arc::new(gateway);
        let insights = WellnessStage::new(gateway.clone())
            .invoke(&ctx)
            .await
            .unwrap()
            .into_insights()
            .unwrap();
        assert!(insights.is_empty());
        let prompt = &generator.prompts(AgentRole::WellnessMonitor)[0];
        assert!(prompt.contains("line-4"));
        assert!(!prompt.contains("line-3"));

        WellnessStage::new(gateway).full_history().invoke(&ctx).await.unwrap();
        let prompt = &generator.prompts(AgentRole::WellnessMonitor)[1];
        assert!(prompt.contains("line-0"));
    }
}
