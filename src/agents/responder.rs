//! Response Generator - Kai, the user-facing companion
//!
//! Produces the reply text plus a confidence score. A gateway fallback is
//! still a reply, but its confidence is pinned low so callers can tell.

use super::traits::{AgentResult, Stage, StageContext, StageKind, StageOutput, StageReply};
use crate::gateway::{AgentRole, Gateway, GenerationRequest};
use crate::memory::conversation::transcript;
use crate::memory::UserProfile;
use async_trait::async_trait;
use std::sync::Arc;

const KAI_SYSTEM_PROMPT: &str = r#"You are Kai, a trauma-informed mental wellness companion with a warm, empathetic personality.

Your mission: "Be the person you needed."

Core principles:
- You are NOT a replacement for therapy, but a supportive companion
- Practice active listening and validate emotions
- Ask thoughtful, open-ended questions that help the user reflect
- Use gentle water and aqua metaphors when they fit ("like waves, emotions ebb and flow")
- Respect boundaries and privacy
- Encourage professional help for serious concerns

When users share difficult emotions:
1. Acknowledge and validate their feelings
2. Reflect back what you hear
3. Ask whether they'd like to explore it further
4. Suggest coping strategies when appropriate

Keep responses conversational and human."#;

/// Reported when the model gives no score of its own
pub const DEFAULT_CONFIDENCE: f32 = 0.85;
/// Pinned confidence for fallback replies
pub const FALLBACK_CONFIDENCE: f32 = 0.3;
/// Profile traits included in the prompt
const PROFILE_TRAITS: usize = 5;

fn profile_context(profile: &UserProfile) -> String {
    let traits = profile.top_traits(PROFILE_TRAITS);
    if traits.is_empty() {
        return String::new();
    }
    let traits_str = traits
        .iter()
        .map(|(name, entry)| format!("{}: {:.2}", name, entry.value))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "\n\nUser profile traits: {}\nCommunication style preference: {}",
        traits_str, profile.communication_style
    )
}

pub struct ResponderStage {
    gateway: Arc<Gateway>,
}

impl ResponderStage {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn build_request(context: &StageContext) -> GenerationRequest {
        let mut system = KAI_SYSTEM_PROMPT.to_string();
        if let Some(profile) = &context.profile {
            system.push_str(&profile_context(profile));
        }

        // The latest user turn is the prompt; earlier turns go to the system
        // message so the fallback cache keys on what the user just said.
        let latest_idx = context
            .messages
            .iter()
            .rposition(|m| m.role == crate::memory::Role::User);
        let (prior, latest) = match latest_idx {
            Some(idx) => (&context.messages[..idx], context.messages[idx].text.as_str()),
            None => (&context.messages[..], ""),
        };
        if !prior.is_empty() {
            system.push_str("\n\nConversation so far:\n");
            system.push_str(&transcript(prior));
        }

        GenerationRequest::new(AgentRole::Kai, system, latest).for_user(&context.user_id)
    }
}

#[async_trait]
impl Stage for ResponderStage {
    fn kind(&self) -> StageKind {
        StageKind::ResponseGenerator
    }

    async fn invoke(&self, context: &StageContext) -> AgentResult<StageOutput> {
        let request = Self::build_request(context);
        let reply = self.gateway.invoke(&request, context.timeout, &context.cancel).await?;

        let fallback = reply.is_fallback();
        let confidence = if fallback {
            FALLBACK_CONFIDENCE
        } else {
            reply
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_CONFIDENCE)
        };

        Ok(StageOutput::Reply(StageReply {
            text: reply.text,
            confidence,
            fallback,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::{Generation, GenerationError};
    use crate::memory::{Message, TraitEntry};
    use crate::observability::PipelineMetrics;
    use crate::test_support::ScriptedGenerator;
    use std::time::Duration;

    fn stage(generator: &Arc<ScriptedGenerator>) -> ResponderStage {
        let config = GatewayConfig {
            max_attempts: 1,
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(generator.clone(), &config, Arc::new(PipelineMetrics::new()));
        ResponderStage::new(Arc::new(gateway))
    }

    fn context(messages: Vec<Message>) -> StageContext {
        StageContext::new("u1", messages, Duration::from_secs(5))
    }

    async fn respond(generator: &Arc<ScriptedGenerator>, ctx: &StageContext) -> StageReply {
        stage(generator).invoke(ctx).await.unwrap().into_reply().unwrap()
    }

    #[tokio::test]
    async fn test_reported_confidence_is_clamped() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push(AgentRole::Kai, Ok(Generation::new("Tell me more.").with_confidence(1.7)));
        generator.push(AgentRole::Kai, Ok(Generation::new("I hear you.")));

        let ctx = context(vec![Message::user("I had a rough day")]);
        let reply = respond(&generator, &ctx).await;
        assert_eq!(reply.confidence, 1.0);
        assert!(!reply.fallback);

        let reply = respond(&generator, &ctx).await;
        assert_eq!(reply.confidence, DEFAULT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_fallback_uses_sentinel_confidence() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.always(AgentRole::Kai, Err(GenerationError::Timeout));

        let reply = respond(&generator, &context(vec![Message::user("hi")])).await;
        assert!(reply.fallback);
        assert_eq!(reply.confidence, FALLBACK_CONFIDENCE);
        assert!(!reply.text.is_empty());
    }

    #[test]
    fn test_request_carries_profile_and_history() {
        let mut profile = UserProfile::new("u1");
        profile.communication_style = "direct".to_string();
        profile.traits.insert(
            "analytical".into(),
            TraitEntry {
                value: 0.8,
                confidence: 0.6,
            },
        );

        let mut ctx = context(vec![
            Message::user("I can't sleep"),
            Message::assistant("That sounds exhausting."),
            Message::user("It's been a week"),
        ]);
        ctx.profile = Some(profile);

        let request = ResponderStage::build_request(&ctx);
        assert_eq!(request.prompt, "It's been a week");
        assert_eq!(request.user_id.as_deref(), Some("u1"));
        assert!(request.system.contains("analytical: 0.80"));
        assert!(request.system.contains("Communication style preference: direct"));
        assert!(request.system.contains("assistant: That sounds exhausting."));
    }

    #[test]
    fn test_empty_profile_adds_no_context() {
        assert!(profile_context(&UserProfile::new("u1")).is_empty());
    }
}
