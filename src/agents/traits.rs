//! Stage trait definitions and shared types
//! Every pipeline stage implements [`Stage`]; the orchestrator holds exactly
//! one stage per [`StageKind`].

use super::guardrail::GuardrailVerdict;
use super::wellness::WellnessInsight;
use crate::gateway::{AgentRole, GatewayError};
use crate::memory::{Message, TraitObservation, UserProfile};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result type for stage operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Stage and pipeline error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Malformed input, rejected before any stage runs
    #[error("validation failed: {0}")]
    Validation(String),

    /// Safety classifier could not produce a verdict
    #[error("classification failed: {0}")]
    Classification(String),

    #[error("{stage} failed: {reason}")]
    BackgroundStage { stage: StageKind, reason: String },

    #[error("gateway error: {0}")]
    Gateway(GatewayError),

    #[error("stage timed out")]
    Timeout,

    #[error("cancelled by caller")]
    Cancelled,
}

impl From<GatewayError> for AgentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Cancelled => AgentError::Cancelled,
            other => AgentError::Gateway(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    SafetyClassifier,
    ResponseGenerator,
    TraitProfiler,
    WellnessMonitor,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::SafetyClassifier,
        StageKind::ResponseGenerator,
        StageKind::TraitProfiler,
        StageKind::WellnessMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::SafetyClassifier => "safety_classifier",
            StageKind::ResponseGenerator => "response_generator",
            StageKind::TraitProfiler => "trait_profiler",
            StageKind::WellnessMonitor => "wellness_monitor",
        }
    }

    /// Gateway role (and circuit) used by this stage
    pub fn role(&self) -> AgentRole {
        match self {
            StageKind::SafetyClassifier => AgentRole::SafetyClassifier,
            StageKind::ResponseGenerator => AgentRole::Kai,
            StageKind::TraitProfiler => AgentRole::TraitProfiler,
            StageKind::WellnessMonitor => AgentRole::WellnessMonitor,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            StageKind::SafetyClassifier => 0,
            StageKind::ResponseGenerator => 1,
            StageKind::TraitProfiler => 2,
            StageKind::WellnessMonitor => 3,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context passed to a stage invocation
#[derive(Debug, Clone)]
pub struct StageContext {
    pub user_id: String,
    /// Buffer snapshot, oldest first
    pub messages: Vec<Message>,
    pub profile: Option<UserProfile>,
    /// Per-attempt timeout for gateway calls
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(user_id: impl Into<String>, messages: Vec<Message>, timeout: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            messages,
            profile: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Most recent user turn, if any
    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::memory::Role::User)
    }
}

/// Reply produced by the response generator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReply {
    pub text: String,
    pub confidence: f32,
    /// The gateway substituted a fallback
    pub fallback: bool,
}

/// Output from a stage
#[derive(Debug, Clone)]
pub enum StageOutput {
    Verdict(GuardrailVerdict),
    Reply(StageReply),
    Traits(Vec<TraitObservation>),
    Insights(Vec<WellnessInsight>),
}

impl StageOutput {
    fn mismatch(&self, expected: StageKind) -> AgentError {
        let got = match self {
            StageOutput::Verdict(_) => "verdict",
            StageOutput::Reply(_) => "reply",
            StageOutput::Traits(_) => "traits",
            StageOutput::Insights(_) => "insights",
        };
        AgentError::BackgroundStage {
            stage: expected,
            reason: format!("unexpected {} output", got),
        }
    }

    pub fn into_verdict(self) -> AgentResult<GuardrailVerdict> {
        match self {
            StageOutput::Verdict(v) => Ok(v),
            other => Err(AgentError::Classification(
                other.mismatch(StageKind::SafetyClassifier).to_string(),
            )),
        }
    }

    pub fn into_reply(self) -> AgentResult<StageReply> {
        match self {
            StageOutput::Reply(r) => Ok(r),
            other => Err(other.mismatch(StageKind::ResponseGenerator)),
        }
    }

    pub fn into_traits(self) -> AgentResult<Vec<TraitObservation>> {
        match self {
            StageOutput::Traits(t) => Ok(t),
            other => Err(other.mismatch(StageKind::TraitProfiler)),
        }
    }

    pub fn into_insights(self) -> AgentResult<Vec<WellnessInsight>> {
        match self {
            StageOutput::Insights(i) => Ok(i),
            other => Err(other.mismatch(StageKind::WellnessMonitor)),
        }
    }
}

/// Core stage trait - all pipeline stages implement this
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn name(&self) -> &str {
        self.kind().as_str()
    }

    async fn invoke(&self, context: &StageContext) -> AgentResult<StageOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_cancellation_maps_to_cancelled() {
        assert_eq!(AgentError::from(GatewayError::Cancelled), AgentError::Cancelled);
        assert_eq!(
            AgentError::from(GatewayError::Timeout),
            AgentError::Gateway(GatewayError::Timeout)
        );
    }

    #[test]
    fn test_stage_roles() {
        assert_eq!(StageKind::ResponseGenerator.role(), AgentRole::Kai);
        let indices: Vec<usize> = StageKind::ALL.iter().map(StageKind::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_output_mismatch_is_an_error() {
        let output = StageOutput::Traits(Vec::new());
        assert!(output.clone().into_traits().is_ok());
        assert!(matches!(
            output.into_insights(),
            Err(AgentError::BackgroundStage {
                stage: StageKind::WellnessMonitor,
                ..
            })
        ));
    }

    #[test]
    fn test_latest_user_message() {
        let ctx = StageContext::new(
            "u1",
            vec![Message::user("first"), Message::user("second"), Message::assistant("reply")],
            Duration::from_secs(1),
        );
        assert_eq!(ctx.latest_user_message().unwrap().text, "second");
    }
}
