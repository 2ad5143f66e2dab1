//! Text generation capability consumed by the gateway
//!
//! The gateway treats the external language model as an opaque
//! `generate(request) -> text | error` call. Implementations report typed
//! [`GenerationError`]s so the gateway can tell transient failures apart from
//! malformed requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline role issuing a generation call. Each role has its own circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    SafetyClassifier,
    Kai,
    TraitProfiler,
    WellnessMonitor,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::SafetyClassifier,
        AgentRole::Kai,
        AgentRole::TraitProfiler,
        AgentRole::WellnessMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::SafetyClassifier => "safety_classifier",
            AgentRole::Kai => "kai",
            AgentRole::TraitProfiler => "trait_profiler",
            AgentRole::WellnessMonitor => "wellness_monitor",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generation request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub role: AgentRole,
    /// Role instructions, sent as the system message
    pub system: String,
    /// Turn-specific content; also the key for the fallback cache
    pub prompt: String,
    /// Scopes cached fallbacks so one user's replies never reach another
    pub user_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(role: AgentRole, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role,
            system: system.into(),
            prompt: prompt.into(),
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Successful generation
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Model-reported quality score, if the backend provides one
    pub confidence: Option<f32>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Transport-level failure reported by a [`TextGenerator`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("generation timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GenerationError {
    /// Transient failures are worth retrying; everything else fails fast.
    ///
    /// 429 and 408 are rate limiting / request timeouts and count as
    /// transient alongside 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout | GenerationError::Connection(_) => true,
            GenerationError::Upstream { status, .. } => {
                *status == 429 || *status == 408 || *status >= 500
            }
            GenerationError::InvalidRequest(_) => false,
        }
    }
}

/// External text-generation capability
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}
