//! Generation Gateway - resilience layer around the external language model
//!
//! Every stage talks to the model through [`Gateway::invoke`], which adds:
//! - a per-attempt timeout
//! - bounded retries with exponential backoff for transient failures
//! - a circuit breaker per [`AgentRole`]
//! - fallback selection (cache, template, generic apology) when all else fails
//!
//! Callers only ever see a [`GatewayReply`] or [`GatewayError::Cancelled`];
//! transport errors never leak out of `invoke`.

pub mod circuit_breaker;
pub mod fallback;
pub mod generator;
pub mod openai_compat;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use fallback::{FallbackKind, FallbackTemplates, ResponseCache, GENERIC_FALLBACK};
pub use generator::{AgentRole, Generation, GenerationError, GenerationRequest, TextGenerator};
pub use openai_compat::OpenAiCompatClient;
pub use retry::RetryPolicy;

use crate::config::GatewayConfig;
use crate::observability::PipelineMetrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Typed gateway failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("generation timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("circuit open for role {0}")]
    CircuitOpen(AgentRole),

    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("cancelled by caller")]
    Cancelled,
}

impl From<GenerationError> for GatewayError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Timeout => GatewayError::Timeout,
            GenerationError::Connection(msg) => GatewayError::Connection(msg),
            e @ GenerationError::Upstream { .. } if e.is_retryable() => {
                GatewayError::Connection(e.to_string())
            }
            e @ GenerationError::Upstream { .. } => GatewayError::InvalidRequest(e.to_string()),
            GenerationError::InvalidRequest(msg) => GatewayError::InvalidRequest(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Generated,
    Fallback(FallbackKind),
}

/// What a stage gets back from the gateway
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub text: String,
    /// Model-reported score; `None` for fallbacks
    pub confidence: Option<f32>,
    pub source: ReplySource,
    /// Why the gateway fell back, if it did
    pub failure: Option<GatewayError>,
}

impl GatewayReply {
    fn generated(generation: Generation) -> Self {
        Self {
            text: generation.text,
            confidence: generation.confidence,
            source: ReplySource::Generated,
            failure: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.source, ReplySource::Fallback(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleHealth {
    #[serde(flatten)]
    pub breaker: BreakerSnapshot,
    pub cached_responses: usize,
}

pub struct Gateway {
    generator: Arc<dyn TextGenerator>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    cache: ResponseCache,
    templates: FallbackTemplates,
    metrics: Arc<PipelineMetrics>,
}

impl Gateway {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        config: &GatewayConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            generator,
            breaker: CircuitBreaker::new(config.failure_threshold, config.cooldown()),
            retry: RetryPolicy::new(config.max_attempts, config.base_delay(), config.max_delay()),
            cache: ResponseCache::new(
                config.cache_ttl(),
                config.cache_similarity,
                config.cache_capacity_per_role,
            ),
            templates: FallbackTemplates::default(),
            metrics,
        }
    }

    /// Replace the role-specific fallback templates
    pub fn with_templates(mut self, templates: FallbackTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> Vec<RoleHealth> {
        self.breaker
            .snapshots()
            .into_iter()
            .map(|breaker| RoleHealth {
                cached_responses: self.cache.len(breaker.role),
                breaker,
            })
            .collect()
    }

    /// Generate text, falling back when the model cannot produce a result.
    ///
    /// Only cancellation is reported as an error.
    pub async fn invoke(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<GatewayReply, GatewayError> {
        match self.try_invoke(request, timeout, cancel).await {
            Ok(generation) => {
                self.metrics.increment_generations();
                if request.role != AgentRole::SafetyClassifier {
                    self.cache.store(
                        request.role,
                        request.user_id.as_deref(),
                        &request.prompt,
                        &generation.text,
                    );
                }
                Ok(GatewayReply::generated(generation))
            }
            Err(GatewayError::Cancelled) => Err(GatewayError::Cancelled),
            Err(e) => {
                self.metrics.increment_fallbacks();
                let reply = self.fallback_for(request, e);
                tracing::warn!(
                    role = %request.role,
                    source = ?reply.source,
                    "Generation failed, using fallback"
                );
                Ok(reply)
            }
        }
    }

    /// Generate text with retries and circuit breaking, without fallback
    pub async fn try_invoke(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Generation, GatewayError> {
        let role = request.role;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let Some(permit) = self.breaker.acquire(role) else {
                self.metrics.increment_circuit_rejections();
                tracing::debug!(role = %role, attempt, "Circuit open, skipping transport");
                return Err(GatewayError::CircuitOpen(role));
            };
            let trial = permit.is_trial();

            self.metrics.increment_transport_attempts();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                result = tokio::time::timeout(timeout, self.generator.generate(request)) => result,
            };

            let err = match outcome {
                Ok(Ok(generation)) => {
                    permit.success();
                    if attempt > 1 {
                        tracing::info!(role = %role, attempt, "Generation recovered after retries");
                    }
                    return Ok(generation);
                }
                Ok(Err(e)) => e,
                Err(_) => GenerationError::Timeout,
            };

            if !err.is_retryable() {
                permit.reachable();
                tracing::warn!(role = %role, error = %err, "Non-retryable generation error");
                return Err(err.into());
            }

            permit.failure();

            // A half-open trial gets exactly one transport call
            if trial || !self.retry.has_attempts_left(attempt) {
                tracing::warn!(role = %role, attempt, error = %err, "Generation failed");
                return Err(err.into());
            }

            let delay = self.retry.delay_after(attempt);
            tracing::warn!(
                role = %role,
                attempt,
                max_attempts = self.retry.max_attempts,
                error = %err,
                "Transient generation error, retrying in {:?}",
                delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Pick the fallback for a failed call
    pub fn fallback_for(&self, request: &GenerationRequest, cause: GatewayError) -> GatewayReply {
        let role = request.role;
        let (text, kind) = if role == AgentRole::SafetyClassifier {
            (fallback::CONSERVATIVE_VERDICT.to_string(), FallbackKind::Conservative)
        } else if let Some(cached) =
            self.cache.lookup(role, request.user_id.as_deref(), &request.prompt)
        {
            (cached, FallbackKind::Cached)
        } else if let Some(template) = self.templates.get(role) {
            (template.to_string(), FallbackKind::Template)
        } else {
            (GENERIC_FALLBACK.to_string(), FallbackKind::Generic)
        };

        GatewayReply {
            text,
            confidence: None,
            source: ReplySource::Fallback(kind),
            failure: Some(cause),
        }
    }
}
