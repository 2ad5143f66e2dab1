//! Orchestrator - sequences the pipeline stages for one inbound message
//!
//! Safety Classifier -> Response Generator -> (Trait Profiler || Wellness Monitor)
//!
//! - BLOCKED short-circuits to the crisis template; nothing after it runs.
//! - The per-user buffer lock is held only for the append. Stages work on
//!   the snapshot taken at append time.
//! - Background stages run concurrently under the secondary timeout, and the
//!   call waits for both. A failed background stage is omitted from the
//!   result and never touches `response_text`.
//! - Callers only see a result, a validation error, or their own
//!   cancellation.

use super::guardrail::{CrisisResourceProvider, GuardrailStage, GuardrailVerdict, SafetyLevel, StaticCrisisResources};
use super::proactive;
use super::profiler::{ProfilerStage, TraitMerger};
use super::responder::{ResponderStage, FALLBACK_CONFIDENCE};
use super::traits::{AgentError, AgentResult, Stage, StageContext, StageKind, StageOutput, StageReply};
use super::wellness::{WellnessInsight, WellnessStage};
use crate::config::{PipelineConfig, StageConfig};
use crate::gateway::{Gateway, TextGenerator, GENERIC_FALLBACK};
use crate::memory::{
    ConversationStateStore, ConversationStore, Message, ProfileStore, TraitUpdate, UserProfile,
};
use crate::notifications::NotificationService;
use crate::observability::PipelineMetrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Result of one pipeline run. Never mutated after it is returned.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    #[serde(rename = "response")]
    pub response_text: String,
    pub safety: SafetyLevel,
    pub confidence: f32,
    pub wellness_insights: Vec<WellnessInsight>,
    /// `None` when the profiler did not run or failed
    pub trait_updates: Option<Vec<TraitUpdate>>,
    pub proactive_prompt: Option<String>,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultMetadata {
    pub request_id: String,
    /// Set when the verdict was WARNING
    pub safety_warning: bool,
    pub matched_categories: Vec<String>,
    pub crisis: bool,
    /// The reply is a gateway fallback, not a generation
    pub response_fallback: bool,
    /// Background stages that ran but produced nothing usable
    pub omitted_stages: Vec<StageKind>,
}

/// Strip control characters and enforce the length limit
pub fn sanitize_message(raw: &str, max_chars: usize) -> AgentResult<String> {
    if raw.contains('\0') {
        return Err(AgentError::Validation("message contains NUL bytes".to_string()));
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(AgentError::Validation("message is empty".to_string()));
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(AgentError::Validation(format!(
            "message is {} characters, limit is {}",
            len, max_chars
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_user_id(user_id: &str) -> AgentResult<()> {
    if user_id.trim().is_empty() {
        return Err(AgentError::Validation("user_id is empty".to_string()));
    }
    Ok(())
}

pub struct Orchestrator {
    /// One stage per kind, indexed by `StageKind::index`
    stages: [Arc<dyn Stage>; 4],
    /// Wellness stage over the whole buffer, for on-demand check-ins
    check_in: Arc<dyn Stage>,
    gateway: Arc<Gateway>,
    conversations: ConversationStateStore,
    merger: TraitMerger,
    settings: StageConfig,
    primary_timeout: Duration,
    background_timeout: Duration,
    crisis: Arc<dyn CrisisResourceProvider>,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    /// One save at a time per user
    save_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    profile_store: Option<Arc<dyn ProfileStore>>,
    notifier: Option<Arc<dyn NotificationService>>,
    metrics: Arc<PipelineMetrics>,
}

impl Orchestrator {
    /// Build the full pipeline around a text generator
    pub fn new(generator: Arc<dyn TextGenerator>, config: &PipelineConfig) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let gateway = Arc::new(Gateway::new(generator, &config.gateway, metrics.clone()));
        Self::with_gateway(gateway, metrics, config)
    }

    pub fn with_gateway(
        gateway: Arc<Gateway>,
        metrics: Arc<PipelineMetrics>,
        config: &PipelineConfig,
    ) -> Self {
        let stages: [Arc<dyn Stage>; 4] = [
            Arc::new(GuardrailStage::new(gateway.clone())),
            Arc::new(ResponderStage::new(gateway.clone())),
            Arc::new(ProfilerStage::new(gateway.clone())),
            Arc::new(WellnessStage::new(gateway.clone())),
        ];

        Self {
            stages,
            check_in: Arc::new(WellnessStage::new(gateway.clone()).full_history()),
            gateway,
            conversations: ConversationStateStore::new(config.pipeline.buffer_capacity),
            merger: TraitMerger::new(config.profiler.decay),
            settings: config.pipeline.clone(),
            primary_timeout: config.gateway.timeout(),
            background_timeout: config.background_timeout(),
            crisis: Arc::new(StaticCrisisResources),
            conversation_store: None,
            save_locks: Mutex::new(HashMap::new()),
            profile_store: None,
            notifier: None,
            metrics,
        }
    }

    /// Replace the stage of the same kind
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let kind = stage.kind();
        if kind == StageKind::WellnessMonitor {
            self.check_in = stage.clone();
        }
        self.stages[kind.index()] = stage;
        self
    }

    pub fn with_merger(mut self, merger: TraitMerger) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_crisis_resources(mut self, provider: Arc<dyn CrisisResourceProvider>) -> Self {
        self.crisis = provider;
        self
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversation_store = Some(store);
        self
    }

    pub fn with_profile_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profile_store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationService>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn conversations(&self) -> &ConversationStateStore {
        &self.conversations
    }

    fn stage(&self, kind: StageKind) -> &Arc<dyn Stage> {
        &self.stages[kind.index()]
    }

    pub async fn process(&self, user_id: &str, message: &str) -> AgentResult<OrchestrationResult> {
        self.process_cancellable(user_id, message, None, &CancellationToken::new())
            .await
    }

    /// Like [`Self::process`], seeding a new buffer from `history`
    pub async fn process_with_history(
        &self,
        user_id: &str,
        message: &str,
        history: Vec<Message>,
    ) -> AgentResult<OrchestrationResult> {
        self.process_cancellable(user_id, message, Some(history), &CancellationToken::new())
            .await
    }

    /// Full entry point. Cancelling `cancel` aborts in-flight generation; the
    /// user message already appended stays in the buffer.
    pub async fn process_cancellable(
        &self,
        user_id: &str,
        message: &str,
        history: Option<Vec<Message>>,
        cancel: &CancellationToken,
    ) -> AgentResult<OrchestrationResult> {
        let text = match validate_user_id(user_id)
            .and_then(|_| sanitize_message(message, self.settings.max_message_chars))
        {
            Ok(text) => text,
            Err(e) => {
                self.metrics.increment_validation_rejections();
                tracing::debug!(user_id, "Rejected message: {}", e);
                return Err(e);
            }
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("process", request_id = %request_id, user_id = %user_id);
        self.run(user_id, text, history, cancel, request_id)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        user_id: &str,
        text: String,
        history: Option<Vec<Message>>,
        cancel: &CancellationToken,
        request_id: String,
    ) -> AgentResult<OrchestrationResult> {
        self.seed_history(user_id, history).await;
        let snapshot = self.conversations.append(user_id, Message::user(text));
        self.persist_buffer(user_id).await;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut context = StageContext {
            user_id: user_id.to_string(),
            messages: snapshot.to_vec(),
            profile: None,
            timeout: self.primary_timeout,
            cancel: cancel.clone(),
        };

        // 1. Safety
        let verdict = self.classify(&context).await?;
        let mut metadata = ResultMetadata {
            request_id,
            safety_warning: verdict.level == SafetyLevel::Warning,
            matched_categories: verdict.matched_categories.iter().cloned().collect(),
            ..ResultMetadata::default()
        };

        if verdict.level == SafetyLevel::Blocked {
            self.metrics.increment_blocked();
            self.metrics.increment_processed();
            tracing::warn!(categories = ?metadata.matched_categories, "Message blocked, returning crisis resources");
            metadata.crisis = true;
            return Ok(OrchestrationResult {
                response_text: self.crisis.text(&self.settings.locale),
                safety: SafetyLevel::Blocked,
                confidence: 1.0,
                wellness_insights: Vec::new(),
                trait_updates: None,
                proactive_prompt: None,
                metadata,
            });
        }
        if verdict.level == SafetyLevel::Warning {
            self.metrics.increment_warned();
        }

        // 2. Reply
        let profile = self.load_profile(user_id).await;
        context.profile = Some(profile.clone());
        let reply = self.respond(&context).await?;
        metadata.response_fallback = reply.fallback;

        let mut background_messages = context.messages;
        if !reply.fallback {
            let assistant = Message::assistant(reply.text.clone());
            self.conversations.append(user_id, assistant.clone());
            self.persist_buffer(user_id).await;
            background_messages.push(assistant);
        }

        // 3. Background analysis, thresholds on the append-time snapshot
        let buffer_len = snapshot.len();
        let background = StageContext {
            user_id: user_id.to_string(),
            messages: background_messages,
            profile: Some(profile.clone()),
            timeout: self.background_timeout,
            cancel: cancel.clone(),
        };
        let (traits, insights) = futures::join!(
            self.run_background(
                StageKind::TraitProfiler,
                &background,
                buffer_len >= self.settings.genetic_threshold
            ),
            self.run_background(
                StageKind::WellnessMonitor,
                &background,
                buffer_len >= self.settings.wellness_threshold
            ),
        );

        // Nothing partial is recorded for a cancelled call
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let trait_updates = match self.settle(StageKind::TraitProfiler, traits, &mut metadata) {
            Some(output) => match output.into_traits() {
                Ok(observations) => {
                    let (merged, updates) = self.merger.merge(&profile, &observations);
                    if !updates.is_empty() {
                        self.save_profile(user_id, &merged).await;
                    }
                    Some(updates)
                }
                Err(e) => {
                    self.omit(StageKind::TraitProfiler, &e, &mut metadata);
                    None
                }
            },
            None => None,
        };

        let wellness_insights = match self.settle(StageKind::WellnessMonitor, insights, &mut metadata) {
            Some(output) => match output.into_insights() {
                Ok(insights) => insights,
                Err(e) => {
                    self.omit(StageKind::WellnessMonitor, &e, &mut metadata);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        // 4. Aggregate
        let proactive_prompt = proactive::select_prompt(&wellness_insights).map(str::to_string);
        if let Some(prompt) = &proactive_prompt {
            self.metrics.increment_proactive_prompts();
            self.notify(user_id, prompt).await;
        }

        self.metrics.increment_processed();
        tracing::info!(
            safety = verdict.level.as_str(),
            fallback = reply.fallback,
            insights = wellness_insights.len(),
            "Message processed"
        );

        Ok(OrchestrationResult {
            response_text: reply.text,
            safety: verdict.level,
            confidence: reply.confidence,
            wellness_insights,
            trait_updates,
            proactive_prompt,
            metadata,
        })
    }

    async fn classify(&self, context: &StageContext) -> AgentResult<GuardrailVerdict> {
        let result = self
            .stage(StageKind::SafetyClassifier)
            .invoke(context)
            .await
            .and_then(StageOutput::into_verdict);
        match result {
            Ok(verdict) => Ok(verdict),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::error!("Safety classification failed: {}. Treating as WARNING.", e);
                Ok(GuardrailVerdict::conservative(e.to_string()))
            }
        }
    }

    async fn respond(&self, context: &StageContext) -> AgentResult<StageReply> {
        let result = self
            .stage(StageKind::ResponseGenerator)
            .invoke(context)
            .await
            .and_then(StageOutput::into_reply);
        match result {
            Ok(reply) => Ok(reply),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!("Response generation failed: {}", e);
                Ok(StageReply {
                    text: GENERIC_FALLBACK.to_string(),
                    confidence: FALLBACK_CONFIDENCE,
                    fallback: true,
                })
            }
        }
    }

    async fn run_background(
        &self,
        kind: StageKind,
        context: &StageContext,
        enabled: bool,
    ) -> Option<AgentResult<StageOutput>> {
        if !enabled {
            tracing::debug!(stage = %kind, len = context.messages.len(), "Below threshold, skipping");
            return None;
        }
        let outcome = tokio::time::timeout(self.background_timeout, self.stage(kind).invoke(context)).await;
        Some(outcome.unwrap_or(Err(AgentError::Timeout)))
    }

    /// Unwrap a background outcome, recording failures in the metadata
    fn settle(
        &self,
        kind: StageKind,
        outcome: Option<AgentResult<StageOutput>>,
        metadata: &mut ResultMetadata,
    ) -> Option<StageOutput> {
        match outcome? {
            Ok(output) => Some(output),
            Err(e) => {
                self.omit(kind, &e, metadata);
                None
            }
        }
    }

    fn omit(&self, kind: StageKind, err: &AgentError, metadata: &mut ResultMetadata) {
        self.metrics.increment_background_failures();
        tracing::warn!(stage = %kind, "Background stage omitted: {}", err);
        metadata.omitted_stages.push(kind);
    }

    async fn seed_history(&self, user_id: &str, history: Option<Vec<Message>>) {
        if self.conversations.contains(user_id) {
            return;
        }
        let history = match (history, &self.conversation_store) {
            (Some(history), _) => Some(history),
            (None, Some(store)) => match store.load(user_id).await {
                Ok(history) => history,
                Err(e) => {
                    tracing::warn!("Failed to load conversation history: {}", e);
                    None
                }
            },
            (None, None) => None,
        };
        if let Some(history) = history {
            let count = history.len();
            if self.conversations.seed(user_id, history) {
                tracing::debug!(count, "Seeded conversation buffer");
            }
        }
    }

    fn save_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.save_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(user_id.to_string()).or_default().clone()
    }

    /// Save the user's current buffer. Saves for one user are serialised and
    /// each one writes the buffer as it stands once the lock is held, so a
    /// slow save can never land after a newer one.
    async fn persist_buffer(&self, user_id: &str) {
        let Some(store) = &self.conversation_store else {
            return;
        };
        let lock = self.save_lock(user_id);
        let _guard = lock.lock().await;

        let Some(buffer) = self.conversations.snapshot(user_id) else {
            return;
        };
        if let Err(e) = store.save(user_id, &buffer).await {
            tracing::warn!("Failed to save conversation buffer: {}", e);
        }
    }

    async fn load_profile(&self, user_id: &str) -> UserProfile {
        let Some(store) = &self.profile_store else {
            return UserProfile::new(user_id);
        };
        match store.load(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => UserProfile::new(user_id),
            Err(e) => {
                tracing::warn!("Failed to load profile, using an empty one: {}", e);
                UserProfile::new(user_id)
            }
        }
    }

    async fn save_profile(&self, user_id: &str, profile: &UserProfile) {
        if let Some(store) = &self.profile_store {
            if let Err(e) = store.save(user_id, profile).await {
                tracing::warn!("Failed to save profile: {}", e);
            }
        }
    }

    async fn notify(&self, user_id: &str, prompt: &str) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.enqueue(user_id, prompt).await {
                tracing::warn!("Failed to enqueue proactive prompt: {}", e);
            }
        }
    }

    /// Run the wellness monitor over the user's current buffer and return the
    /// check-in prompt it warrants, if any.
    pub async fn proactive_check_in(&self, user_id: &str) -> AgentResult<Option<String>> {
        validate_user_id(user_id)?;
        let Some(buffer) = self.conversations.snapshot(user_id) else {
            return Ok(None);
        };
        if buffer.len() < self.settings.wellness_threshold {
            return Ok(None);
        }

        let context = StageContext {
            user_id: user_id.to_string(),
            messages: buffer.to_vec(),
            profile: None,
            timeout: self.primary_timeout,
            cancel: CancellationToken::new(),
        };
        let result = self
            .check_in
            .invoke(&context)
            .await
            .and_then(StageOutput::into_insights);
        match result {
            Ok(insights) => {
                let prompt = proactive::select_prompt(&insights).map(str::to_string);
                if prompt.is_some() {
                    self.metrics.increment_proactive_prompts();
                }
                Ok(prompt)
            }
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                self.metrics.increment_background_failures();
                tracing::warn!(user_id, "Proactive check-in failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Drop the user's in-memory buffer. Returns whether one existed.
    pub fn clear_session(&self, user_id: &str) -> bool {
        self.save_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
        self.conversations.clear(user_id)
    }
}
