//! Scripted text generator shared by unit tests

use crate::gateway::{AgentRole, Generation, GenerationError, GenerationRequest, TextGenerator};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

type Scripted = Result<Generation, GenerationError>;

/// Replays queued results per role, then the role's `always` result.
/// Unscripted calls fail with a non-retryable error.
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    queued: Mutex<HashMap<AgentRole, VecDeque<Scripted>>>,
    always: Mutex<HashMap<AgentRole, Scripted>>,
    delays: Mutex<HashMap<AgentRole, Duration>>,
    calls: Mutex<HashMap<AgentRole, usize>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, role: AgentRole, result: Scripted) {
        self.queued.lock().unwrap().entry(role).or_default().push_back(result);
    }

    pub(crate) fn always(&self, role: AgentRole, result: Scripted) {
        self.always.lock().unwrap().insert(role, result);
    }

    pub(crate) fn reply(&self, role: AgentRole, text: &str) {
        self.always(role, Ok(Generation::new(text)));
    }

    pub(crate) fn set_delay(&self, role: AgentRole, delay: Duration) {
        self.delays.lock().unwrap().insert(role, delay);
    }

    pub(crate) fn calls(&self, role: AgentRole) -> usize {
        self.calls.lock().unwrap().get(&role).copied().unwrap_or(0)
    }

    /// Prompts seen for a role, oldest first
    pub(crate) fn prompts(&self, role: AgentRole) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        *self.calls.lock().unwrap().entry(request.role).or_default() += 1;
        self.requests.lock().unwrap().push(request.clone());

        let delay = self.delays.lock().unwrap().get(&request.role).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        self.always
            .lock()
            .unwrap()
            .get(&request.role)
            .cloned()
            .unwrap_or_else(|| Err(GenerationError::InvalidRequest("unscripted".to_string())))
    }
}
