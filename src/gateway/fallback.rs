//! Fallback selection for failed generations
//!
//! Priority order:
//! 1. A fresh cached response for the same role and user whose prompt is
//!    similar enough
//! 2. A role-specific static template
//! 3. A generic apology
//!
//! The safety classifier never takes this path: its fallback is always the
//! conservative WARNING verdict.

use super::generator::AgentRole;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const GENERIC_FALLBACK: &str =
    "I'm sorry, something went wrong on my side. Please try again in a moment.";

const KAI_FALLBACK: &str = "I'm having a little trouble finding my words right now, but I'm \
still here with you. Could you tell me a bit more about what's on your mind?";

/// Conservative verdict returned in place of a safety classification
pub const CONSERVATIVE_VERDICT: &str = r#"{"safety": "warning", "reason": "Safety classification unavailable; treating message conservatively"}"#;

/// Where a fallback text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    Cached,
    Template,
    Generic,
    /// WARNING-level verdict for the safety classifier
    Conservative,
}

struct CacheEntry {
    tokens: HashSet<String>,
    text: String,
    stored_at: Instant,
}

/// Requests without a user share one pool per role
type CacheKey = (AgentRole, Option<String>);

/// Last successful responses per role and user, matched by prompt similarity
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, VecDeque<CacheEntry>>>,
    ttl: Duration,
    min_similarity: f32,
    capacity_per_role: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, min_similarity: f32, capacity_per_role: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            min_similarity,
            capacity_per_role: capacity_per_role.max(1),
        }
    }

    pub fn store(&self, role: AgentRole, user_id: Option<&str>, prompt: &str, text: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let queue = entries.entry((role, user_id.map(str::to_string))).or_default();
        queue.retain(|e| e.stored_at.elapsed() < self.ttl);
        if queue.len() >= self.capacity_per_role {
            queue.pop_front();
        }
        queue.push_back(CacheEntry {
            tokens: tokenize(prompt),
            text: text.to_string(),
            stored_at: Instant::now(),
        });
    }

    /// Best fresh match at or above the similarity threshold
    pub fn lookup(&self, role: AgentRole, user_id: Option<&str>, prompt: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        let queue = entries.get(&(role, user_id.map(str::to_string)))?;
        let tokens = tokenize(prompt);

        queue
            .iter()
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| (jaccard(&tokens, &e.tokens), e))
            .filter(|(score, _)| *score >= self.min_similarity)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, e)| e.text.clone())
    }

    /// Entries held for a role across all users
    pub fn len(&self, role: AgentRole) -> usize {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|((r, _), _)| *r == role)
                    .map(|(_, queue)| queue.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self, role: AgentRole) -> bool {
        self.len(role) == 0
    }
}

/// Role-specific static texts
pub struct FallbackTemplates {
    templates: HashMap<AgentRole, String>,
}

impl Default for FallbackTemplates {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(AgentRole::Kai, KAI_FALLBACK.to_string());
        Self { templates }
    }
}

impl FallbackTemplates {
    pub fn with_template(mut self, role: AgentRole, text: impl Into<String>) -> Self {
        self.templates.insert(role, text.into());
        self
    }

    pub fn get(&self, role: AgentRole) -> Option<&str> {
        self.templates.get(&role).map(String::as_str)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similar_prompt_hits_cache() {
        let cache = ResponseCache::new(Duration::from_secs(60), 0.6, 8);
        cache.store(AgentRole::Kai, None, "I feel tired after work today", "Rest sounds important.");

        let hit = cache.lookup(AgentRole::Kai, None, "i feel so tired after work today");
        assert_eq!(hit.as_deref(), Some("Rest sounds important."));
        assert!(cache.lookup(AgentRole::Kai, None, "what is the weather").is_none());
    }

    #[test]
    fn test_cache_is_per_role() {
        let cache = ResponseCache::new(Duration::from_secs(60), 0.5, 8);
        cache.store(AgentRole::Kai, None, "hello there", "hi");
        assert!(cache.lookup(AgentRole::WellnessMonitor, None, "hello there").is_none());
    }

    #[test]
    fn test_cache_is_per_user() {
        let cache = ResponseCache::new(Duration::from_secs(60), 0.5, 8);
        cache.store(AgentRole::Kai, Some("alice"), "my sister Maya moved away", "Missing Maya is hard.");

        assert!(cache.lookup(AgentRole::Kai, Some("bob"), "my sister Maya moved away").is_none());
        assert!(cache.lookup(AgentRole::Kai, None, "my sister Maya moved away").is_none());
        assert_eq!(
            cache.lookup(AgentRole::Kai, Some("alice"), "my sister Maya moved away").as_deref(),
            Some("Missing Maya is hard.")
        );

        cache.store(AgentRole::Kai, Some("bob"), "hello", "hi");
        assert_eq!(cache.len(AgentRole::Kai), 2);
    }

    #[test]
    fn test_stale_entries_are_ignored() {
        let cache = ResponseCache::new(Duration::ZERO, 0.0, 8);
        cache.store(AgentRole::Kai, None, "hello", "hi");
        assert!(cache.lookup(AgentRole::Kai, None, "hello").is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = ResponseCache::new(Duration::from_secs(60), 1.0, 2);
        cache.store(AgentRole::Kai, None, "one", "1");
        cache.store(AgentRole::Kai, None, "two", "2");
        cache.store(AgentRole::Kai, None, "three", "3");
        assert_eq!(cache.len(AgentRole::Kai), 2);
        assert!(cache.lookup(AgentRole::Kai, None, "one").is_none());
        assert_eq!(cache.lookup(AgentRole::Kai, None, "three").as_deref(), Some("3"));
    }

    #[test]
    fn test_templates() {
        let templates = FallbackTemplates::default();
        assert!(templates.get(AgentRole::Kai).is_some());
        assert!(templates.get(AgentRole::TraitProfiler).is_none());

        let templates = templates.with_template(AgentRole::TraitProfiler, "[]");
        assert_eq!(templates.get(AgentRole::TraitProfiler), Some("[]"));
    }

    #[test]
    fn test_conservative_verdict_is_json() {
        let value: serde_json::Value = serde_json::from_str(CONSERVATIVE_VERDICT).unwrap();
        assert_eq!(value["safety"], "warning");
    }
}
