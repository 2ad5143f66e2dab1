//! Observability Module - pipeline counters
//!
//! Lock-free counters shared by the gateway and orchestrator. A snapshot is
//! serialisable so callers can expose it however they like.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    messages_processed: AtomicU64,
    messages_blocked: AtomicU64,
    messages_warned: AtomicU64,
    validation_rejections: AtomicU64,
    generations: AtomicU64,
    fallbacks: AtomicU64,
    transport_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
    background_failures: AtomicU64,
    proactive_prompts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub messages_blocked: u64,
    pub messages_warned: u64,
    pub validation_rejections: u64,
    pub generations: u64,
    pub fallbacks: u64,
    pub transport_attempts: u64,
    pub circuit_rejections: u64,
    pub background_failures: u64,
    pub proactive_prompts: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_blocked(&self) {
        self.messages_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_warned(&self) {
        self.messages_warned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_validation_rejections(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_generations(&self) {
        self.generations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fallbacks(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_transport_attempts(&self) {
        self.transport_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_circuit_rejections(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_background_failures(&self) {
        self.background_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_proactive_prompts(&self) {
        self.proactive_prompts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_blocked: self.messages_blocked.load(Ordering::Relaxed),
            messages_warned: self.messages_warned.load(Ordering::Relaxed),
            validation_rejections: self.validation_rejections.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            transport_attempts: self.transport_attempts.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
            proactive_prompts: self.proactive_prompts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.increment_processed();
        metrics.increment_processed();
        metrics.increment_fallbacks();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_processed, 2);
        assert_eq!(snap.fallbacks, 1);
        assert_eq!(snap.generations, 0);
    }
}
