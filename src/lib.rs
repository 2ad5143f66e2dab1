//! Kai - conversational wellness pipeline
//! Safety-gated replies from an LLM companion, with background trait
//! profiling and wellness monitoring per user.

pub mod agents;
pub mod config;
pub mod gateway;
pub mod memory;
pub mod notifications;
pub mod observability;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use agents::{AgentError, AgentResult, OrchestrationResult, Orchestrator, SafetyLevel};
pub use config::PipelineConfig;
pub use gateway::{Gateway, GatewayError, TextGenerator};

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Does nothing if a subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
