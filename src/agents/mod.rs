//! Wellness conversation pipeline
//! Four stages behind one orchestrator: safety classification, the Kai
//! reply, then trait profiling and wellness monitoring in the background.

pub mod guardrail;
pub mod orchestrator;
pub mod proactive;
pub mod profiler;
pub mod responder;
pub mod traits;
pub mod wellness;

pub use guardrail::{
    CrisisResourceProvider, GuardrailStage, GuardrailVerdict, SafetyLevel, StaticCrisisResources,
};
pub use orchestrator::{sanitize_message, OrchestrationResult, Orchestrator, ResultMetadata};
pub use profiler::{ProfilerStage, TraitMerger};
pub use responder::ResponderStage;
pub use traits::{AgentError, AgentResult, Stage, StageContext, StageKind, StageOutput, StageReply};
pub use wellness::{Severity, WellnessCategory, WellnessInsight, WellnessStage};
