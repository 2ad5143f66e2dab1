//! Conversation and profile memory
//!
//! - [`conversation`]: bounded per-user buffers behind a sharded lock map
//! - [`profile`]: trait profile types consumed by the profiler's merge
//! - [`stores`]: persistence collaborators (in-memory and sled)

pub mod conversation;
pub mod profile;
pub mod stores;

pub use conversation::{ConversationBuffer, ConversationStateStore, Message, Role};
pub use profile::{TraitDomain, TraitEntry, TraitObservation, TraitUpdate, UserProfile};
pub use stores::{
    ConversationStore, InMemoryConversationStore, InMemoryProfileStore, ProfileStore, SledStore,
};
