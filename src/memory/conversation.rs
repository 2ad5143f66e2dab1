//! Conversation memory - bounded per-user message history
//!
//! Buffers live in a sharded map keyed by `user_id`; each shard has its own
//! lock so appends for different users rarely contend. Stages never hold a
//! reference into the map, they work on the snapshot returned by `append`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Render messages as `role: text` lines for a prompt
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Last `n` messages of a snapshot
pub fn window(messages: &[Message], n: usize) -> &[Message] {
    &messages[messages.len().saturating_sub(n)..]
}

/// FIFO history with a hard capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationBuffer {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl ConversationBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build from existing history, keeping only the newest `capacity` entries
    pub fn from_messages(capacity: usize, messages: impl IntoIterator<Item = Message>) -> Self {
        let mut buffer = Self::new(capacity);
        for message in messages {
            buffer.push(message);
        }
        buffer
    }

    /// Append, evicting the oldest entry when full. Returns the evicted message.
    pub fn push(&mut self, message: Message) -> Option<Message> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }
}

/// Sharded map of per-user buffers
pub struct ConversationStateStore {
    shards: Vec<Mutex<HashMap<String, ConversationBuffer>>>,
    capacity: usize,
}

impl ConversationStateStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_shards(capacity, DEFAULT_SHARDS)
    }

    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shard(&self, user_id: &str) -> MutexGuard<'_, HashMap<String, ConversationBuffer>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        match self.shards[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.shard(user_id).contains_key(user_id)
    }

    /// Install history for a user that has no buffer yet.
    ///
    /// Returns false (and leaves the buffer alone) if one already exists.
    pub fn seed(&self, user_id: &str, history: Vec<Message>) -> bool {
        let mut shard = self.shard(user_id);
        if shard.contains_key(user_id) {
            return false;
        }
        shard.insert(
            user_id.to_string(),
            ConversationBuffer::from_messages(self.capacity, history),
        );
        true
    }

    /// Append under the user's shard lock and return a snapshot taken
    /// immediately after the append.
    pub fn append(&self, user_id: &str, message: Message) -> ConversationBuffer {
        let mut shard = self.shard(user_id);
        let buffer = shard
            .entry(user_id.to_string())
            .or_insert_with(|| ConversationBuffer::new(self.capacity));
        if let Some(evicted) = buffer.push(message) {
            tracing::trace!(user_id, role = evicted.role.as_str(), "Evicted oldest message");
        }
        buffer.clone()
    }

    pub fn snapshot(&self, user_id: &str) -> Option<ConversationBuffer> {
        self.shard(user_id).get(user_id).cloned()
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.shard(user_id).get(user_id).map_or(0, ConversationBuffer::len)
    }

    /// Drop a user's buffer. Returns whether one existed.
    pub fn clear(&self, user_id: &str) -> bool {
        self.shard(user_id).remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| match s.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }
}
