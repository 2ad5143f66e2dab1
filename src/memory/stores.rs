//! Persistence collaborators
//!
//! The pipeline never touches storage directly; it goes through these traits.
//! In-memory implementations serve tests and single-process use, and
//! [`SledStore`] keeps buffers and profiles across restarts.

use super::conversation::{ConversationBuffer, Message};
use super::profile::UserProfile;
use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

const CONVERSATION_TREE: &str = "conversations";
const PROFILE_TREE: &str = "profiles";

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Stored history for a user, oldest first
    async fn load(&self, user_id: &str) -> Result<Option<Vec<Message>>>;
    async fn save(&self, user_id: &str, buffer: &ConversationBuffer) -> Result<()>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn save(&self, user_id: &str, profile: &UserProfile) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    buffers: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, user_id: &str) -> Result<Option<Vec<Message>>> {
        Ok(self.buffers.read().await.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, buffer: &ConversationBuffer) -> Result<()> {
        self.buffers
            .write()
            .await
            .insert(user_id.to_string(), buffer.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        self.profiles
            .write()
            .await
            .insert(user_id.to_string(), profile.clone());
        Ok(())
    }
}

/// Sled-backed store for both buffers and profiles
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
}

impl SledStore {
    /// Open the store at the default location
    pub fn new() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let db = sled::open(&path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn default_path() -> Result<PathBuf> {
        let mut path =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("No data directory found"))?;
        path.push("kai");
        path.push("state.db");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(path)
    }

    fn get<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        let tree = self.db.open_tree(tree)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let tree = self.db.open_tree(tree)?;
        tree.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        tree.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SledStore {
    async fn load(&self, user_id: &str) -> Result<Option<Vec<Message>>> {
        self.get(CONVERSATION_TREE, user_id)
    }

    async fn save(&self, user_id: &str, buffer: &ConversationBuffer) -> Result<()> {
        self.set(CONVERSATION_TREE, user_id, &buffer.to_vec())
    }
}

#[async_trait]
impl ProfileStore for SledStore {
    async fn load(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.get(PROFILE_TREE, user_id)
    }

    async fn save(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        self.set(PROFILE_TREE, user_id, profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::profile::TraitEntry;

    #[tokio::test]
    async fn test_in_memory_conversation_store() {
        let store = InMemoryConversationStore::new();
        assert!(store.load("u1").await.unwrap().is_none());

        let buffer = ConversationBuffer::from_messages(20, vec![Message::user("hi")]);
        store.save("u1", &buffer).await.unwrap();
        let loaded = store.load("u1").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text, "hi");
    }

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SledStore::open(path.clone()).unwrap();
            let mut profile = UserProfile::new("u1");
            profile.traits.insert(
                "warmth".into(),
                TraitEntry {
                    value: 0.7,
                    confidence: 0.4,
                },
            );
            ProfileStore::save(&store, "u1", &profile).await.unwrap();

            let buffer = ConversationBuffer::from_messages(
                20,
                vec![Message::user("hello"), Message::assistant("hi there")],
            );
            ConversationStore::save(&store, "u1", &buffer).await.unwrap();
        }

        let store = SledStore::open(path).unwrap();
        let profile = ProfileStore::load(&store, "u1").await.unwrap().unwrap();
        assert_eq!(profile.get("warmth").unwrap().value, 0.7);

        let history = ConversationStore::load(&store, "u1").await.unwrap().unwrap();
        assert_eq!(history.len(), 2);
        assert!(ProfileStore::load(&store, "nobody").await.unwrap().is_none());
    }
}
