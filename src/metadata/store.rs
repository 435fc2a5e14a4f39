//! Metadata store interface.
//!
//! The SQL store that owns files, sessions and bot tokens is an external
//! collaborator; the streaming core only consumes these three lookups.
//! [`MemoryStore`] is the in-process implementation used by the binary (from
//! a serde snapshot) and by the tests.

use crate::error::{Error, Result};
use crate::metadata::{FileMeta, UserSession};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Read-side interface to the metadata store
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch a file descriptor by id.
    async fn file_by_id(&self, id: &str) -> Result<Option<FileMeta>>;

    /// Resolve an auth hash to the session that produced it.
    async fn session_by_hash(&self, hash: &str) -> Result<Option<UserSession>>;

    /// Bot tokens a user has registered for a channel.
    async fn bot_tokens(&self, user_id: i64, channel_id: i64) -> Result<Vec<String>>;
}

/// One session row in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub hash: String,
    pub user_id: i64,
    pub session: String,
}

/// Bot tokens registered for one (user, channel) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotTokenRow {
    pub user_id: i64,
    pub channel_id: i64,
    pub tokens: Vec<String>,
}

/// Serializable contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub files: Vec<FileMeta>,
    #[serde(default)]
    pub sessions: Vec<SessionRow>,
    #[serde(default)]
    pub bot_tokens: Vec<BotTokenRow>,
}

#[derive(Default)]
struct Tables {
    files: HashMap<String, FileMeta>,
    sessions: HashMap<String, UserSession>,
    bots: HashMap<(i64, i64), Vec<String>>,
}

/// In-memory metadata store
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Create a store holding a snapshot's rows.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = MemoryStore::new();
        for file in snapshot.files {
            store.insert_file(file);
        }
        for row in snapshot.sessions {
            store.insert_session(row);
        }
        for row in snapshot.bot_tokens {
            store.set_bot_tokens(row.user_id, row.channel_id, row.tokens);
        }
        store
    }

    /// Load a snapshot file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Store(format!("failed to read metadata snapshot: {}", e)))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("failed to parse metadata snapshot: {}", e)))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Insert or replace a file descriptor.
    pub fn insert_file(&self, file: FileMeta) {
        self.tables.write().files.insert(file.id.clone(), file);
    }

    /// Insert or replace a session row.
    pub fn insert_session(&self, row: SessionRow) {
        self.tables.write().sessions.insert(
            row.hash,
            UserSession {
                user_id: row.user_id,
                session: row.session,
            },
        );
    }

    /// Set the bot tokens for a (user, channel) pair.
    pub fn set_bot_tokens(&self, user_id: i64, channel_id: i64, tokens: Vec<String>) {
        self.tables.write().bots.insert((user_id, channel_id), tokens);
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn file_by_id(&self, id: &str) -> Result<Option<FileMeta>> {
        Ok(self.tables.read().files.get(id).cloned())
    }

    async fn session_by_hash(&self, hash: &str) -> Result<Option<UserSession>> {
        Ok(self.tables.read().sessions.get(hash).cloned())
    }

    async fn bot_tokens(&self, user_id: i64, channel_id: i64) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .bots
            .get(&(user_id, channel_id))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn file(id: &str) -> FileMeta {
        FileMeta {
            id: id.to_string(),
            name: format!("{}.bin", id),
            mime_type: String::new(),
            size: 10,
            encrypted: false,
            channel_id: 100,
            updated_at: Utc::now(),
            parts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_file_lookup() {
        let store = MemoryStore::new();
        store.insert_file(file("a"));

        assert!(store.file_by_id("a").await.unwrap().is_some());
        assert!(store.file_by_id("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let snapshot = Snapshot {
            files: vec![file("a")],
            sessions: vec![SessionRow {
                hash: "h1".to_string(),
                user_id: 7,
                session: "1abc".to_string(),
            }],
            bot_tokens: vec![BotTokenRow {
                user_id: 7,
                channel_id: 100,
                tokens: vec!["111:aa".to_string()],
            }],
        };

        let store = MemoryStore::from_snapshot(snapshot);
        assert_eq!(store.session_by_hash("h1").await.unwrap().unwrap().user_id, 7);
        assert_eq!(store.bot_tokens(7, 100).await.unwrap().len(), 1);
        assert!(store.bot_tokens(8, 100).await.unwrap().is_empty());
    }
}
