//! File metadata types.
//!
//! A file is an ordered sequence of parts, each stored as one document
//! message in a Telegram channel. Descriptors are written by the (external)
//! upload path and are immutable for the lifetime of a read.

mod store;

pub use store::{BotTokenRow, MemoryStore, MetaStore, SessionRow, Snapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored segment of a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartMeta {
    /// Message id carrying this part's document
    pub id: i32,

    /// Hex-encoded 16-byte salt (present iff the file is encrypted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// File descriptor as served to the streaming core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    /// Opaque file id
    pub id: String,

    /// File name
    pub name: String,

    /// MIME type ("" falls back to application/octet-stream when serving)
    #[serde(default)]
    pub mime_type: String,

    /// Total logical size in bytes
    pub size: i64,

    /// Whether parts are stored encrypted
    #[serde(default)]
    pub encrypted: bool,

    /// Channel the parts live in
    pub channel_id: i64,

    /// Last modification time
    pub updated_at: DateTime<Utc>,

    /// Ordered parts; concatenated plaintext payloads equal the file
    #[serde(default)]
    pub parts: Vec<PartMeta>,
}

/// An authenticated user session row, looked up by its hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// Owning user id
    pub user_id: i64,

    /// Encoded Telegram session string
    pub session: String,
}
