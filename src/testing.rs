//! Test doubles shared across the crate's test modules.
//!
//! [`FakeBackend`] stands in for the message store: documents keyed by
//! message id, served through the same aligned-read contract the real
//! backend enforces (the alignment rules are asserted on every request).
//! [`FakeConnector`] plugs it into the worker pool so the full HTTP path
//! runs without a network.

use crate::crypto::decrypted_size;
use crate::error::{Error, Result};
use crate::metadata::FileMeta;
use crate::reader::{ChunkSource, Location, Part};
use crate::telegram::pool::Connector;
use crate::telegram::REQUEST_ALIGN;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One recorded chunk request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkRequest {
    pub message_id: i32,
    pub offset: i64,
    pub limit: i32,
}

/// In-memory document store.
pub(crate) struct FakeBackend {
    docs: Mutex<HashMap<i32, Bytes>>,
    pub requests: Mutex<Vec<ChunkRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        FakeBackend {
            docs: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn insert_doc(&self, message_id: i32, data: Vec<u8>) {
        self.docs.lock().insert(message_id, Bytes::from(data));
    }

    /// Flip one bit of a stored document.
    pub fn corrupt_doc(&self, message_id: i32, at: usize) {
        let mut docs = self.docs.lock();
        if let Some(doc) = docs.get(&message_id) {
            let mut data = doc.to_vec();
            data[at] ^= 0x01;
            docs.insert(message_id, Bytes::from(data));
        }
    }

    pub fn doc_len(&self, message_id: i32) -> usize {
        self.docs.lock().get(&message_id).map(|d| d.len()).unwrap_or(0)
    }
}

/// Connection handle over a [`FakeBackend`].
#[derive(Clone)]
pub(crate) struct FakeConn {
    pub backend: Arc<FakeBackend>,
    #[allow(dead_code)]
    pub token: String,
}

/// Borrow a connection for tests that drive readers directly.
pub(crate) fn fake_conn(backend: &Arc<FakeBackend>) -> FakeConn {
    FakeConn {
        backend: backend.clone(),
        token: String::new(),
    }
}

#[async_trait]
impl ChunkSource for FakeConn {
    async fn chunk(&self, location: &Location, offset: i64, limit: i32) -> Result<Bytes> {
        assert!(limit > 0, "non-positive limit {}", limit);
        assert!(offset >= 0, "negative offset {}", offset);
        assert_eq!(limit as i64 % REQUEST_ALIGN, 0, "limit {} unaligned", limit);
        assert_eq!(offset % limit as i64, 0, "offset {} unaligned to {}", offset, limit);

        self.backend.requests.lock().push(ChunkRequest {
            message_id: location.message_id,
            offset,
            limit,
        });

        let docs = self.backend.docs.lock();
        let doc = docs
            .get(&location.message_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", location.message_id)))?;

        let start = (offset as usize).min(doc.len());
        let end = (start + limit as usize).min(doc.len());
        Ok(doc.slice(start..end))
    }

    async fn refresh(&self, location: &Location) -> Result<Location> {
        Ok(location.clone())
    }
}

#[async_trait]
impl crate::telegram::fetcher::PartFetcher for FakeConn {
    async fn file_parts(&self, file: &FileMeta) -> Result<Vec<Part>> {
        file.parts
            .iter()
            .map(|meta| {
                let stored = self.backend.doc_len(meta.id) as i64;
                let size = if file.encrypted {
                    decrypted_size(stored)?
                } else {
                    stored
                };
                Ok(Part::new(
                    Location {
                        channel_id: file.channel_id,
                        access_hash: 0,
                        message_id: meta.id,
                        document_id: meta.id as i64,
                        document_access_hash: 0,
                        file_reference: Vec::new(),
                    },
                    size,
                    meta.salt.clone(),
                ))
            })
            .collect()
    }
}

/// A plaintext part whose document is `size` bytes.
pub(crate) fn plain_part(message_id: i32, size: i64) -> Part {
    Part::new(
        Location {
            channel_id: 1,
            access_hash: 0,
            message_id,
            document_id: message_id as i64,
            document_access_hash: 0,
            file_reference: Vec::new(),
        },
        size,
        None,
    )
}

/// An encrypted part with `size` plaintext bytes and a hex salt.
pub(crate) fn encrypted_part(message_id: i32, size: i64, salt: String) -> Part {
    Part::new(
        Location {
            channel_id: 1,
            access_hash: 0,
            message_id,
            document_id: message_id as i64,
            document_access_hash: 0,
            file_reference: Vec::new(),
        },
        size,
        Some(salt),
    )
}

/// Connector handing out [`FakeConn`] workers.
pub(crate) struct FakeConnector {
    pub backend: Arc<FakeBackend>,
    pub connects: Arc<AtomicUsize>,
    failing: Mutex<HashSet<String>>,
}

impl FakeConnector {
    pub fn new(backend: Arc<FakeBackend>) -> Self {
        FakeConnector {
            backend,
            connects: Arc::new(AtomicUsize::new(0)),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make sign-in fail for a token.
    pub fn fail_token(&self, token: &str) {
        self.failing.lock().insert(token.to_string());
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeConn;

    async fn connect_bot(&self, token: &str) -> Result<FakeConn> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(token) {
            return Err(Error::Telegram("bot sign-in failed".to_string()));
        }
        Ok(FakeConn {
            backend: self.backend.clone(),
            token: token.to_string(),
        })
    }

    async fn connect_user(&self, session: &str) -> Result<FakeConn> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConn {
            backend: self.backend.clone(),
            token: format!("user:{}", session),
        })
    }
}
