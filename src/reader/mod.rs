//! Byte-stream assembly over stored parts.
//!
//! Turns `(file, byte range)` into an ordered byte stream sourced from the
//! backend messages holding the file's parts:
//!
//! - the locator ([`ranged_parts`]) selects the parts a range touches and the
//!   window to read within each,
//! - [`TgReader`] streams one part's document with the backend's aligned-read
//!   primitive hidden behind it,
//! - [`LinearReader`] and [`DecryptedReader`] walk the selected parts in
//!   order, plain or with seekable per-part decryption.

pub mod decrypted;
pub mod linear;
pub mod tg;

pub use decrypted::DecryptedReader;
pub use linear::LinearReader;
pub use tg::TgReader;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Everything needed to read bytes from one part's document.
///
/// Becomes stale when the backend reports an expired file reference; the
/// reader then asks its source for a refreshed copy.
#[derive(Debug, Clone)]
pub struct Location {
    /// Channel the message lives in
    pub channel_id: i64,
    /// Channel access hash for this credential
    pub access_hash: i64,
    /// Message id carrying the document
    pub message_id: i32,
    /// Document id
    pub document_id: i64,
    /// Document access hash
    pub document_access_hash: i64,
    /// Opaque, expiring file reference
    pub file_reference: Vec<u8>,
}

/// A part resolved for reading
#[derive(Debug, Clone)]
pub struct Part {
    /// Where the bytes live
    pub location: Location,

    /// Plaintext size of this part in bytes
    pub size: i64,

    /// Hex-encoded salt (encrypted files only)
    pub salt: Option<String>,

    /// First byte of the requested window within this part
    pub start: i64,

    /// Last byte (inclusive) of the requested window within this part
    pub end: i64,
}

impl Part {
    /// A part with its window covering the whole part.
    pub fn new(location: Location, size: i64, salt: Option<String>) -> Self {
        Part {
            location,
            size,
            salt,
            start: 0,
            end: size - 1,
        }
    }

    /// Number of bytes the window selects.
    pub fn window_len(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Whether the window covers the entire part.
    pub fn is_whole(&self) -> bool {
        self.start == 0 && self.end == self.size - 1
    }
}

/// Provider of raw document bytes, one aligned request at a time.
///
/// Implemented by the worker client (and by its pool lease); the readers stay
/// agnostic of the transport so they can be driven by fakes in tests.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Read `limit` bytes of the document at `offset`.
    ///
    /// Both values must satisfy the backend's alignment rules (`offset`
    /// divisible by `limit`, `limit` divisible by 4096). Returns fewer bytes
    /// only at end of document.
    async fn chunk(&self, location: &Location, offset: i64, limit: i32) -> Result<Bytes>;

    /// Re-resolve a location whose file reference expired.
    async fn refresh(&self, location: &Location) -> Result<Location>;
}

/// Select the parts an absolute byte range `[start, end]` touches and set
/// each part's read window.
///
/// Concatenating the windows yields exactly `end - start + 1` bytes of file
/// content. A range on an empty part list (or an inverted range) selects
/// nothing.
pub fn ranged_parts(parts: &[Part], start: i64, end: i64) -> Vec<Part> {
    let mut selected = Vec::new();
    if start > end || start < 0 {
        return selected;
    }

    let mut acc = 0i64;
    for part in parts {
        let part_start = acc;
        let part_end = acc + part.size; // exclusive
        acc = part_end;

        if part.size == 0 || part_end <= start {
            continue;
        }
        if part_start > end {
            break;
        }

        let mut window = part.clone();
        window.start = (start - part_start).max(0);
        window.end = (end - part_start).min(part.size - 1);
        selected.push(window);
    }

    selected
}
