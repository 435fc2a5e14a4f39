//! Decrypting multi-part reader.
//!
//! Same surface as [`LinearReader`](crate::reader::LinearReader) but every
//! part is an independent ciphertext (see [`crate::crypto`]). For a window
//! `[start, end]` within a part the reader fetches the 64 KiB-block-aligned
//! ciphertext covering it, joins the keystream at the first block, discards
//! the lead-in and emits at most the window. No cipher state crosses parts.
//!
//! When a window covers a whole part the read also spans the trailing tag,
//! which is then verified; ranged reads inside a part skip verification
//! rather than inventing per-block tag semantics.

use crate::crypto::{encrypted_size, PartCipher, BLOCK_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::reader::{ChunkSource, Part, TgReader};
use bytes::Bytes;
use poly1305::universal_hash::UniversalHash;
use poly1305::Poly1305;

struct VerifyState {
    mac: Poly1305,
    tag: Vec<u8>,
}

/// Decrypting stream over one part's window.
struct PartStream {
    inner: TgReader,
    cipher: PartCipher,
    /// Absolute ciphertext offset of the next byte arriving from `inner`
    cipher_pos: i64,
    /// Ciphertext bytes before the trailing tag
    data_len: i64,
    /// Plaintext bytes to discard ahead of the window
    skip: i64,
    /// Window bytes still to emit
    window_remaining: i64,
    /// Present when the window covers the whole part
    verify: Option<VerifyState>,
}

impl PartStream {
    fn open(part: &Part, encryption_key: &str) -> Result<Self> {
        let salt_hex = part
            .salt
            .as_deref()
            .ok_or_else(|| Error::Decryption("encrypted part is missing its salt".to_string()))?;
        let salt = hex::decode(salt_hex)
            .map_err(|e| Error::Decryption(format!("invalid part salt: {}", e)))?;
        let cipher = PartCipher::new(encryption_key, &salt)?;

        let whole = part.is_whole();
        let first_block = part.start / BLOCK_SIZE;
        let cipher_start = first_block * BLOCK_SIZE;
        let cipher_end = if whole {
            encrypted_size(part.size)
        } else {
            ((part.end + BLOCK_SIZE) / BLOCK_SIZE * BLOCK_SIZE).min(part.size)
        };

        let verify = if whole {
            Some(VerifyState {
                mac: cipher.tag_hasher(),
                tag: Vec::with_capacity(TAG_SIZE as usize),
            })
        } else {
            None
        };

        Ok(PartStream {
            inner: TgReader::new(part.location.clone(), cipher_start, cipher_end - cipher_start),
            cipher,
            cipher_pos: cipher_start,
            data_len: part.size,
            skip: part.start - cipher_start,
            window_remaining: part.window_len(),
            verify,
        })
    }

    async fn next<S: ChunkSource>(&mut self, source: &S) -> Result<Option<Bytes>> {
        loop {
            // Without a tag to drain, stop as soon as the window is served
            if self.window_remaining <= 0 && self.verify.is_none() {
                return Ok(None);
            }

            let chunk = match self.inner.next_chunk(source).await? {
                Some(chunk) => chunk,
                None => {
                    if let Some(state) = self.verify.take() {
                        if state.tag.len() != TAG_SIZE as usize {
                            return Err(Error::Decryption(
                                "part authenticator is truncated".to_string(),
                            ));
                        }
                        if state.mac.finalize().as_slice() != state.tag.as_slice() {
                            return Err(Error::Decryption(
                                "part authentication failed".to_string(),
                            ));
                        }
                    }
                    return Ok(None);
                }
            };

            let chunk_start = self.cipher_pos;
            self.cipher_pos += chunk.len() as i64;

            // Bytes of this chunk belonging to the data region vs the tag
            let data_in_chunk = (self.data_len - chunk_start).clamp(0, chunk.len() as i64) as usize;

            if let Some(state) = self.verify.as_mut() {
                // Tag runs over the ciphertext; intermediate chunks are
                // block-aligned so padded updates compose correctly
                state.mac.update_padded(&chunk[..data_in_chunk]);
                state.tag.extend_from_slice(&chunk[data_in_chunk..]);
            }

            let mut buf = chunk[..data_in_chunk].to_vec();
            if !buf.is_empty() {
                self.cipher.apply_at(chunk_start as u64, &mut buf)?;
            }

            let mut out: &[u8] = &buf;
            if self.skip > 0 {
                let discard = self.skip.min(out.len() as i64) as usize;
                out = &out[discard..];
                self.skip -= discard as i64;
            }
            let take = self.window_remaining.clamp(0, out.len() as i64) as usize;
            self.window_remaining -= take as i64;

            if take > 0 {
                return Ok(Some(Bytes::copy_from_slice(&out[..take])));
            }
        }
    }
}

/// Sequential decrypting byte stream over the selected windows of an
/// encrypted file's parts.
pub struct DecryptedReader<S: ChunkSource> {
    source: S,
    parts: Vec<Part>,
    encryption_key: String,
    pos: usize,
    current: Option<PartStream>,
    remaining: i64,
}

impl<S: ChunkSource> DecryptedReader<S> {
    /// Build a reader over `parts` (windows set by the locator) delivering
    /// `content_length` plaintext bytes.
    pub fn new(source: S, parts: Vec<Part>, content_length: i64, encryption_key: String) -> Self {
        DecryptedReader {
            source,
            parts,
            encryption_key,
            pos: 0,
            current: None,
            remaining: content_length.max(0),
        }
    }

    /// Next plaintext chunk, or `None` when `content_length` bytes have been
    /// delivered.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.remaining <= 0 {
                return Ok(None);
            }

            if self.current.is_none() {
                let part = match self.parts.get(self.pos) {
                    Some(part) => part,
                    None => return Err(Error::UnexpectedEof),
                };
                if part.window_len() <= 0 {
                    self.pos += 1;
                    continue;
                }
                // Fresh cipher per part; the previous part's stream is
                // already closed by this point
                self.current = Some(PartStream::open(part, &self.encryption_key)?);
            }

            if let Some(stream) = self.current.as_mut() {
                match stream.next(&self.source).await? {
                    Some(mut chunk) => {
                        if (chunk.len() as i64) > self.remaining {
                            chunk = chunk.slice(..self.remaining as usize);
                        }
                        self.remaining -= chunk.len() as i64;
                        return Ok(Some(chunk));
                    }
                    None => {
                        self.current = None;
                        self.pos += 1;
                    }
                }
            }
        }
    }

    /// Release the current part stream.
    pub fn close(&mut self) {
        self.current = None;
    }
}
