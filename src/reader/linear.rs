//! Plaintext multi-part reader.

use crate::error::{Error, Result};
use crate::reader::{ChunkSource, Part, TgReader};
use bytes::Bytes;

/// Sequential byte stream over the selected windows of a file's parts.
///
/// Bytes come out in file order; the stream ends exactly after
/// `content_length` bytes. Dropping the reader releases the current part
/// stream and the worker lease it was built on.
pub struct LinearReader<S: ChunkSource> {
    source: S,
    parts: Vec<Part>,
    pos: usize,
    current: Option<TgReader>,
    remaining: i64,
}

impl<S: ChunkSource> LinearReader<S> {
    /// Build a reader over `parts` (with windows set by the locator) that
    /// delivers `content_length` bytes.
    pub fn new(source: S, parts: Vec<Part>, content_length: i64) -> Self {
        LinearReader {
            source,
            parts,
            pos: 0,
            current: None,
            remaining: content_length.max(0),
        }
    }

    /// Next chunk of the stream, or `None` when `content_length` bytes have
    /// been delivered.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.remaining <= 0 {
                return Ok(None);
            }

            if self.current.is_none() {
                let part = match self.parts.get(self.pos) {
                    Some(part) => part,
                    // Parts exhausted while bytes are still owed
                    None => return Err(Error::UnexpectedEof),
                };
                if part.window_len() <= 0 {
                    self.pos += 1;
                    continue;
                }
                self.current = Some(TgReader::new(
                    part.location.clone(),
                    part.start,
                    part.window_len(),
                ));
            }

            if let Some(reader) = self.current.as_mut() {
                match reader.next_chunk(&self.source).await? {
                    Some(mut chunk) => {
                        if (chunk.len() as i64) > self.remaining {
                            chunk = chunk.slice(..self.remaining as usize);
                        }
                        self.remaining -= chunk.len() as i64;
                        return Ok(Some(chunk));
                    }
                    None => {
                        // Close the finished part stream before opening the next
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ranged_parts;
    use crate::testing::{fake_conn, FakeBackend};
    use std::sync::Arc;

    async fn read_all<S: ChunkSource>(reader: &mut LinearReader<S>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn backend_with_parts(sizes: &[usize]) -> (Arc<FakeBackend>, Vec<Part>, Vec<u8>) {
        let backend = Arc::new(FakeBackend::new());
        let mut parts = Vec::new();
        let mut file = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let id = (i + 1) as i32;
            let data: Vec<u8> = (0..size).map(|b| ((b + i * 97) % 251) as u8).collect();
            file.extend_from_slice(&data);
            backend.insert_doc(id, data);
            parts.push(crate::testing::plain_part(id, size as i64));
        }
        (backend, parts, file)
    }

    #[tokio::test]
    async fn test_full_file() {
        let (backend, parts, file) = backend_with_parts(&[40, 30, 30]);
        let selected = ranged_parts(&parts, 0, 99);

        let mut reader = LinearReader::new(fake_conn(&backend), selected, 100);
        assert_eq!(read_all(&mut reader).await.unwrap(), file);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_within_one_part() {
        let (backend, parts, file) = backend_with_parts(&[40, 30, 30]);
        let selected = ranged_parts(&parts, 50, 59);

        let mut reader = LinearReader::new(fake_conn(&backend), selected, 10);
        assert_eq!(read_all(&mut reader).await.unwrap(), &file[50..60]);
    }

    #[tokio::test]
    async fn test_range_spanning_parts() {
        let (backend, parts, file) = backend_with_parts(&[40, 30, 30]);
        let selected = ranged_parts(&parts, 35, 75);

        let mut reader = LinearReader::new(fake_conn(&backend), selected, 41);
        assert_eq!(read_all(&mut reader).await.unwrap(), &file[35..76]);
    }

    #[tokio::test]
    async fn test_large_parts_page_in_order() {
        let (backend, parts, file) = backend_with_parts(&[3_000_000, 2_500_000]);
        let selected = ranged_parts(&parts, 1_000_000, 4_000_000);

        let mut reader = LinearReader::new(fake_conn(&backend), selected, 3_000_001);
        assert_eq!(read_all(&mut reader).await.unwrap(), &file[1_000_000..4_000_001]);

        // Paged in several aligned requests, never out of alignment
        let requests = backend.requests.lock();
        assert!(requests.len() > 2);
        assert!(requests
            .iter()
            .all(|r| r.offset % r.limit as i64 == 0 && r.message_id > 0));
    }

    #[tokio::test]
    async fn test_empty_range() {
        let (backend, _, _) = backend_with_parts(&[40]);
        let mut reader = LinearReader::new(fake_conn(&backend), Vec::new(), 0);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_parts_surface_error() {
        let (backend, mut parts, _) = backend_with_parts(&[40]);
        // Claim more bytes than the stored document holds
        parts[0].size = 60;
        parts[0].end = 59;

        let mut reader = LinearReader::new(fake_conn(&backend), parts, 60);
        assert!(matches!(read_all(&mut reader).await, Err(Error::UnexpectedEof)));
    }
}
