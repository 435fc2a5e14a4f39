//! Raw part reader.
//!
//! Streams one document's bytes starting at an arbitrary offset on top of the
//! backend's aligned read primitive: every request must use an offset
//! divisible by its limit and a limit divisible by 4096. The reader rounds
//! the first request down, discards the prefix, then pages forward in fixed
//! aligned steps. Upper layers only ever see arbitrary-offset streams.

use crate::error::{Error, Result};
use crate::reader::{ChunkSource, Location};
use crate::telegram::backoff::RetrySchedule;
use crate::telegram::{MAX_CHUNK_SIZE, REQUEST_ALIGN};
use bytes::Bytes;
use std::time::Duration;
use tracing::warn;

/// Retries for transient transport failures before surfacing the error.
const TRANSIENT_RETRIES: u32 = 3;

/// Delay before the first transient retry.
const RETRY_FIRST_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for transient-retry delays.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Byte stream over a single part's document.
///
/// Owns only the aligned cursor and the remaining-byte accounting; dropping
/// it cancels any in-flight backend call.
pub struct TgReader {
    location: Location,
    /// Next aligned offset to request
    pos: i64,
    /// Fixed aligned request size for this stream
    chunk_limit: i64,
    /// Bytes to discard from the front of the next response
    skip: usize,
    /// Bytes still owed to the caller
    remaining: i64,
    /// Whether the location was already refreshed once
    refreshed: bool,
}

impl TgReader {
    /// Stream `limit` bytes of `location`'s document starting at `offset`.
    pub fn new(location: Location, offset: i64, limit: i64) -> Self {
        let aligned = offset - offset % REQUEST_ALIGN;
        TgReader {
            location,
            pos: aligned,
            chunk_limit: request_size(aligned),
            skip: (offset - aligned) as usize,
            remaining: limit.max(0),
            refreshed: false,
        }
    }

    /// Fetch the next chunk of the stream, or `None` once `limit` bytes have
    /// been delivered.
    ///
    /// Flood waits sleep the advertised duration and retry indefinitely;
    /// transient transport errors retry up to [`TRANSIENT_RETRIES`] times
    /// with exponential backoff; an expired file reference is re-resolved
    /// once via the source. Everything else surfaces to the caller.
    pub async fn next_chunk<S: ChunkSource>(&mut self, source: &S) -> Result<Option<Bytes>> {
        if self.remaining <= 0 {
            return Ok(None);
        }

        let mut retries = RetrySchedule::new(RETRY_FIRST_DELAY, RETRY_MAX_DELAY, TRANSIENT_RETRIES);
        loop {
            match source
                .chunk(&self.location, self.pos, self.chunk_limit as i32)
                .await
            {
                Ok(bytes) => {
                    if bytes.len() <= self.skip {
                        // Document ended before the bytes we still owe
                        return Err(Error::UnexpectedEof);
                    }
                    self.pos += self.chunk_limit;

                    let mut chunk = bytes.slice(self.skip..);
                    self.skip = 0;
                    if (chunk.len() as i64) > self.remaining {
                        chunk = chunk.slice(..self.remaining as usize);
                    }
                    self.remaining -= chunk.len() as i64;
                    return Ok(Some(chunk));
                }
                Err(Error::FloodWait(seconds)) => {
                    warn!("flood wait: sleeping {}s before retrying", seconds);
                    tokio::time::sleep(Duration::from_secs(seconds as u64)).await;
                }
                Err(Error::Transport(message)) => match retries.next_delay() {
                    Some(delay) => {
                        warn!("transient read failure, retrying in {:?}: {}", delay, message);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(Error::Transport(message)),
                },
                Err(Error::FileReferenceExpired) if !self.refreshed => {
                    self.refreshed = true;
                    self.location = source.refresh(&self.location).await?;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Aligned request size for a stream starting at `aligned_offset`: the
/// largest power of two at most [`MAX_CHUNK_SIZE`] that divides the offset.
fn request_size(aligned_offset: i64) -> i64 {
    let mut limit = MAX_CHUNK_SIZE;
    while limit > REQUEST_ALIGN && aligned_offset % limit != 0 {
        limit /= 2;
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a single in-memory document, optionally failing from a script.
    struct Scripted {
        doc: Bytes,
        failures: Mutex<VecDeque<Error>>,
        refreshes: AtomicUsize,
        requests: Mutex<Vec<(i64, i32)>>,
    }

    impl Scripted {
        fn new(doc: Vec<u8>) -> Self {
            Scripted {
                doc: Bytes::from(doc),
                failures: Mutex::new(VecDeque::new()),
                refreshes: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn fail_next(&self, errors: Vec<Error>) {
            self.failures.lock().extend(errors);
        }
    }

    #[async_trait]
    impl ChunkSource for Scripted {
        async fn chunk(&self, _location: &Location, offset: i64, limit: i32) -> Result<Bytes> {
            assert!(limit > 0);
            assert_eq!(limit % REQUEST_ALIGN as i32, 0, "limit {} unaligned", limit);
            assert_eq!(offset % limit as i64, 0, "offset {} unaligned to {}", offset, limit);

            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.requests.lock().push((offset, limit));

            let start = (offset.max(0) as usize).min(self.doc.len());
            let end = (start + limit as usize).min(self.doc.len());
            Ok(self.doc.slice(start..end))
        }

        async fn refresh(&self, location: &Location) -> Result<Location> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(location.clone())
        }
    }

    fn location() -> Location {
        Location {
            channel_id: 1,
            access_hash: 0,
            message_id: 1,
            document_id: 1,
            document_access_hash: 0,
            file_reference: Vec::new(),
        }
    }

    fn doc(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn read_all<S: ChunkSource>(reader: &mut TgReader, source: &S) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk(source).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[test]
    fn test_request_size() {
        assert_eq!(request_size(0), MAX_CHUNK_SIZE);
        assert_eq!(request_size(MAX_CHUNK_SIZE), MAX_CHUNK_SIZE);
        assert_eq!(request_size(4096), 4096);
        assert_eq!(request_size(8192), 8192);
        assert_eq!(request_size(65536), 65536);
        assert_eq!(request_size(4096 * 3), 4096);
    }

    #[tokio::test]
    async fn test_reads_exact_window() {
        let data = doc(10_000);
        let source = Scripted::new(data.clone());

        let mut reader = TgReader::new(location(), 5000, 100);
        let got = read_all(&mut reader, &source).await.unwrap();

        assert_eq!(got, &data[5000..5100]);

        // One request, rounded down to the nearest aligned boundary
        let requests = source.requests.lock();
        assert_eq!(requests.as_slice(), &[(4096, 4096)]);
    }

    #[tokio::test]
    async fn test_pages_across_chunks() {
        let data = doc(20_000);
        let source = Scripted::new(data.clone());

        // Start offset 4096 keeps the request size small enough to page
        let mut reader = TgReader::new(location(), 4100, 9000);
        let got = read_all(&mut reader, &source).await.unwrap();

        assert_eq!(got, &data[4100..13_100]);

        let requests = source.requests.lock();
        assert_eq!(requests.as_slice(), &[(4096, 4096), (8192, 4096), (12_288, 4096)]);
    }

    #[tokio::test]
    async fn test_zero_offset_uses_max_chunk() {
        let data = doc(3000);
        let source = Scripted::new(data.clone());

        let mut reader = TgReader::new(location(), 0, 3000);
        let got = read_all(&mut reader, &source).await.unwrap();

        assert_eq!(got, data);
        assert_eq!(source.requests.lock().as_slice(), &[(0, MAX_CHUNK_SIZE as i32)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_retries() {
        let data = doc(2000);
        let source = Scripted::new(data.clone());
        source.fail_next(vec![Error::FloodWait(3)]);

        let mut reader = TgReader::new(location(), 0, 2000);
        let got = read_all(&mut reader, &source).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_then_succeeds() {
        let data = doc(2000);
        let source = Scripted::new(data.clone());
        source.fail_next(vec![
            Error::Transport("a".into()),
            Error::Transport("b".into()),
            Error::Transport("c".into()),
        ]);

        let mut reader = TgReader::new(location(), 0, 2000);
        let got = read_all(&mut reader, &source).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_exhausted() {
        let source = Scripted::new(doc(2000));
        source.fail_next(vec![
            Error::Transport("a".into()),
            Error::Transport("b".into()),
            Error::Transport("c".into()),
            Error::Transport("d".into()),
        ]);

        let mut reader = TgReader::new(location(), 0, 2000);
        assert!(matches!(
            reader.next_chunk(&source).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_reference_refreshes_once() {
        let data = doc(2000);
        let source = Scripted::new(data.clone());
        source.fail_next(vec![Error::FileReferenceExpired]);

        let mut reader = TgReader::new(location(), 0, 2000);
        let got = read_all(&mut reader, &source).await.unwrap();

        assert_eq!(got, data);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_reference_twice_surfaces() {
        let source = Scripted::new(doc(2000));
        source.fail_next(vec![Error::FileReferenceExpired, Error::FileReferenceExpired]);

        let mut reader = TgReader::new(location(), 0, 2000);
        assert!(matches!(
            reader.next_chunk(&source).await,
            Err(Error::FileReferenceExpired)
        ));
    }

    #[tokio::test]
    async fn test_truncated_document_is_an_error() {
        // Caller asks for more bytes than the document holds
        let source = Scripted::new(doc(1000));

        let mut reader = TgReader::new(location(), 0, 5000);
        let first = reader.next_chunk(&source).await.unwrap();
        assert_eq!(first.map(|b| b.len()), Some(1000));
        assert!(matches!(
            reader.next_chunk(&source).await,
            Err(Error::UnexpectedEof)
        ));
    }
}
