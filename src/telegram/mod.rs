//! Telegram backend plumbing.
//!
//! Long-lived authenticated clients, the per-channel worker pool that rotates
//! them, message/channel resolution and the session-string codec. All raw TL
//! invocations live under this module; the readers upstream only ever see the
//! [`ChunkSource`](crate::reader::ChunkSource) seam.

pub mod backoff;
pub mod client;
pub mod fetcher;
pub mod pool;
pub mod session;

pub use client::StreamClient;
pub use fetcher::PartFetcher;
pub use pool::{Connector, StreamWorker, TgConnector, WorkerLease};

/// Largest aligned request issued against upload.getFile (1 MiB).
pub const MAX_CHUNK_SIZE: i64 = 1024 * 1024;

/// Offset/limit granularity required by upload.getFile.
pub const REQUEST_ALIGN: i64 = 4096;

/// Maximum message ids per channels.getMessages call.
pub const MESSAGE_FETCH_BATCH: usize = 200;
