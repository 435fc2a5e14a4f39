//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by the streaming core.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be read or parsed
    #[error("config error: {0}")]
    Config(String),

    /// Configuration is structurally valid but unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Telegram RPC failed with a non-retryable error
    #[error("telegram error: {0}")]
    Telegram(String),

    /// Backend asked us to back off for the given number of seconds
    #[error("flood wait: {0}s")]
    FloodWait(u32),

    /// Transient transport failure (reconnect or retry may help)
    #[error("transport error: {0}")]
    Transport(String),

    /// The cached file reference is stale and must be re-resolved
    #[error("file reference expired")]
    FileReferenceExpired,

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Ciphertext was malformed or failed authentication
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata store failure
    #[error("metadata store error: {0}")]
    Store(String),

    /// No usable worker could be produced for the request
    #[error("worker unavailable: {0}")]
    Worker(String),

    /// The backend returned fewer bytes than the part claims to hold
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

pub type Result<T> = std::result::Result<T, Error>;
