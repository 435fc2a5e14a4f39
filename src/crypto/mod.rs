//! Part encryption primitives.
//!
//! Encrypted files are stored as independent per-part ciphertexts. Each part
//! is framed as `ciphertext || tag` where the ciphertext is an XChaCha20
//! stream (key and nonce derived from the process-wide secret and the part's
//! salt) and the tag is a trailing Poly1305 authenticator over the ciphertext.
//! There is no per-block overhead, so byte `p` of the plaintext lives at byte
//! `p` of the ciphertext and ranged reads can seek freely.

pub mod cipher;
pub mod kdf;

pub use cipher::{encrypt_part, PartCipher};
pub use kdf::derive_part_secret;

use crate::error::{Error, Result};

/// Cipher key size in bytes
pub const KEY_SIZE: usize = 32;

/// Per-part salt size in bytes
pub const SALT_SIZE: usize = 16;

/// XChaCha20 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Plaintext block granularity for ranged decryption (64 KiB)
pub const BLOCK_SIZE: i64 = 64 * 1024;

/// Trailing Poly1305 tag size in bytes
pub const TAG_SIZE: i64 = 16;

/// Ciphertext size of a part holding `size` plaintext bytes.
pub fn encrypted_size(size: i64) -> i64 {
    size + TAG_SIZE
}

/// Plaintext size of a part whose stored payload is `size` bytes.
pub fn decrypted_size(size: i64) -> Result<i64> {
    if size < TAG_SIZE {
        return Err(Error::Decryption(format!(
            "encrypted part too small: {} bytes",
            size
        )));
    }
    Ok(size - TAG_SIZE)
}
