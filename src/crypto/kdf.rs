//! Per-part key derivation.
//!
//! Maps the process-wide encryption secret and a part's 16-byte salt to the
//! part's cipher key and nonce with HKDF-SHA256. Derivation is deterministic,
//! so the read path and the (external) write path agree without any key
//! material being stored next to the data.

use crate::crypto::{KEY_SIZE, NONCE_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use ring::hkdf::{Salt, HKDF_SHA256};
use zeroize::Zeroizing;

/// Fixed HKDF info string; versioned so a future scheme change can re-derive.
const PART_SECRET_INFO: &[u8] = b"tgdrive-part-cipher-v1";

/// Derived cipher material for one part
pub struct PartSecret {
    key: Zeroizing<[u8; KEY_SIZE]>,
    nonce: [u8; NONCE_SIZE],
}

impl PartSecret {
    /// Cipher key bytes (zeroized on drop)
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Cipher nonce bytes
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
}

struct SecretLen;

impl ring::hkdf::KeyType for SecretLen {
    fn len(&self) -> usize {
        KEY_SIZE + NONCE_SIZE
    }
}

/// Derive the cipher key and nonce for a part from `(encryption_key, salt)`.
///
/// The salt must be exactly [`SALT_SIZE`] bytes.
pub fn derive_part_secret(encryption_key: &str, salt: &[u8]) -> Result<PartSecret> {
    if encryption_key.is_empty() {
        return Err(Error::KeyDerivation("encryption key is not set".to_string()));
    }
    if salt.len() != SALT_SIZE {
        return Err(Error::KeyDerivation(format!(
            "salt must be {} bytes, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let hkdf_salt = Salt::new(HKDF_SHA256, salt);
    let prk = hkdf_salt.extract(encryption_key.as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
    prk.expand(&[PART_SECRET_INFO], SecretLen)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
        .fill(okm.as_mut())
        .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&okm[..KEY_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&okm[KEY_SIZE..]);

    Ok(PartSecret { key, nonce })
}
