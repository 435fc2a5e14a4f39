//! Seekable per-part cipher.
//!
//! Keystream block 0 is reserved: its first 32 bytes key the Poly1305
//! authenticator, so plaintext byte `p` maps to keystream byte `64 + p`.
//! Block `k` of the plaintext therefore starts at keystream offset
//! `64 + k * BLOCK_SIZE`, which is what lets a reader join the stream at any
//! block boundary.

use crate::crypto::kdf::derive_part_secret;
use crate::error::{Error, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{Key, XChaCha20, XNonce};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::Poly1305;
use zeroize::Zeroizing;

/// Keystream bytes reserved ahead of the data (one ChaCha block).
const KEYSTREAM_PREFIX: u64 = 64;

/// Cipher state for one part, positioned with [`PartCipher::apply_at`].
pub struct PartCipher {
    cipher: XChaCha20,
    poly_key: Zeroizing<[u8; 32]>,
}

impl PartCipher {
    /// Derive the cipher for a part from the process secret and its salt.
    pub fn new(encryption_key: &str, salt: &[u8]) -> Result<Self> {
        let secret = derive_part_secret(encryption_key, salt)?;
        let mut cipher = XChaCha20::new(
            Key::from_slice(secret.key()),
            XNonce::from_slice(secret.nonce()),
        );

        let mut poly_key = Zeroizing::new([0u8; 32]);
        cipher.apply_keystream(poly_key.as_mut());

        Ok(PartCipher { cipher, poly_key })
    }

    /// XOR the keystream for ciphertext offset `offset` into `buf`.
    ///
    /// Encryption and decryption are the same operation.
    pub fn apply_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.cipher
            .try_seek(KEYSTREAM_PREFIX + offset)
            .map_err(|_| Error::Decryption("keystream position out of range".to_string()))?;
        self.cipher.apply_keystream(buf);
        Ok(())
    }

    /// Fresh Poly1305 state keyed for this part's trailing tag.
    ///
    /// Feed the ciphertext through `update_padded` in order; intermediate
    /// chunks must be multiples of 16 bytes (block-aligned reads are).
    pub fn tag_hasher(&self) -> Poly1305 {
        Poly1305::new(poly1305::Key::from_slice(self.poly_key.as_ref()))
    }
}

/// Encrypt a whole part: `ciphertext || tag`.
///
/// This is the framing the (external) upload path persists; it lives here so
/// the read path and its tests share one definition.
pub fn encrypt_part(encryption_key: &str, salt: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut cipher = PartCipher::new(encryption_key, salt)?;

    let mut out = plaintext.to_vec();
    cipher.apply_at(0, &mut out)?;

    let mut mac = cipher.tag_hasher();
    mac.update_padded(&out);
    let tag = mac.finalize();
    out.extend_from_slice(&tag);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypted_size, encrypted_size, SALT_SIZE, TAG_SIZE};

    const KEY: &str = "test-encryption-key";

    fn salt() -> [u8; SALT_SIZE] {
        [0x24u8; SALT_SIZE]
    }

    fn sample(len: usize) -> Vec<u8> {
        // Deterministic non-repeating filler
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn decrypt_whole(ciphertext: &[u8]) -> Vec<u8> {
        let data_len = decrypted_size(ciphertext.len() as i64).unwrap() as usize;
        let mut cipher = PartCipher::new(KEY, &salt()).unwrap();

        let mut mac = cipher.tag_hasher();
        mac.update_padded(&ciphertext[..data_len]);
        assert_eq!(mac.finalize().as_slice(), &ciphertext[data_len..]);

        let mut out = ciphertext[..data_len].to_vec();
        cipher.apply_at(0, &mut out).unwrap();
        out
    }

    #[test]
    fn test_roundtrip() {
        let plain = sample(100_000);
        let encrypted = encrypt_part(KEY, &salt(), &plain).unwrap();

        assert_eq!(encrypted.len() as i64, encrypted_size(plain.len() as i64));
        assert_eq!(decrypt_whole(&encrypted), plain);
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let plain = sample(4096);
        let encrypted = encrypt_part(KEY, &salt(), &plain).unwrap();
        assert_ne!(&encrypted[..plain.len()], plain.as_slice());
    }

    #[test]
    fn test_deterministic_per_salt() {
        let plain = sample(1000);
        let a = encrypt_part(KEY, &salt(), &plain).unwrap();
        let b = encrypt_part(KEY, &salt(), &plain).unwrap();
        assert_eq!(a, b);

        let other = encrypt_part(KEY, &[9u8; SALT_SIZE], &plain).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_seek_matches_sequential() {
        let plain = sample(200_000);
        let encrypted = encrypt_part(KEY, &salt(), &plain).unwrap();

        // Decrypt an interior window by seeking straight to it
        let (start, len) = (65_530usize, 1_000usize);
        let mut window = encrypted[start..start + len].to_vec();
        let mut cipher = PartCipher::new(KEY, &salt()).unwrap();
        cipher.apply_at(start as u64, &mut window).unwrap();

        assert_eq!(window, &plain[start..start + len]);
    }

    #[test]
    fn test_tag_detects_corruption() {
        let plain = sample(5000);
        let mut encrypted = encrypt_part(KEY, &salt(), &plain).unwrap();
        encrypted[123] ^= 0x01;

        let data_len = (encrypted.len() as i64 - TAG_SIZE) as usize;
        let cipher = PartCipher::new(KEY, &salt()).unwrap();
        let mut mac = cipher.tag_hasher();
        mac.update_padded(&encrypted[..data_len]);
        assert_ne!(mac.finalize().as_slice(), &encrypted[data_len..]);
    }

    #[test]
    fn test_empty_part() {
        let encrypted = encrypt_part(KEY, &salt(), &[]).unwrap();
        assert_eq!(encrypted.len() as i64, TAG_SIZE);
        assert_eq!(decrypt_whole(&encrypted), Vec::<u8>::new());
    }
}
