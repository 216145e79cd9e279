//! Session codec
//!
//! Turns serialized session bytes into a cookie-safe string and back:
//!
//! ```text
//! plaintext ──► AES-GCM seal ──► nonce || ciphertext || tag ──► base64 ──► chunks
//! ```
//!
//! The AES variant follows the signing key length (16, 24 or 32 bytes). A fresh
//! random nonce is drawn for every seal, so sealing the same session twice never
//! yields the same cookie value.

use aws_lc_rs::aead::{
    Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_192_GCM, AES_256_GCM, NONCE_LEN,
};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

use crate::error::{Error, Result};

/// Largest value stored in a single cookie, leaving headroom for attributes
/// under the common 4096 byte per-cookie browser limit
pub const SESSION_COOKIE_MAX_SIZE: usize = 3584;

/// Upper bound on the number of chunk cookies accepted when reading.
/// Major browsers cap cookies per domain at about 180.
pub const MAX_SESSION_CHUNKS: usize = 180;

/// Reasons an encoded session cannot be opened
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not valid base64, with or without padding
    #[error("unable to decode session data: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Shorter than a nonce
    #[error("session data is truncated")]
    Truncated,

    /// Authentication tag did not verify
    #[error("failed to decrypt session data")]
    Decrypt,
}

/// Authenticated encryption of session blobs
pub struct SessionCodec {
    key: LessSafeKey,
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("algorithm", self.key.algorithm())
            .finish()
    }
}

impl SessionCodec {
    /// Build a codec from the configured signing key
    pub fn new(signing_key: &[u8]) -> Result<Self> {
        let algorithm = match signing_key.len() {
            16 => &AES_128_GCM,
            24 => &AES_192_GCM,
            32 => &AES_256_GCM,
            n => {
                return Err(Error::Config(format!(
                    "signing key for sessions must be 16, 24 or 32 bytes long, got {n}"
                )))
            }
        };

        let key = UnboundKey::new(algorithm, signing_key)
            .map_err(|_| Error::Config("failed to initialize the session cipher".into()))?;

        Ok(Self {
            key: LessSafeKey::new(key),
        })
    }

    /// Encrypt and encode `plaintext`
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        aws_lc_rs::rand::fill(&mut nonce)
            .map_err(|_| Error::Session("random number generator failed".into()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Session("failed to encrypt session data".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&in_out);
        Ok(STANDARD.encode(sealed))
    }

    /// Decode and decrypt a value produced by [`SessionCodec::seal`]
    pub fn open(&self, encoded: &str) -> std::result::Result<Vec<u8>, CodecError> {
        // Older cookie specs disallow '=', so padding may have been trimmed
        let mut sealed = match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => STANDARD_NO_PAD.decode(encoded)?,
        };

        if sealed.len() < NONCE_LEN {
            return Err(CodecError::Truncated);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);

        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut sealed[NONCE_LEN..],
            )
            .map_err(|_| CodecError::Decrypt)?;

        Ok(plaintext.to_vec())
    }
}

/// Split an encoded session into cookie sized pieces, preserving order
pub fn split_chunks(encoded: &str, chunk_size: usize) -> Vec<&str> {
    if encoded.len() <= chunk_size {
        return vec![encoded];
    }

    // base64 output is ASCII so byte offsets are char boundaries
    encoded
        .as_bytes()
        .chunks(chunk_size)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_16: &[u8] = b"meshview67890123";

    #[test]
    fn test_seal_open_roundtrip_for_all_key_sizes() {
        for key in [&b"a".repeat(16), &b"b".repeat(24), &b"c".repeat(32)] {
            let codec = SessionCodec::new(key).unwrap();
            let sealed = codec.seal(b"{\"payload\":\"x\"}").unwrap();
            assert_eq!(codec.open(&sealed).unwrap(), b"{\"payload\":\"x\"}");
        }
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let err = SessionCodec::new(b"short").unwrap_err();
        assert!(err.to_string().contains("16, 24 or 32"));
    }

    #[test]
    fn test_seal_uses_fresh_nonce() {
        let codec = SessionCodec::new(KEY_16).unwrap();
        assert_ne!(codec.seal(b"same").unwrap(), codec.seal(b"same").unwrap());
    }

    #[test]
    fn test_open_accepts_unpadded_base64() {
        let codec = SessionCodec::new(KEY_16).unwrap();
        let sealed = codec.seal(b"padding test!").unwrap();
        let trimmed = sealed.trim_end_matches('=');
        assert_eq!(codec.open(trimmed).unwrap(), b"padding test!");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let codec = SessionCodec::new(KEY_16).unwrap();
        let sealed = codec.seal(b"secret").unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            codec.open(&STANDARD.encode(bytes)),
            Err(CodecError::Decrypt)
        ));
    }

    #[test]
    fn test_open_rejects_other_key() {
        let sealed = SessionCodec::new(KEY_16).unwrap().seal(b"secret").unwrap();
        let other = SessionCodec::new(b"another-key-1234").unwrap();
        assert!(matches!(other.open(&sealed), Err(CodecError::Decrypt)));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let codec = SessionCodec::new(KEY_16).unwrap();
        assert!(matches!(codec.open("!!!"), Err(CodecError::Base64(_))));
        assert!(matches!(codec.open("AAAA"), Err(CodecError::Truncated)));
    }

    #[test]
    fn test_split_chunks_is_lossless() {
        assert_eq!(split_chunks("abc", 10), vec!["abc"]);
        assert_eq!(split_chunks("abcdefgh", 4), vec!["abcd", "efgh"]);
        assert_eq!(split_chunks("abcdefghi", 4), vec!["abcd", "efgh", "i"]);

        let long = "x".repeat(SESSION_COOKIE_MAX_SIZE * 2 + 5);
        let chunks = split_chunks(&long, SESSION_COOKIE_MAX_SIZE);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), long);
    }
}
