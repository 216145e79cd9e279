//! Values carried across the OpenID redirect and callback
//!
//! The browser keeps the raw nonce in a cookie. The provider only ever sees
//! its SHA-224 hash (as the `nonce` parameter) and a `state` that binds the
//! nonce to a timestamp and the server's signing key:
//!
//! ```text
//! state = hex(SHA-224(nonce + "+" + ts + "+" + signing_key)) + "-" + ts
//! ```

use aws_lc_rs::constant_time::verify_slices_are_equal;
use aws_lc_rs::digest::{digest, SHA224};
use chrono::{DateTime, Utc};

use crate::pkce::random_alphanumeric;

/// Length of the raw nonce kept in the cookie
pub const NONCE_LEN: usize = 15;

const STATE_TIME_FORMAT: &str = "%y%m%d%H%M%S";

/// Why a `state` parameter was refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    /// Not `<hash>-<timestamp>`
    #[error("state parameter is malformed")]
    Malformed,
    /// Hash does not match the nonce cookie and signing key
    #[error("state parameter does not match the login in progress")]
    Mismatch,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fresh raw nonce
pub fn new_nonce() -> String {
    random_alphanumeric(NONCE_LEN)
}

/// Nonce as sent to and echoed back by the provider
pub fn hashed_nonce(nonce: &str) -> String {
    hex(digest(&SHA224, nonce.as_bytes()).as_ref())
}

/// Timestamp component of a state value
pub fn state_timestamp(now: DateTime<Utc>) -> String {
    now.format(STATE_TIME_FORMAT).to_string()
}

/// State value for `nonce` issued at `timestamp`
pub fn make_state(nonce: &str, timestamp: &str, signing_key: &str) -> String {
    let input = format!("{nonce}+{timestamp}+{signing_key}");
    format!("{}-{timestamp}", hex(digest(&SHA224, input.as_bytes()).as_ref()))
}

/// Check a `state` returned by the provider against the nonce cookie
pub fn verify_state(state: &str, nonce: &str, signing_key: &str) -> Result<(), StateError> {
    let (hash, timestamp) = state.rsplit_once('-').ok_or(StateError::Malformed)?;
    if hash.is_empty() || timestamp.is_empty() {
        return Err(StateError::Malformed);
    }

    let expected = make_state(nonce, timestamp, signing_key);
    verify_slices_are_equal(expected.as_bytes(), state.as_bytes())
        .map_err(|_| StateError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "meshview67890123";

    #[test]
    fn test_state_round_trip() {
        let nonce = new_nonce();
        let ts = state_timestamp(Utc.with_ymd_and_hms(2021, 12, 1, 13, 5, 9).unwrap());
        assert_eq!(ts, "211201130509");

        let state = make_state(&nonce, &ts, KEY);
        assert!(state.ends_with("-211201130509"));
        assert_eq!(verify_state(&state, &nonce, KEY), Ok(()));
    }

    #[test]
    fn test_state_rejects_other_nonce_or_key() {
        let state = make_state("nonce-a", "211201130509", KEY);
        assert_eq!(
            verify_state(&state, "nonce-b", KEY),
            Err(StateError::Mismatch)
        );
        assert_eq!(
            verify_state(&state, "nonce-a", "another-key-1234"),
            Err(StateError::Mismatch)
        );
    }

    #[test]
    fn test_state_rejects_tampered_timestamp() {
        let state = make_state("n", "211201130509", KEY);
        let (hash, _) = state.rsplit_once('-').unwrap();
        let forged = format!("{hash}-211201130510");
        assert_eq!(verify_state(&forged, "n", KEY), Err(StateError::Mismatch));
    }

    #[test]
    fn test_state_rejects_malformed() {
        assert_eq!(verify_state("nodash", "n", KEY), Err(StateError::Malformed));
        assert_eq!(verify_state("hash-", "n", KEY), Err(StateError::Malformed));
        assert_eq!(verify_state("-123", "n", KEY), Err(StateError::Malformed));
    }

    #[test]
    fn test_hashed_nonce_is_sha224_hex() {
        let hashed = hashed_nonce("abc");
        assert_eq!(
            hashed,
            "23097d223405d8228642a477bda255b32aadbce4bda0b3f7e36c9da7"
        );
        assert_eq!(new_nonce().len(), NONCE_LEN);
    }
}
