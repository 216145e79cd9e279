//! Proof Key for Code Exchange (RFC 7636) and random login values

use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;

/// Length of generated code verifiers
pub const CODE_VERIFIER_LEN: usize = 43;

/// Characters allowed in a code verifier
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_from(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Fresh code verifier
pub fn code_verifier() -> String {
    random_from(UNRESERVED, CODE_VERIFIER_LEN)
}

/// S256 challenge for `verifier`
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, verifier.as_bytes()).as_ref())
}

/// Random alphanumeric string
pub fn random_alphanumeric(len: usize) -> String {
    random_from(ALPHANUMERIC, len)
}
