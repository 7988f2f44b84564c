//! The obfs2 keyed digest: `SHA256(key || msg || key)`.
//!
//! Predates HMAC in the protocol lineage and is kept for wire
//! compatibility; everything newer uses [`HmacSha256`](super::HmacSha256).

use sha2::{Digest, Sha256};

pub const DIGEST_LENGTH: usize = 32;

/// Computes `SHA256(key || msg || key)`.
pub fn obfs2_mac(key: &[u8], msg: &[u8]) -> [u8; DIGEST_LENGTH] {
    let mut h = Sha256::new();
    h.update(key);
    h.update(msg);
    h.update(key);
    h.finalize().into()
}
