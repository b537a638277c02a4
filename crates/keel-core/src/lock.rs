//! Lock key derivation.
//!
//! Advisory locks in the store are keyed by a signed 64-bit integer, so
//! resource names are hashed down to that width. Two unrelated names collide
//! with probability about n²/2⁶⁵ for n live resources: negligible, but not
//! zero. The risk is accepted rather than guarded by a second lookup.

use sha2::{Digest, Sha256};

/// Hash a resource name to the first 8 bytes of its SHA-256 digest.
pub fn lock_key(resource: &str) -> i64 {
    let digest = Sha256::digest(resource.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
