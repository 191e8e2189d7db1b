//! SHA-256 hashing helpers shared by the store (version chaining, etags) and
//! the token authorizer (capability token digests).

use sha2::{Digest, Sha256};

/// Lowercase hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The `sha256-<hex>` form used for `previous-hash` frontmatter values and
/// token records.
pub fn sha256_prefixed(bytes: &[u8]) -> String {
    format!("sha256-{}", sha256_hex(bytes))
}
