//! Stable hashing of configuration objects.
//!
//! Hashes must be reproducible across processes and platforms: they key
//! experiment compatibility checks in storage, so `std::hash` (randomized,
//! unspecified across releases) is not an option.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a canonical JSON rendering.
///
/// `serde_json` maps are sorted by key, so serializing a `Value` built from
/// ordered maps yields a canonical byte stream.
pub fn json_hash_hex(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex_digest(hasher)
}

/// SHA-256 hex digest over a pre-sorted sequence of string parts.
pub fn parts_hash_hex<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
