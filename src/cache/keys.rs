//! Cache key derivation.
//!
//! A stored response is addressed by the hash of its normalized URL, optionally
//! suffixed with a variant key computed from the policy chain's fragments.

use sha2::{Digest, Sha256};

/// Number of digest bytes kept for URL hashes and variant keys (128 bits).
const KEY_BYTES: usize = 16;

/// Hash a normalized `scheme://host/path` URL into its primary cache key.
pub fn url_hash(full_url: &str) -> String {
    let digest = Sha256::digest(full_url.as_bytes());
    hex::encode(&digest[..KEY_BYTES])
}

/// Fold policy fragments into a variant key.
///
/// Fragments are positional: each one is length-prefixed before hashing so
/// that `["a", ""]` and `["", "a"]` never collide. When no fragment carries
/// any content the canonical empty key is returned instead of a digest.
pub fn variant_key<I, S>(fragments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    let mut meaningful = false;

    for fragment in fragments {
        let fragment = fragment.as_ref();
        meaningful |= !fragment.is_empty();
        hasher.update((fragment.len() as u64).to_le_bytes());
        hasher.update(fragment.as_bytes());
    }

    if !meaningful {
        return String::new();
    }

    let digest = hasher.finalize();
    hex::encode(&digest[..KEY_BYTES])
}

/// Compose the store key for a URL hash and variant key.
pub fn entry_key(url_hash: &str, variant_key: &str) -> String {
    if variant_key.is_empty() {
        url_hash.to_string()
    } else {
        format!("{url_hash}-{variant_key}")
    }
}
