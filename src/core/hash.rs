//! Challenge Hashing
//!
//! SHA-1 helpers for the garbage challenge:
//! - seed bases derived from a timestamp
//! - per-index digests `SHA1(base ∥ decimal(index))`

use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};

/// Digest output type (160 bits / 20 bytes).
pub type ChallengeHash = [u8; 20];

/// Length of a challenge digest in bytes.
pub const HASH_LEN: usize = 20;

/// Hash arbitrary bytes.
pub fn sha1_digest(bytes: &[u8]) -> ChallengeHash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    finish(hasher)
}

static BASE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derive a fresh 20-byte challenge base from the current time.
///
/// A process-wide counter keeps bases distinct within one clock tick.
pub fn fresh_base() -> ChallengeHash {
    let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    let seq = BASE_COUNTER.fetch_add(1, Ordering::Relaxed);
    sha1_digest(format!("{}#{}", stamp, seq).as_bytes())
}

/// Expected digest for response slot `index` of a challenge with `base`.
///
/// The index is appended as its decimal ASCII representation.
pub fn garbage_digest(base: &[u8], index: u32) -> ChallengeHash {
    let mut hasher = Sha1::new();
    hasher.update(base);
    hasher.update(index.to_string().as_bytes());
    finish(hasher)
}

fn finish(hasher: Sha1) -> ChallengeHash {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compute the full answer to a challenge.
pub fn garbage_answer(base: &[u8], amount: u32) -> Vec<Vec<u8>> {
    (0..amount)
        .map(|i| garbage_digest(base, i).to_vec())
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_appends_decimal_index() {
        assert_eq!(garbage_digest(b"abc", 3), sha1_digest(b"abc3"));
        assert_eq!(garbage_digest(b"abc", 12), sha1_digest(b"abc12"));
    }

    #[test]
    fn test_known_sha1_vector() {
        assert_eq!(
            hex::encode(sha1_digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_answer_covers_every_index() {
        let answer = garbage_answer(b"seed", 4);
        assert_eq!(answer.len(), 4);
        for (i, hash) in answer.iter().enumerate() {
            assert_eq!(hash.len(), HASH_LEN);
            assert_eq!(hash.as_slice(), garbage_digest(b"seed", i as u32));
        }
    }

    #[test]
    fn test_fresh_bases_differ() {
        let a = fresh_base();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = fresh_base();
        assert_ne!(a, b);
    }
}
