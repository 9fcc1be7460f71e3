//! Garbage Challenge
//!
//! Keeps idle clients honest: the server hands out a seed and the client
//! must keep returning `amount` digests `SHA1(base ∥ decimal(i))` at the
//! requested rate until the challenge total is worked off.
//!
//! `total = rate × duration × amount` digests per challenge. Every verified
//! digest pays one off. A response that fails verification counts as a failed
//! round; too many consecutive failed rounds end the session.

use crate::core::hash::{fresh_base, garbage_digest, HASH_LEN};
use crate::core::rng::ChallengeRng;
use crate::network::protocol::GarbageChallenge;

/// Challenge parameter ranges. Each value is drawn from `base..base + spread`.
#[derive(Debug, Clone)]
pub struct GarbageConfig {
    /// Responses per second.
    pub rate: (u32, u32),
    /// Seconds of work per challenge.
    pub duration: (u32, u32),
    /// Digests per response.
    pub amount: (u32, u32),
    /// Failed rounds tolerated before the session is closed.
    pub max_failed_rounds: u32,
}

impl Default for GarbageConfig {
    fn default() -> Self {
        Self {
            rate: (60, 60),
            duration: (10, 10),
            amount: (10, 10),
            max_failed_rounds: 5,
        }
    }
}

/// Why a response was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GarbageError {
    /// Wrong number of digests.
    #[error("expected {expected} hashes, got {got}")]
    AmountMismatch {
        /// Digests the challenge asks for.
        expected: u32,
        /// Digests received.
        got: usize,
    },

    /// A digest has the wrong size.
    #[error("hash {index} has {len} bytes")]
    DataInvalid {
        /// Slot of the bad digest.
        index: u32,
        /// Its length.
        len: usize,
    },

    /// A digest does not match.
    #[error("hash {index} does not match")]
    HashMismatch {
        /// Slot of the wrong digest.
        index: u32,
    },

    /// The payload did not decode.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Result of a verified response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The challenge total reached zero.
    Complete,
    /// Digests still owed.
    Progress {
        /// Remaining total.
        remaining: u32,
    },
}

/// Per-player challenge state.
#[derive(Debug, Clone, Default)]
pub struct GarbageState {
    /// Digests per response.
    pub amount: u32,
    /// Responses per second.
    pub rate: u8,
    /// Seconds of work.
    pub duration: u32,
    /// Digests still owed. Zero means a new challenge is due.
    pub total: u32,
    /// Current seed.
    pub base: Vec<u8>,
    /// Consecutive failed rounds.
    pub failed_rounds: u32,
}

impl GarbageState {
    /// Start a fresh challenge with random parameters and a new seed.
    pub fn issue(&mut self, rng: &mut ChallengeRng, config: &GarbageConfig) -> GarbageChallenge {
        let rate = rng.next_spread(config.rate.0, config.rate.1).min(u8::MAX as u32) as u8;
        let duration = rng.next_spread(config.duration.0, config.duration.1);
        let amount = rng.next_spread(config.amount.0, config.amount.1);
        self.issue_with(rate, duration, amount, fresh_base().to_vec())
    }

    /// Start a challenge with explicit parameters.
    pub fn issue_with(&mut self, rate: u8, duration: u32, amount: u32, base: Vec<u8>) -> GarbageChallenge {
        self.rate = rate;
        self.duration = duration;
        self.amount = amount;
        self.total = (rate as u32).saturating_mul(duration).saturating_mul(amount);
        self.base = base;
        self.challenge()
    }

    /// The challenge currently outstanding.
    pub fn challenge(&self) -> GarbageChallenge {
        GarbageChallenge {
            amount: self.amount,
            rate: self.rate,
            base: self.base.clone(),
        }
    }

    /// True when no work is owed.
    pub fn needs_challenge(&self) -> bool {
        self.total == 0
    }

    /// Check a response. Each digest verified before a failure still pays
    /// one off the total.
    pub fn verify(&mut self, hashes: &[Vec<u8>]) -> Result<Verdict, GarbageError> {
        if hashes.len() != self.amount as usize {
            return Err(GarbageError::AmountMismatch {
                expected: self.amount,
                got: hashes.len(),
            });
        }

        for (index, hash) in (0..self.amount).zip(hashes) {
            if hash.len() != HASH_LEN {
                return Err(GarbageError::DataInvalid { index, len: hash.len() });
            }
            if hash.as_slice() != garbage_digest(&self.base, index) {
                return Err(GarbageError::HashMismatch { index });
            }
            self.total = self.total.saturating_sub(1);
        }

        if self.total == 0 {
            Ok(Verdict::Complete)
        } else {
            Ok(Verdict::Progress { remaining: self.total })
        }
    }

    /// Count a failed round. Returns true once the limit is exceeded.
    pub fn record_failure(&mut self, max_failed_rounds: u32) -> bool {
        self.failed_rounds += 1;
        self.failed_rounds > max_failed_rounds
    }

    /// A response verified.
    pub fn record_success(&mut self) {
        self.failed_rounds = 0;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{garbage_answer, sha1_digest};

    #[test]
    fn test_total_is_product() {
        let mut state = GarbageState::default();
        let challenge = state.issue_with(60, 10, 10, vec![1; 20]);
        assert_eq!(state.total, 6000);
        assert_eq!(challenge.amount, 10);
        assert_eq!(challenge.rate, 60);
    }

    #[test]
    fn test_issue_ranges() {
        let mut rng = ChallengeRng::new(42);
        let config = GarbageConfig::default();
        for _ in 0..200 {
            let mut state = GarbageState::default();
            let challenge = state.issue(&mut rng, &config);
            assert!((60..120).contains(&(challenge.rate as u32)));
            assert!((10..20).contains(&state.duration));
            assert!((10..20).contains(&challenge.amount));
            assert_eq!(challenge.base.len(), HASH_LEN);
            assert_eq!(state.total, challenge.rate as u32 * state.duration * challenge.amount);
        }
    }

    #[test]
    fn test_correct_response_pays_amount() {
        let mut state = GarbageState::default();
        state.issue_with(60, 10, 10, b"abc".to_vec());

        let verdict = state.verify(&garbage_answer(b"abc", 10)).unwrap();
        assert_eq!(verdict, Verdict::Progress { remaining: 5990 });
        assert_eq!(state.total, 5990);
    }

    #[test]
    fn test_completion() {
        let mut state = GarbageState::default();
        state.issue_with(1, 1, 2, b"seed".to_vec());

        assert_eq!(state.verify(&garbage_answer(b"seed", 2)), Ok(Verdict::Complete));
        assert!(state.needs_challenge());
    }

    #[test]
    fn test_index_three_digest() {
        let mut state = GarbageState::default();
        state.issue_with(1, 10, 4, b"abc".to_vec());

        let mut hashes = garbage_answer(b"abc", 4);
        assert_eq!(hashes[3], sha1_digest(b"abc3").to_vec());

        hashes[3] = vec![0u8; 20];
        assert_eq!(state.verify(&hashes), Err(GarbageError::HashMismatch { index: 3 }));
        // Indices 0..3 still counted
        assert_eq!(state.total, 40 - 3);
    }

    #[test]
    fn test_short_digest_is_invalid() {
        let mut state = GarbageState::default();
        state.issue_with(1, 10, 4, b"abc".to_vec());

        let mut hashes = garbage_answer(b"abc", 4);
        hashes[0] = vec![0u8; 19];
        assert_eq!(
            state.verify(&hashes),
            Err(GarbageError::DataInvalid { index: 0, len: 19 })
        );
        assert_eq!(state.total, 40);
    }

    #[test]
    fn test_wrong_amount() {
        let mut state = GarbageState::default();
        state.issue_with(1, 10, 4, b"abc".to_vec());

        let result = state.verify(&garbage_answer(b"abc", 3));
        assert_eq!(result, Err(GarbageError::AmountMismatch { expected: 4, got: 3 }));
        assert_eq!(state.total, 40);
    }

    #[test]
    fn test_failed_round_accounting() {
        let mut state = GarbageState::default();
        for _ in 0..5 {
            assert!(!state.record_failure(5));
        }
        assert!(state.record_failure(5));

        state.record_success();
        assert_eq!(state.failed_rounds, 0);
    }
}
