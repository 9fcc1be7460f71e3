//! Core primitives.
//!
//! Randomness and hashing used by the garbage challenge.

pub mod hash;
pub mod rng;

// Re-export core types
pub use hash::{garbage_digest, ChallengeHash, HASH_LEN};
pub use rng::ChallengeRng;
