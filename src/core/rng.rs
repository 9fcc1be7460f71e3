//! Challenge Random Number Generator
//!
//! Uses Xorshift128+ for fast randomness when picking challenge parameters.
//! Given the same seed it produces the same sequence, which keeps tests stable.
//! It is not a cryptographic generator.

/// PRNG using the Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use simplewt::core::rng::ChallengeRng;
///
/// let mut a = ChallengeRng::new(12345);
/// let mut b = ChallengeRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug)]
pub struct ChallengeRng {
    state: [u64; 2],
}

impl Default for ChallengeRng {
    fn default() -> Self {
        Self::from_clock()
    }
}

impl ChallengeRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Seed from the wall clock.
    pub fn from_clock() -> Self {
        let now = chrono::Utc::now();
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().wrapping_mul(1000));
        Self::new(nanos as u64)
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - slight bias for very large max, but acceptable
        (self.next_u64() % max as u64) as u32
    }

    /// Generate a random integer in `base..base + spread`.
    ///
    /// A zero spread always yields `base`.
    #[inline]
    pub fn next_spread(&mut self, base: u32, spread: u32) -> u32 {
        base.saturating_add(self.next_int(spread))
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

// =============================================================================
// TESTS
// =============================================================================
