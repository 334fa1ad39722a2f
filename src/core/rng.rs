//! Flip Random Number Generator
//!
//! Xorshift128+ seeded through SplitMix64. Each match owns one generator,
//! created before anyone is seated and seeded from server entropy mixed
//! with the match id, so two matches never share a stream.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::MatchId;

/// Uniform PRNG using the Xorshift128+ algorithm.
///
/// Given the same seed it produces the same sequence on every platform,
/// which keeps flip tests reproducible.
///
/// # Example
///
/// ```
/// use flip_duel::core::rng::FlipRng;
///
/// let mut a = FlipRng::new(12345);
/// let mut b = FlipRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlipRng {
    state: [u64; 2],
}

impl FlipRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// SplitMix64 spreads weak seeds over the full state.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Xorshift must never run from an all-zero state
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Seed from fresh server entropy for a given match.
    pub fn for_match(match_id: &MatchId) -> Self {
        let entropy = uuid::Uuid::new_v4().into_bytes();
        Self::new(derive_match_seed(&entropy, match_id))
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

    /// A single fair bit.
    ///
    /// Uses the top bit; the low bits of `s0 + s1` are the weakest.
    #[inline]
    pub fn next_bit(&mut self) -> bool {
        self.next_u64() >> 63 == 1
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a match seed from server entropy and the match id.
pub fn derive_match_seed(entropy: &[u8; 16], match_id: &MatchId) -> u64 {
    let mut hasher = Sha256::new();

    hasher.update(b"FLIP_DUEL_SEED_V1");
    hasher.update(entropy);
    hasher.update(match_id.as_bytes());

    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================
