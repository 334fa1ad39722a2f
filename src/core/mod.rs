//! Core primitives: identifiers and the flip RNG.

pub mod ids;
pub mod rng;

// Re-export core types
pub use ids::{ConnectionId, IdError, MatchId, WalletAddress};
pub use rng::FlipRng;
