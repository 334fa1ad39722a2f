//! Game Logic Module
//!
//! The duel itself: seats, phases, power, flips and scoring. Pure and
//! clock-free; every entry point takes the match clock as `now_ms`.
//!
//! ## Module Structure
//!
//! - `state`: Seats, sides, phases and per-player state
//! - `rules`: Round target, phase durations, retry policy
//! - `power`: Power meter and flip resolution
//! - `score`: Append-only round log and best-of-N rule
//! - `machine`: Phase graph and auto-actions
//! - `events`: What the machine reports back

pub mod state;
pub mod rules;
pub mod power;
pub mod score;
pub mod machine;
pub mod events;

// Re-export key types
pub use state::{MatchPhase, MatchListing, PlayerState, Seat, Seats, Side, StakeDescriptor};
pub use rules::{MatchRules, RetryPolicy};
pub use machine::{MatchError, MatchInput, MatchMachine, SeatRole, SettlementStatus, StepResult, TimerKind};
pub use events::{MatchEvent, MatchEventData};
