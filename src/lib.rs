//! # Flip Duel Server
//!
//! Authoritative match sessions for staked best-of-N coin-flip duels
//! between two wallets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     FLIP DUEL SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Identifiers and randomness                │
//! │  ├── ids.rs      - Match, wallet and connection ids          │
//! │  └── rng.rs      - Xorshift128+ flip source                  │
//! │                                                              │
//! │  game/           - Match rules (pure, clock passed in)       │
//! │  ├── state.rs    - Seats, sides, phases, players             │
//! │  ├── rules.rs    - Durations, round target, retry policy     │
//! │  ├── power.rs    - Power meter and flip resolution           │
//! │  ├── score.rs    - Round log and best-of-N                   │
//! │  ├── machine.rs  - Phase graph and auto-actions              │
//! │  └── events.rs   - Match events                              │
//! │                                                              │
//! │  network/        - I/O and clocks                            │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── auth.rs     - Wallet challenge-response, resume tokens  │
//! │  ├── protocol.rs - Wire messages and snapshots               │
//! │  ├── registry.rs - Match id to actor map                     │
//! │  ├── session.rs  - Per-match actor                           │
//! │  └── timer.rs    - Phase deadlines                           │
//! │                                                              │
//! │  settlement/     - Stake custody                             │
//! │  ├── gateway.rs  - Custody boundary and in-memory ledger     │
//! │  └── bridge.rs   - Timed gateway calls                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Single Writer
//!
//! Every match runs on its own task. Client actions, timer expiries and
//! custody results are queued to that task and applied one at a time, so
//! a match's state is never touched concurrently. Matches share nothing
//! mutable; the registry map is locked only to look up or insert handles.
//!
//! Power is cosmetic. The drawn side never depends on it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod settlement;

// Re-export commonly used types
pub use core::ids::{ConnectionId, MatchId, WalletAddress};
pub use core::rng::FlipRng;
pub use game::machine::{MatchMachine, SeatRole};
pub use game::state::{MatchListing, MatchPhase, Seat, Side, StakeDescriptor};
pub use network::server::{GameServer, ServerConfig};
pub use settlement::{CustodyGateway, InMemoryCustody, SettlementBridge};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
