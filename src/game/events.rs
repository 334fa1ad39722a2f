//! Match Events
//!
//! Everything the state machine reports back to the session layer.
//! The session turns these into wire messages.

use serde::{Deserialize, Serialize};

use crate::core::ids::WalletAddress;
use crate::game::machine::SettlementStatus;
use crate::game::score::RoundRecord;
use crate::game::state::{MatchPhase, Seat, Seats, Side};

/// Why a match completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionReason {
    /// Best-of-N decided.
    Decided,
    /// A player timed out too many turns in a row.
    Forfeit {
        /// The absent seat.
        absent: Seat,
    },
}

/// Why a match was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Stakes did not reach custody in time.
    DepositTimeout,
}

/// Action the engine took on a player's behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AutoAction {
    /// Side picked after the choosing deadline.
    Choice {
        /// Picked side.
        side: Side,
    },
    /// Flip released after the charging deadline.
    Release {
        /// Power at release.
        power: u32,
    },
}

/// Event payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MatchEventData {
    /// A wallet took a seat.
    PlayerSeated {
        /// Seat taken.
        seat: Seat,
        /// Wallet.
        address: WalletAddress,
    },

    /// A seated player's connection came back.
    PlayerReconnected {
        /// Seat.
        seat: Seat,
    },

    /// A seated player's connection dropped.
    PlayerDisconnected {
        /// Seat.
        seat: Seat,
    },

    /// Phase changed.
    PhaseChanged {
        /// Previous phase.
        from: MatchPhase,
        /// New phase.
        to: MatchPhase,
    },

    /// Stake custodied.
    DepositConfirmed {
        /// Seat.
        seat: Seat,
    },

    /// Custody refused the deposit proof.
    DepositRejected {
        /// Seat.
        seat: Seat,
        /// Reason code.
        reason: String,
    },

    /// A player locked in a side (the side itself stays hidden).
    ChoiceMade {
        /// Seat.
        seat: Seat,
        /// Both choices are now in.
        phase_complete: bool,
    },

    /// Engine acted for a player.
    AutoActed {
        /// Seat.
        seat: Seat,
        /// What was done.
        action: AutoAction,
    },

    /// Acting player's power changed.
    PowerUpdated {
        /// Seat.
        seat: Seat,
        /// Current power.
        power: u32,
    },

    /// Round decided and recorded.
    RoundResolved {
        /// The record.
        record: RoundRecord,
        /// Scores after this round.
        scores: Seats<u32>,
    },

    /// Both players chose the same side; round will be replayed.
    RoundVoided {
        /// Round index being replayed.
        round: u32,
        /// Drawn side.
        side: Side,
        /// Side both chose.
        shared_choice: Side,
    },

    /// Match over.
    MatchCompleted {
        /// Winner.
        winner: Seat,
        /// Final scores.
        final_score: Seats<u32>,
        /// Why.
        reason: CompletionReason,
    },

    /// Match cancelled before play.
    MatchCancelled {
        /// Why.
        reason: CancelReason,
    },

    /// Match halted on an internal invariant violation.
    MatchErrored {
        /// Description.
        reason: String,
    },

    /// Custody status changed.
    SettlementUpdated {
        /// New status.
        status: SettlementStatus,
    },
}

/// An event with its match-clock time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Match clock (ms since the session opened).
    pub at_ms: u64,

    /// Seat involved, if any.
    pub seat: Option<Seat>,

    /// Event data.
    pub data: MatchEventData,
}

impl MatchEvent {
    /// Create a new event.
    pub fn new(at_ms: u64, data: MatchEventData) -> Self {
        let seat = match &data {
            MatchEventData::PlayerSeated { seat, .. }
            | MatchEventData::PlayerReconnected { seat }
            | MatchEventData::PlayerDisconnected { seat }
            | MatchEventData::DepositConfirmed { seat }
            | MatchEventData::DepositRejected { seat, .. }
            | MatchEventData::ChoiceMade { seat, .. }
            | MatchEventData::AutoActed { seat, .. }
            | MatchEventData::PowerUpdated { seat, .. } => Some(*seat),
            MatchEventData::RoundResolved { record, .. } => Some(record.winner),
            MatchEventData::MatchCompleted { winner, .. } => Some(*winner),
            _ => None,
        };

        Self { at_ms, seat, data }
    }

    /// Whether this event ends play.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.data,
            MatchEventData::MatchCompleted { .. }
                | MatchEventData::MatchCancelled { .. }
                | MatchEventData::MatchErrored { .. }
        )
    }
}
