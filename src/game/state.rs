//! Match State Definitions
//!
//! Seats, sides, phases and per-player state for a single duel.
//! Nothing here touches the network or the clock.

use serde::{Deserialize, Serialize};

use crate::core::ids::{ConnectionId, MatchId, WalletAddress};
use crate::game::rules::MatchRules;

// =============================================================================
// SIDE
// =============================================================================

/// A coin face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Heads.
    Heads,
    /// Tails.
    Tails,
}

impl Side {
    /// The other face.
    pub fn opposite(self) -> Side {
        match self {
            Side::Heads => Side::Tails,
            Side::Tails => Side::Heads,
        }
    }
}

// =============================================================================
// SEAT
// =============================================================================

/// Which of the two participants. Creator staked the asset, opponent
/// staked the equivalent value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    /// Listed the match.
    Creator,
    /// Joined the match.
    Opponent,
}

impl Seat {
    /// Both seats, creator first.
    pub const BOTH: [Seat; 2] = [Seat::Creator, Seat::Opponent];

    /// The other seat.
    pub fn other(self) -> Seat {
        match self {
            Seat::Creator => Seat::Opponent,
            Seat::Opponent => Seat::Creator,
        }
    }

    /// Turn holder for a 1-based round: creator on odd rounds.
    pub fn turn_holder(round: u32) -> Seat {
        if round % 2 == 1 {
            Seat::Creator
        } else {
            Seat::Opponent
        }
    }
}

/// One value per seat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seats<T> {
    /// Creator's value.
    pub creator: T,
    /// Opponent's value.
    pub opponent: T,
}

impl<T> Seats<T> {
    /// Build from both values.
    pub fn new(creator: T, opponent: T) -> Self {
        Self { creator, opponent }
    }

    /// Value for a seat.
    pub fn get(&self, seat: Seat) -> &T {
        match seat {
            Seat::Creator => &self.creator,
            Seat::Opponent => &self.opponent,
        }
    }

    /// Mutable value for a seat.
    pub fn get_mut(&mut self, seat: Seat) -> &mut T {
        match seat {
            Seat::Creator => &mut self.creator,
            Seat::Opponent => &mut self.opponent,
        }
    }

    /// Map both values.
    pub fn map<U>(&self, mut f: impl FnMut(Seat, &T) -> U) -> Seats<U> {
        Seats {
            creator: f(Seat::Creator, &self.creator),
            opponent: f(Seat::Opponent, &self.opponent),
        }
    }
}

// =============================================================================
// PHASE
// =============================================================================

/// Match phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Opponent not yet bound.
    Waiting,
    /// Both identities bound, stakes not yet custodied.
    Locked,
    /// Fixed pre-game countdown.
    Countdown,
    /// Players pick a side.
    Choosing,
    /// Acting player charges the flip.
    Charging,
    /// Outcome on display.
    Result,
    /// Winner decided.
    Completed,
    /// Aborted before play (deposit deadline).
    Cancelled,
    /// Internal invariant violated; match halted.
    Errored,
}

impl MatchPhase {
    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchPhase::Completed | MatchPhase::Cancelled | MatchPhase::Errored)
    }

    /// Whether a player action of this kind is legal in this phase.
    ///
    /// Turn order is checked separately; this is the phase graph only.
    pub fn accepts(self, action: ActionKind) -> bool {
        match action {
            ActionKind::SubmitChoice => self == MatchPhase::Choosing,
            ActionKind::BeginCharge | ActionKind::ReleaseCharge => self == MatchPhase::Charging,
            ActionKind::ConfirmDeposit => {
                matches!(self, MatchPhase::Waiting | MatchPhase::Locked)
            }
        }
    }
}

/// Kinds of player action, for phase gating and error reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Pick a side for the round.
    SubmitChoice,
    /// Start accumulating power.
    BeginCharge,
    /// Release power and flip.
    ReleaseCharge,
    /// Report a stake deposit.
    ConfirmDeposit,
}

// =============================================================================
// STAKE
// =============================================================================

/// What each side put up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeDescriptor {
    /// Asset reference for the creator's NFT (mint address or similar).
    pub asset: String,
    /// Value the opponent must match, in the smallest currency unit.
    pub equivalent_value: u64,
}

/// Proof that a deposit reached custody (e.g. a transaction signature).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetProof {
    /// Opaque reference understood by the custody gateway.
    pub reference: String,
}

/// Everything needed to open a match.
#[derive(Clone, Debug)]
pub struct MatchListing {
    /// Match identifier.
    pub match_id: MatchId,
    /// Creator, if the listing layer already knows it. Otherwise the first
    /// identity to bind takes the creator seat.
    pub creator: Option<WalletAddress>,
    /// Stakes.
    pub stake: StakeDescriptor,
    /// Rules for this match.
    pub rules: MatchRules,
}

impl MatchListing {
    /// A listing with an unassigned creator.
    pub fn open(match_id: MatchId, stake: StakeDescriptor, rules: MatchRules) -> Self {
        Self {
            match_id,
            creator: None,
            stake,
            rules,
        }
    }
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// Deposit status for one seat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DepositStatus {
    /// Nothing custodied.
    None,
    /// Custody confirmed.
    Confirmed {
        /// Custody reference.
        receipt: String,
    },
}

/// State of one seated player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerState {
    /// Wallet identity; the key for reconnection.
    pub address: WalletAddress,
    /// Current connection, if any. A player may be disconnected
    /// without forfeiting.
    pub connection: Option<ConnectionId>,
    /// Side picked this round.
    pub choice: Option<Side>,
    /// Power accumulated this round.
    pub power: u32,
    /// Completed challenge-response at least once.
    pub authenticated: bool,
    /// Turn timeouts in a row; reset when the player acts.
    pub consecutive_timeouts: u32,
    /// Stake custody.
    pub deposit: DepositStatus,
}

impl PlayerState {
    /// New player bound to a connection.
    pub fn new(address: WalletAddress, connection: ConnectionId) -> Self {
        Self {
            address,
            connection: Some(connection),
            choice: None,
            power: 0,
            authenticated: true,
            consecutive_timeouts: 0,
            deposit: DepositStatus::None,
        }
    }

    /// Whether a connection is currently bound.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether the stake is custodied.
    pub fn has_deposited(&self) -> bool {
        matches!(self.deposit, DepositStatus::Confirmed { .. })
    }

    /// Clear per-round fields.
    pub fn reset_round(&mut self) {
        self.choice = None;
        self.power = 0;
    }
}
