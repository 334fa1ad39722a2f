//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{MatchId, WalletAddress};
use crate::game::events::{AutoAction, CancelReason, CompletionReason};
use crate::game::machine::{Completion, SeatRole, SettlementJob, SettlementStatus};
use crate::game::score::RoundRecord;
use crate::game::state::{AssetProof, MatchPhase, Seat, Seats, Side, StakeDescriptor};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a nonce to sign.
    AuthChallengeRequest {
        /// Match to join.
        match_id: MatchId,
        /// Claimed wallet.
        address: WalletAddress,
    },

    /// Signed nonce (base58 ed25519 signature).
    AuthResponse {
        /// Signature over the nonce bytes.
        signature: String,
    },

    /// Rebind with a previously issued resume token.
    Resume {
        /// Resume token.
        token: String,
    },

    /// Pick a side for this round.
    SubmitChoice {
        /// Side.
        side: Side,
    },

    /// Start charging.
    BeginCharge,

    /// Release and flip.
    ReleaseCharge,

    /// Report a stake deposit.
    ConfirmDeposit {
        /// Deposit proof.
        proof: AssetProof,
    },

    /// Request the current snapshot.
    SyncRequest,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },

    /// Drop the binding but keep the socket.
    Logout,
}

impl ClientMessage {
    /// Whether this message may be sent before authenticating.
    pub fn allowed_unauthenticated(&self) -> bool {
        matches!(
            self,
            ClientMessage::AuthChallengeRequest { .. }
                | ClientMessage::AuthResponse { .. }
                | ClientMessage::Resume { .. }
                | ClientMessage::Ping { .. }
        )
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Nonce to sign.
    AuthChallenge {
        /// Nonce text; sign its UTF-8 bytes.
        nonce: String,
        /// Time left to answer.
        expires_in_ms: u64,
    },

    /// Connection is bound.
    SessionEstablished {
        /// Match.
        match_id: MatchId,
        /// Wallet.
        address: WalletAddress,
        /// Seat or spectator.
        role: SeatRole,
        /// Token for reconnecting without a new challenge.
        resume_token: String,
    },

    /// Authentication refused.
    AuthFailed {
        /// Error code.
        code: ErrorCode,
        /// Reason.
        reason: String,
    },

    /// Seated player's connection changed.
    Presence {
        /// Seat.
        player: Seat,
        /// Now connected.
        connected: bool,
    },

    /// Phase changed.
    PhaseChanged {
        /// New phase.
        phase: MatchPhase,
        /// Current round.
        round: u32,
        /// Time left on the new phase's deadline.
        deadline_in_ms: Option<u64>,
    },

    /// A stake's custody status changed.
    DepositUpdate {
        /// Seat.
        player: Seat,
        /// Confirmed or not.
        confirmed: bool,
        /// Reason code when refused.
        reason: Option<String>,
    },

    /// A player locked in a side.
    ChoiceUpdate {
        /// Seat.
        player: Seat,
        /// Both choices are in.
        phase_complete: bool,
    },

    /// Acting player's power.
    PowerUpdate {
        /// Seat.
        player: Seat,
        /// Power in hundredths of a unit.
        power: u32,
    },

    /// Round decided.
    RoundResult {
        /// The record.
        outcome: RoundRecord,
        /// Scores after this round.
        scores: Seats<u32>,
    },

    /// Same side chosen; round replays.
    RoundVoided {
        /// Round being replayed.
        round: u32,
        /// Drawn side.
        side: Side,
        /// Side both chose.
        shared_choice: Side,
    },

    /// Engine acted for a player.
    AutoAction {
        /// Seat.
        player: Seat,
        /// What was done.
        action: AutoAction,
    },

    /// Full state.
    MatchSnapshot(Box<MatchSnapshot>),

    /// Match decided.
    MatchCompleted {
        /// Winning seat.
        winner: Seat,
        /// Final score.
        final_score: Seats<u32>,
        /// Why.
        reason: CompletionReason,
    },

    /// Match cancelled before play.
    MatchCancelled {
        /// Why.
        reason: CancelReason,
    },

    /// Match halted.
    MatchErrored {
        /// Description.
        reason: String,
    },

    /// Custody status changed.
    SettlementStatus {
        /// Status.
        status: SettlementView,
    },

    /// Request rejected.
    Error(ServerError),

    /// Ping reply.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server wall clock (ms).
        server_time: u64,
    },

    /// Server going away.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Public view of a seated player. The side stays hidden until the
/// round resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    /// Wallet.
    pub address: WalletAddress,
    /// Has a live connection.
    pub connected: bool,
    /// Locked in a side this round.
    pub has_chosen: bool,
    /// Power this round.
    pub power: u32,
    /// Stake custodied.
    pub deposited: bool,
    /// Turn timeouts in a row.
    pub consecutive_timeouts: u32,
}

/// Custody status as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementView {
    /// Payout or refund, when there is work.
    pub job: Option<SettlementJob>,
    /// Detailed status.
    pub status: SettlementStatus,
    /// Short label: `settlement_pending`, `refund_failed`, ...
    pub label: String,
}

impl SettlementView {
    /// Create a new view.
    pub fn new(job: Option<&SettlementJob>, status: &SettlementStatus) -> Self {
        let prefix = match job {
            Some(SettlementJob::Refund { .. }) => "refund",
            _ => "settlement",
        };
        let label = match status {
            SettlementStatus::NotRequired => "none".to_string(),
            SettlementStatus::Pending { .. } => format!("{prefix}_pending"),
            SettlementStatus::AwaitingConfirmation { .. } => format!("{prefix}_submitted"),
            SettlementStatus::Settled { .. } => match job {
                Some(SettlementJob::Refund { .. }) => "refunded".to_string(),
                _ => "settled".to_string(),
            },
            SettlementStatus::Failed { .. } => format!("{prefix}_failed"),
        };
        Self { job: job.cloned(), status: status.clone(), label }
    }
}

/// Everything a client needs to render the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Match.
    pub match_id: MatchId,
    /// Phase.
    pub phase: MatchPhase,
    /// Current round (0 before play).
    pub round: u32,
    /// Best-of target.
    pub round_target: u32,
    /// Who charges this round.
    pub turn_holder: Option<Seat>,
    /// Time left on the phase deadline when the snapshot was taken.
    pub deadline_in_ms: Option<u64>,
    /// Seated players.
    pub players: Seats<Option<PlayerView>>,
    /// Scores.
    pub scores: Seats<u32>,
    /// Decided rounds, oldest first.
    pub rounds: Vec<RoundRecord>,
    /// Rounds replayed after a same-side choice.
    pub voided_rounds: u32,
    /// Stakes.
    pub stake: StakeDescriptor,
    /// Result once completed.
    pub completion: Option<Completion>,
    /// Custody status.
    pub settlement: SettlementView,
    /// Bumped on every accepted mutation.
    pub version: u64,
    /// When the match was opened.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create a new error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Signature or challenge did not check out.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// Challenge window passed.
    ChallengeExpired,
    /// Resume token has expired.
    TokenExpired,
    /// Resume token is forged or malformed.
    InvalidToken,
    /// Unparseable or malformed message.
    InvalidInput,
    /// No such match.
    UnknownMatch,
    /// Sender holds no seat.
    NotAParticipant,
    /// Action not legal in this phase.
    IllegalPhaseTransition,
    /// Other seat's turn.
    NotYourTurn,
    /// Choice already locked.
    ChoiceAlreadyMade,
    /// Connection limit reached.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}
