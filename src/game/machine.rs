//! Match State Machine
//!
//! The phase graph for one duel:
//!
//! ```text
//! Waiting → Locked → Countdown → Choosing → Charging → Result ─┬→ Choosing (next round)
//!              │                                               └→ Completed
//!              └→ Cancelled (deposit deadline)           any → Errored (invariant violated)
//! ```
//!
//! The machine is pure. Time arrives as `now_ms` on every call, and side
//! effects leave as [`StepResult`]: events to broadcast, timers to
//! (re)arm or cancel and settlement work for the bridge. The session actor
//! executes those; nothing in here blocks or spawns.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::{ConnectionId, MatchId, WalletAddress};
use crate::game::events::{AutoAction, CancelReason, CompletionReason, MatchEvent, MatchEventData};
use crate::game::power::{CoinSource, FlipResolver, PowerMeter, RoundOutcome};
use crate::game::rules::{MatchRules, POWER_SCALE};
use crate::game::score::{RoundRecord, ScoreTracker};
use crate::game::state::{
    ActionKind, DepositStatus, MatchListing, MatchPhase, PlayerState, Seat, Seats, Side,
    StakeDescriptor,
};

// =============================================================================
// INPUTS AND OUTPUTS
// =============================================================================

/// Timers a match can have outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Stakes must reach custody (Locked).
    DepositWindow,
    /// Pre-game countdown.
    Countdown,
    /// Per-round choice limit.
    Choosing,
    /// Per-round charge limit.
    Charging,
    /// Result display delay.
    ResultDisplay,
    /// Power meter refresh while charging.
    PowerTick,
    /// Next custody retry.
    SettlementRetry,
    /// Deadline for custody to confirm a submitted payout.
    SettlementConfirmation,
}

impl TimerKind {
    /// The deadline timer owned by a phase, if it has one.
    pub fn for_phase(phase: MatchPhase) -> Option<TimerKind> {
        match phase {
            MatchPhase::Locked => Some(TimerKind::DepositWindow),
            MatchPhase::Countdown => Some(TimerKind::Countdown),
            MatchPhase::Choosing => Some(TimerKind::Choosing),
            MatchPhase::Charging => Some(TimerKind::Charging),
            MatchPhase::Result => Some(TimerKind::ResultDisplay),
            _ => None,
        }
    }
}

/// Timer work for the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCommand {
    /// Arm (or re-arm) a timer.
    Schedule {
        /// Which timer.
        kind: TimerKind,
        /// Delay from now.
        after_ms: u64,
    },
    /// Disarm a timer.
    Cancel(TimerKind),
}

/// Custody work for the settlement bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementCommand {
    /// Pay the pot out to the winner.
    Payout {
        /// Winning seat.
        winner: Seat,
    },
    /// Return custodied stakes.
    Refund {
        /// Seats to refund.
        seats: Vec<Seat>,
    },
}

/// What the custody side reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementReport {
    /// Payout final.
    Confirmed {
        /// Custody reference, if known.
        reference: Option<String>,
    },
    /// Payout accepted; final confirmation arrives later.
    Submitted {
        /// Custody reference.
        reference: String,
    },
    /// Payout failed.
    Failed {
        /// Reason code.
        reason: String,
    },
    /// Refund attempt finished.
    Refunded {
        /// Seats whose stake was returned.
        released: Vec<Seat>,
        /// Failure for the remaining seats, if any.
        failure: Option<String>,
    },
}

/// Inputs to [`MatchMachine::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchInput {
    /// Seat picks a side.
    SubmitChoice {
        /// Seat.
        seat: Seat,
        /// Side.
        side: Side,
    },
    /// Acting seat starts holding.
    BeginCharge {
        /// Seat.
        seat: Seat,
    },
    /// Acting seat releases.
    ReleaseCharge {
        /// Seat.
        seat: Seat,
    },
    /// Custody confirmed a seat's stake.
    DepositConfirmed {
        /// Seat.
        seat: Seat,
        /// Custody receipt.
        receipt: String,
    },
    /// Custody refused a seat's proof.
    DepositRejected {
        /// Seat.
        seat: Seat,
        /// Reason code.
        reason: String,
    },
    /// Operator skips deposit confirmation.
    OperatorStart,
    /// A timer fired.
    TimerExpired(TimerKind),
    /// A custody call made for this match returned.
    Settlement(SettlementReport),
    /// Custody reported out of band, not as the answer to a call.
    SettlementNotice(SettlementReport),
}

/// Role granted on bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "seat", rename_all = "snake_case")]
pub enum SeatRole {
    /// Seated participant.
    Player(Seat),
    /// Watches only.
    Spectator,
}

/// Side effects of one step.
#[derive(Debug, Default, Clone)]
pub struct StepResult {
    /// Events, in order.
    pub events: Vec<MatchEvent>,
    /// Timer work.
    pub timers: Vec<TimerCommand>,
    /// Custody work.
    pub settlement: Vec<SettlementCommand>,
    /// State changed; the session broadcasts a snapshot.
    pub mutated: bool,
}

impl StepResult {
    fn emit(&mut self, at_ms: u64, data: MatchEventData) {
        self.events.push(MatchEvent::new(at_ms, data));
    }

    fn schedule(&mut self, kind: TimerKind, after_ms: u64) {
        self.timers.push(TimerCommand::Schedule { kind, after_ms });
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.timers.push(TimerCommand::Cancel(kind));
    }
}

/// Protocol errors. None of these mutate state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    /// Action not legal in the current phase.
    #[error("{action} is not allowed while {phase:?}")]
    IllegalPhaseTransition {
        /// Current phase.
        phase: MatchPhase,
        /// Offending action.
        action: &'static str,
    },
    /// Charging actions belong to the turn holder.
    #[error("it is {holder:?}'s turn")]
    NotYourTurn {
        /// Who may act.
        holder: Seat,
    },
    /// Choice already locked in this round.
    #[error("choice already made this round")]
    ChoiceAlreadyMade,
    /// Sender holds no seat.
    #[error("not a participant in this match")]
    NotAParticipant,
}

// =============================================================================
// SETTLEMENT STATUS
// =============================================================================

/// Custody work attached to a finished match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementJob {
    /// Winner payout.
    Payout {
        /// Winning seat.
        winner: Seat,
    },
    /// Return of stakes.
    Refund {
        /// Seats still owed a refund.
        remaining: Vec<Seat>,
    },
}

/// Custody status, decoupled from the game result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementStatus {
    /// Nothing to settle.
    NotRequired,
    /// In flight or waiting to retry ("funds pending").
    Pending {
        /// Attempts made so far.
        attempts: u32,
    },
    /// Accepted by custody, final confirmation outstanding.
    AwaitingConfirmation {
        /// Custody reference.
        reference: String,
        /// Attempts made so far.
        attempts: u32,
    },
    /// Done.
    Settled {
        /// Custody reference, if known.
        reference: Option<String>,
    },
    /// Retries exhausted; needs manual intervention.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Last reason code.
        reason: String,
    },
}

impl SettlementStatus {
    fn attempts(&self) -> u32 {
        match self {
            SettlementStatus::Pending { attempts }
            | SettlementStatus::AwaitingConfirmation { attempts, .. }
            | SettlementStatus::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Still being worked on.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SettlementStatus::Pending { .. } | SettlementStatus::AwaitingConfirmation { .. }
        )
    }
}

/// How the match ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Winner.
    pub winner: Seat,
    /// Why.
    pub reason: CompletionReason,
}

// =============================================================================
// MACHINE
// =============================================================================

/// Authoritative state for one match.
#[derive(Debug)]
pub struct MatchMachine {
    id: MatchId,
    rules: MatchRules,
    stake: StakeDescriptor,
    reserved_creator: Option<WalletAddress>,
    phase: MatchPhase,
    round: u32,
    players: Seats<Option<PlayerState>>,
    tracker: ScoreTracker,
    resolver: FlipResolver,
    last_outcome: Option<RoundOutcome>,
    deadline_ms: Option<u64>,
    voided_rounds: u32,
    completion: Option<Completion>,
    settlement_job: Option<SettlementJob>,
    settlement: SettlementStatus,
    settlement_in_flight: bool,
    version: u64,
}

impl MatchMachine {
    /// New match in `Waiting`.
    pub fn new(listing: &MatchListing, coin: Box<dyn CoinSource>) -> Self {
        let rules = listing.rules.clone();
        let meter = PowerMeter::new(rules.max_power(), rules.charge_units_per_sec * POWER_SCALE);
        Self {
            id: listing.match_id,
            tracker: ScoreTracker::new(rules.round_target),
            resolver: FlipResolver::new(coin, meter),
            stake: listing.stake.clone(),
            reserved_creator: listing.creator.clone(),
            rules,
            phase: MatchPhase::Waiting,
            round: 0,
            players: Seats::default(),
            last_outcome: None,
            deadline_ms: None,
            voided_rounds: 0,
            completion: None,
            settlement_job: None,
            settlement: SettlementStatus::NotRequired,
            settlement_in_flight: false,
            version: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Match id.
    pub fn id(&self) -> MatchId {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Current 1-based round, 0 before play.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Rules.
    pub fn rules(&self) -> &MatchRules {
        &self.rules
    }

    /// Stakes.
    pub fn stake(&self) -> &StakeDescriptor {
        &self.stake
    }

    /// Seat who charges this round, once play has started.
    pub fn turn_holder(&self) -> Option<Seat> {
        (self.round > 0 && !self.phase.is_terminal()).then(|| Seat::turn_holder(self.round))
    }

    /// Player in a seat.
    pub fn player(&self, seat: Seat) -> Option<&PlayerState> {
        self.players.get(seat).as_ref()
    }

    /// Seat held by a wallet.
    pub fn seat_of(&self, address: &WalletAddress) -> Option<Seat> {
        Seat::BOTH
            .into_iter()
            .find(|s| self.player(*s).map(|p| &p.address) == Some(address))
    }

    /// Seat currently bound to a connection.
    pub fn seat_of_connection(&self, connection: ConnectionId) -> Option<Seat> {
        Seat::BOTH
            .into_iter()
            .find(|s| self.player(*s).and_then(|p| p.connection) == Some(connection))
    }

    /// Round log and scores.
    pub fn tracker(&self) -> &ScoreTracker {
        &self.tracker
    }

    /// Power levels this round.
    pub fn power_levels(&self) -> Seats<u32> {
        self.resolver.meter().levels()
    }

    /// Most recent flip.
    pub fn last_outcome(&self) -> Option<RoundOutcome> {
        self.last_outcome
    }

    /// Phase deadline on the match clock.
    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    /// Remaining time on the phase deadline.
    pub fn deadline_remaining(&self, now_ms: u64) -> Option<u64> {
        self.deadline_ms.map(|d| d.saturating_sub(now_ms))
    }

    /// Rounds replayed because both chose the same side.
    pub fn voided_rounds(&self) -> u32 {
        self.voided_rounds
    }

    /// Final result, once completed.
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Custody status.
    pub fn settlement(&self) -> &SettlementStatus {
        &self.settlement
    }

    /// Custody job, if any.
    pub fn settlement_job(&self) -> Option<&SettlementJob> {
        self.settlement_job.as_ref()
    }

    /// Bumped on every accepted mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Terminal and nothing left for custody to do.
    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal() && !self.settlement.is_open()
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    /// Bind an authenticated wallet. Returning wallets get their seat back;
    /// new wallets fill empty seats while the match is waiting; everyone
    /// else spectates.
    pub fn bind(
        &mut self,
        address: &WalletAddress,
        connection: ConnectionId,
        now_ms: u64,
    ) -> (SeatRole, StepResult) {
        let mut out = StepResult::default();

        if let Some(seat) = self.seat_of(address) {
            if let Some(player) = self.players.get_mut(seat).as_mut() {
                player.connection = Some(connection);
                player.authenticated = true;
            }
            out.emit(now_ms, MatchEventData::PlayerReconnected { seat });
            self.finish(&mut out);
            return (SeatRole::Player(seat), out);
        }

        if self.phase != MatchPhase::Waiting {
            return (SeatRole::Spectator, out);
        }

        let seat = match &self.reserved_creator {
            Some(reserved) if reserved == address => Seat::Creator,
            Some(_) => Seat::Opponent,
            None if self.players.creator.is_none() => Seat::Creator,
            None => Seat::Opponent,
        };
        if self.players.get(seat).is_some() {
            return (SeatRole::Spectator, out);
        }

        *self.players.get_mut(seat) = Some(PlayerState::new(address.clone(), connection));
        out.emit(now_ms, MatchEventData::PlayerSeated { seat, address: address.clone() });

        if self.players.creator.is_some() && self.players.opponent.is_some() {
            self.enter(MatchPhase::Locked, now_ms, &mut out);
            if self.both_deposited() {
                self.enter(MatchPhase::Countdown, now_ms, &mut out);
            }
        }

        self.finish(&mut out);
        (SeatRole::Player(seat), out)
    }

    /// Drop a connection. The seat is kept for reconnection.
    pub fn unbind(&mut self, connection: ConnectionId, now_ms: u64) -> StepResult {
        let mut out = StepResult::default();
        if let Some(seat) = self.seat_of_connection(connection) {
            if let Some(player) = self.players.get_mut(seat).as_mut() {
                player.connection = None;
            }
            out.emit(now_ms, MatchEventData::PlayerDisconnected { seat });
            self.finish(&mut out);
        }
        out
    }

    // -------------------------------------------------------------------------
    // Legality
    // -------------------------------------------------------------------------

    /// Check a player action against phase and turn without applying it.
    pub fn check_action(&self, seat: Seat, action: ActionKind) -> Result<(), MatchError> {
        if self.player(seat).is_none() {
            return Err(MatchError::NotAParticipant);
        }
        if !self.phase.accepts(action) {
            return Err(MatchError::IllegalPhaseTransition {
                phase: self.phase,
                action: action_name(action),
            });
        }
        match action {
            ActionKind::BeginCharge | ActionKind::ReleaseCharge => {
                let holder = Seat::turn_holder(self.round);
                if seat != holder {
                    return Err(MatchError::NotYourTurn { holder });
                }
            }
            ActionKind::SubmitChoice => {
                if self.player(seat).and_then(|p| p.choice).is_some() {
                    return Err(MatchError::ChoiceAlreadyMade);
                }
            }
            ActionKind::ConfirmDeposit => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Apply
    // -------------------------------------------------------------------------

    /// Apply one input. Errors leave the state untouched.
    pub fn apply(&mut self, input: MatchInput, now_ms: u64) -> Result<StepResult, MatchError> {
        let mut out = StepResult::default();

        match input {
            MatchInput::SubmitChoice { seat, side } => {
                self.check_action(seat, ActionKind::SubmitChoice)?;
                self.submit_choice(seat, side, now_ms, &mut out);
            }
            MatchInput::BeginCharge { seat } => {
                self.check_action(seat, ActionKind::BeginCharge)?;
                self.begin_charge(seat, now_ms, &mut out);
            }
            MatchInput::ReleaseCharge { seat } => {
                self.check_action(seat, ActionKind::ReleaseCharge)?;
                self.touch(seat);
                self.resolve_round(now_ms, &mut out);
            }
            MatchInput::DepositConfirmed { seat, receipt } => {
                self.deposit_confirmed(seat, receipt, now_ms, &mut out);
            }
            MatchInput::DepositRejected { seat, reason } => {
                out.emit(now_ms, MatchEventData::DepositRejected { seat, reason });
            }
            MatchInput::OperatorStart => {
                if self.phase != MatchPhase::Locked {
                    return Err(MatchError::IllegalPhaseTransition {
                        phase: self.phase,
                        action: "operator_start",
                    });
                }
                self.enter(MatchPhase::Countdown, now_ms, &mut out);
            }
            MatchInput::TimerExpired(kind) => self.timer_expired(kind, now_ms, &mut out),
            MatchInput::Settlement(report) => self.settlement_report(report, true, now_ms, &mut out),
            MatchInput::SettlementNotice(report) => {
                self.settlement_report(report, false, now_ms, &mut out)
            }
        }

        self.finish(&mut out);
        Ok(out)
    }

    fn finish(&mut self, out: &mut StepResult) {
        if !out.events.is_empty() || !out.timers.is_empty() || !out.settlement.is_empty() {
            // Rejected-deposit notices change nothing.
            let only_notices = out.timers.is_empty()
                && out.settlement.is_empty()
                && out
                    .events
                    .iter()
                    .all(|e| matches!(e.data, MatchEventData::DepositRejected { .. }));
            if !only_notices {
                out.mutated = true;
                self.version += 1;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Phase transitions
    // -------------------------------------------------------------------------

    fn enter(&mut self, to: MatchPhase, now_ms: u64, out: &mut StepResult) {
        let from = self.phase;
        if let Some(kind) = TimerKind::for_phase(from) {
            out.cancel(kind);
        }
        if from == MatchPhase::Charging {
            out.cancel(TimerKind::PowerTick);
        }
        if to.is_terminal() {
            out.cancel(TimerKind::PowerTick);
        }

        self.phase = to;
        self.deadline_ms = None;
        out.emit(now_ms, MatchEventData::PhaseChanged { from, to });

        let duration = match to {
            MatchPhase::Locked => Some(self.rules.deposit_window_ms),
            MatchPhase::Countdown => Some(self.rules.countdown_ms),
            MatchPhase::Choosing => Some(self.rules.choosing_ms),
            MatchPhase::Charging => Some(self.rules.charging_ms),
            MatchPhase::Result => Some(
                self.rules
                    .result_display_ms(self.last_outcome.map(|o| o.combined_power()).unwrap_or(0)),
            ),
            _ => None,
        };
        if let (Some(kind), Some(after_ms)) = (TimerKind::for_phase(to), duration) {
            out.schedule(kind, after_ms);
            self.deadline_ms = Some(now_ms.saturating_add(after_ms));
        }
    }

    fn start_round(&mut self, round: u32, now_ms: u64, out: &mut StepResult) {
        self.round = round;
        self.last_outcome = None;
        for seat in Seat::BOTH {
            if let Some(p) = self.players.get_mut(seat).as_mut() {
                p.reset_round();
            }
        }
        self.resolver.meter_mut().reset();
        self.enter(MatchPhase::Choosing, now_ms, out);
    }

    fn timer_expired(&mut self, kind: TimerKind, now_ms: u64, out: &mut StepResult) {
        match (kind, self.phase) {
            (TimerKind::DepositWindow, MatchPhase::Locked) => self.cancel_for_deposits(now_ms, out),
            (TimerKind::Countdown, MatchPhase::Countdown) => self.start_round(1, now_ms, out),
            (TimerKind::Choosing, MatchPhase::Choosing) => self.choosing_timeout(now_ms, out),
            (TimerKind::Charging, MatchPhase::Charging) => self.charging_timeout(now_ms, out),
            (TimerKind::PowerTick, MatchPhase::Charging) => self.power_tick(now_ms, out),
            (TimerKind::ResultDisplay, MatchPhase::Result) => self.after_result(now_ms, out),
            (TimerKind::SettlementRetry, _) => self.retry_settlement(now_ms, out),
            (TimerKind::SettlementConfirmation, _) => self.confirmation_timeout(now_ms, out),
            // Stale: the phase that armed it is gone.
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Deposits
    // -------------------------------------------------------------------------

    fn both_deposited(&self) -> bool {
        Seat::BOTH
            .iter()
            .all(|s| self.player(*s).map(|p| p.has_deposited()).unwrap_or(false))
    }

    fn deposit_confirmed(&mut self, seat: Seat, receipt: String, now_ms: u64, out: &mut StepResult) {
        let Some(player) = self.players.get_mut(seat).as_mut() else {
            return;
        };
        if player.has_deposited() {
            return;
        }

        match self.phase {
            MatchPhase::Waiting | MatchPhase::Locked => {
                player.deposit = DepositStatus::Confirmed { receipt };
                out.emit(now_ms, MatchEventData::DepositConfirmed { seat });
                if self.phase == MatchPhase::Locked && self.both_deposited() {
                    self.enter(MatchPhase::Countdown, now_ms, out);
                }
            }
            MatchPhase::Cancelled => {
                // Custody landed after the deadline; hand it straight back.
                player.deposit = DepositStatus::Confirmed { receipt };
                out.emit(now_ms, MatchEventData::DepositConfirmed { seat });
                let remaining = match self.settlement_job.take() {
                    Some(SettlementJob::Refund { mut remaining }) => {
                        if !remaining.contains(&seat) {
                            remaining.push(seat);
                        }
                        remaining
                    }
                    _ => vec![seat],
                };
                self.open_settlement(SettlementJob::Refund { remaining }, now_ms, out);
            }
            _ => {}
        }
    }

    fn cancel_for_deposits(&mut self, now_ms: u64, out: &mut StepResult) {
        self.enter(MatchPhase::Cancelled, now_ms, out);
        out.emit(now_ms, MatchEventData::MatchCancelled { reason: CancelReason::DepositTimeout });

        let deposited: Vec<Seat> = Seat::BOTH
            .into_iter()
            .filter(|s| self.player(*s).map(|p| p.has_deposited()).unwrap_or(false))
            .collect();
        if !deposited.is_empty() {
            self.open_settlement(SettlementJob::Refund { remaining: deposited }, now_ms, out);
        }
    }

    // -------------------------------------------------------------------------
    // Rounds
    // -------------------------------------------------------------------------

    fn touch(&mut self, seat: Seat) {
        if let Some(p) = self.players.get_mut(seat).as_mut() {
            p.consecutive_timeouts = 0;
        }
    }

    fn submit_choice(&mut self, seat: Seat, side: Side, now_ms: u64, out: &mut StepResult) {
        self.touch(seat);
        if let Some(p) = self.players.get_mut(seat).as_mut() {
            p.choice = Some(side);
        }
        let complete = self.choices().is_some();
        out.emit(now_ms, MatchEventData::ChoiceMade { seat, phase_complete: complete });
        if complete {
            self.enter(MatchPhase::Charging, now_ms, out);
        }
    }

    fn choices(&self) -> Option<Seats<Side>> {
        let creator = self.player(Seat::Creator)?.choice?;
        let opponent = self.player(Seat::Opponent)?.choice?;
        Some(Seats::new(creator, opponent))
    }

    fn begin_charge(&mut self, seat: Seat, now_ms: u64, out: &mut StepResult) {
        if self.resolver.meter().is_charging(seat) {
            return;
        }
        self.touch(seat);
        if self.resolver.begin_charge(seat, now_ms).is_err() {
            return;
        }
        let power = self.resolver.tick(seat, now_ms);
        out.emit(now_ms, MatchEventData::PowerUpdated { seat, power });
        out.schedule(TimerKind::PowerTick, self.rules.power_tick_ms);
    }

    fn power_tick(&mut self, now_ms: u64, out: &mut StepResult) {
        let seat = Seat::turn_holder(self.round);
        if !self.resolver.meter().is_charging(seat) {
            return;
        }
        let before = self.resolver.meter().level(seat);
        let power = self.resolver.tick(seat, now_ms);
        if power != before {
            self.sync_power();
            out.emit(now_ms, MatchEventData::PowerUpdated { seat, power });
        }
        if power < self.resolver.meter().max() {
            out.schedule(TimerKind::PowerTick, self.rules.power_tick_ms);
        }
    }

    fn sync_power(&mut self) {
        let levels = self.resolver.meter().levels();
        for seat in Seat::BOTH {
            if let Some(p) = self.players.get_mut(seat).as_mut() {
                p.power = *levels.get(seat);
            }
        }
    }

    /// Seat that timed out too often while the other did not.
    fn abandoned_seat(&self) -> Option<Seat> {
        let limit = self.rules.abandon_after_timeouts;
        if limit == 0 {
            return None;
        }
        let over: Vec<Seat> = Seat::BOTH
            .into_iter()
            .filter(|s| self.player(*s).map(|p| p.consecutive_timeouts >= limit).unwrap_or(false))
            .collect();
        match over.as_slice() {
            [seat] => Some(*seat),
            _ => None,
        }
    }

    fn choosing_timeout(&mut self, now_ms: u64, out: &mut StepResult) {
        let holder = Seat::turn_holder(self.round);
        let holder_absent = self.player(holder).map(|p| p.choice.is_none()).unwrap_or(true);

        for seat in Seat::BOTH {
            if self.player(seat).map(|p| p.choice.is_some()).unwrap_or(true) {
                continue;
            }
            // Not a uniform draw: the opposite of the other seat's choice,
            // so an auto-choice never voids the round. The coin alone
            // decides the winner, so the odds are unchanged. Uniform only
            // when nobody has chosen.
            let side = match self.player(seat.other()).and_then(|p| p.choice) {
                Some(other) => other.opposite(),
                None => self.resolver.random_side(),
            };
            if let Some(p) = self.players.get_mut(seat).as_mut() {
                p.choice = Some(side);
                p.consecutive_timeouts += 1;
            }
            out.emit(now_ms, MatchEventData::AutoActed { seat, action: AutoAction::Choice { side } });
            out.emit(now_ms, MatchEventData::ChoiceMade { seat, phase_complete: self.choices().is_some() });
        }

        if let Some(absent) = self.abandoned_seat() {
            self.complete(absent.other(), CompletionReason::Forfeit { absent }, now_ms, out);
            return;
        }

        self.enter(MatchPhase::Charging, now_ms, out);
        if holder_absent {
            // Nobody is there to charge; flip now.
            self.auto_release(now_ms, out);
        }
    }

    fn charging_timeout(&mut self, now_ms: u64, out: &mut StepResult) {
        let holder = Seat::turn_holder(self.round);
        // Holding through the deadline still counts as present.
        if !self.resolver.meter().is_charging(holder) {
            if let Some(p) = self.players.get_mut(holder).as_mut() {
                p.consecutive_timeouts += 1;
            }
        }
        if let Some(absent) = self.abandoned_seat() {
            self.complete(absent.other(), CompletionReason::Forfeit { absent }, now_ms, out);
            return;
        }
        self.auto_release(now_ms, out);
    }

    fn auto_release(&mut self, now_ms: u64, out: &mut StepResult) {
        let holder = Seat::turn_holder(self.round);
        let mut power = self.resolver.tick(holder, now_ms);
        if self.tracker.next_round_decides_tied() {
            let max = self.resolver.meter().max();
            power = self.resolver.meter_mut().raise_to(holder, max);
        }
        out.emit(now_ms, MatchEventData::AutoActed { seat: holder, action: AutoAction::Release { power } });
        self.resolve_round(now_ms, out);
    }

    fn resolve_round(&mut self, now_ms: u64, out: &mut StepResult) {
        let holder = Seat::turn_holder(self.round);
        let Some(choices) = self.choices() else {
            self.fail("charging without both choices".into(), now_ms, out);
            return;
        };

        let outcome = self.resolver.release(holder, choices, now_ms);
        self.sync_power();
        self.last_outcome = Some(outcome);

        match outcome {
            RoundOutcome::Void { side, shared_choice, .. } => {
                self.voided_rounds += 1;
                out.emit(now_ms, MatchEventData::RoundVoided { round: self.round, side, shared_choice });
            }
            RoundOutcome::Decided { side, winner, combined_power } => {
                let record = RoundRecord {
                    index: self.round,
                    choices,
                    side,
                    winner,
                    combined_power,
                    display_ms: self.rules.result_display_ms(combined_power),
                };
                if let Err(e) = self.tracker.record(record.clone()) {
                    self.fail(e.to_string(), now_ms, out);
                    return;
                }
                out.emit(now_ms, MatchEventData::RoundResolved { record, scores: self.tracker.scores() });
            }
        }

        self.enter(MatchPhase::Result, now_ms, out);
    }

    fn after_result(&mut self, now_ms: u64, out: &mut StepResult) {
        match self.last_outcome {
            Some(RoundOutcome::Void { .. }) => self.start_round(self.round, now_ms, out),
            _ => match self.tracker.match_winner() {
                Some(winner) => self.complete(winner, CompletionReason::Decided, now_ms, out),
                None => self.start_round(self.round + 1, now_ms, out),
            },
        }
    }

    fn complete(&mut self, winner: Seat, reason: CompletionReason, now_ms: u64, out: &mut StepResult) {
        self.enter(MatchPhase::Completed, now_ms, out);
        self.completion = Some(Completion { winner, reason });
        out.emit(
            now_ms,
            MatchEventData::MatchCompleted { winner, final_score: self.tracker.scores(), reason },
        );
        self.open_settlement(SettlementJob::Payout { winner }, now_ms, out);
    }

    fn fail(&mut self, reason: String, now_ms: u64, out: &mut StepResult) {
        self.enter(MatchPhase::Errored, now_ms, out);
        out.emit(now_ms, MatchEventData::MatchErrored { reason });
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    fn job_command(job: &SettlementJob) -> SettlementCommand {
        match job {
            SettlementJob::Payout { winner } => SettlementCommand::Payout { winner: *winner },
            SettlementJob::Refund { remaining } => SettlementCommand::Refund { seats: remaining.clone() },
        }
    }

    fn open_settlement(&mut self, job: SettlementJob, now_ms: u64, out: &mut StepResult) {
        let attempts = if self.settlement.is_open() { self.settlement.attempts() } else { 0 };
        self.settlement_job = Some(job);
        if self.settlement_in_flight {
            // the outstanding call's report dispatches the updated job
            return;
        }
        out.cancel(TimerKind::SettlementRetry);
        self.dispatch_settlement(attempts + 1, now_ms, out);
    }

    /// Hand the current job to custody. At most one call is outstanding.
    fn dispatch_settlement(&mut self, attempts: u32, now_ms: u64, out: &mut StepResult) {
        let Some(job) = &self.settlement_job else {
            return;
        };
        out.settlement.push(Self::job_command(job));
        self.settlement_in_flight = true;
        self.set_settlement(SettlementStatus::Pending { attempts }, now_ms, out);
    }

    fn set_settlement(&mut self, status: SettlementStatus, now_ms: u64, out: &mut StepResult) {
        self.settlement = status.clone();
        out.emit(now_ms, MatchEventData::SettlementUpdated { status });
    }

    fn retry_settlement(&mut self, now_ms: u64, out: &mut StepResult) {
        if self.settlement_in_flight || !matches!(self.settlement, SettlementStatus::Pending { .. }) {
            return;
        }
        let attempts = self.settlement.attempts() + 1;
        self.dispatch_settlement(attempts, now_ms, out);
    }

    fn settlement_failed(&mut self, reason: String, now_ms: u64, out: &mut StepResult) {
        let attempts = self.settlement.attempts().max(1);
        let policy = self.rules.settlement_retry;
        if policy.can_retry(attempts) {
            out.schedule(TimerKind::SettlementRetry, policy.delay_for(attempts));
            self.set_settlement(SettlementStatus::Pending { attempts }, now_ms, out);
        } else {
            self.set_settlement(SettlementStatus::Failed { attempts, reason }, now_ms, out);
        }
    }

    /// A submitted payout was never confirmed. Resubmitting could pay twice,
    /// so this goes to manual intervention.
    fn confirmation_timeout(&mut self, now_ms: u64, out: &mut StepResult) {
        if let SettlementStatus::AwaitingConfirmation { attempts, .. } = self.settlement {
            let reason = "confirmation_timeout".to_string();
            self.set_settlement(SettlementStatus::Failed { attempts, reason }, now_ms, out);
        }
    }

    fn settlement_report(
        &mut self,
        report: SettlementReport,
        answers_call: bool,
        now_ms: u64,
        out: &mut StepResult,
    ) {
        // custody may still confirm a payout after we gave up waiting
        let late_confirmation = matches!(report, SettlementReport::Confirmed { .. })
            && matches!(self.settlement, SettlementStatus::Failed { .. })
            && matches!(self.settlement_job, Some(SettlementJob::Payout { .. }));
        if self.settlement_job.is_none() || !(self.settlement.is_open() || late_confirmation) {
            return;
        }
        if answers_call {
            self.settlement_in_flight = false;
        }

        match report {
            SettlementReport::Confirmed { reference } => {
                out.cancel(TimerKind::SettlementRetry);
                out.cancel(TimerKind::SettlementConfirmation);
                let reference = reference.or_else(|| match &self.settlement {
                    SettlementStatus::AwaitingConfirmation { reference, .. } => Some(reference.clone()),
                    _ => None,
                });
                self.set_settlement(SettlementStatus::Settled { reference }, now_ms, out);
            }
            SettlementReport::Submitted { reference } => {
                let attempts = self.settlement.attempts();
                out.schedule(
                    TimerKind::SettlementConfirmation,
                    self.rules.settlement_retry.confirm_timeout_ms,
                );
                self.set_settlement(
                    SettlementStatus::AwaitingConfirmation { reference, attempts },
                    now_ms,
                    out,
                );
            }
            SettlementReport::Failed { reason } => {
                if self.settlement_in_flight {
                    // the outstanding call decides what happens next
                    return;
                }
                out.cancel(TimerKind::SettlementConfirmation);
                self.settlement_failed(reason, now_ms, out);
            }
            SettlementReport::Refunded { released, failure } => {
                let done = match self.settlement_job.as_mut() {
                    Some(SettlementJob::Refund { remaining }) => {
                        remaining.retain(|s| !released.contains(s));
                        remaining.is_empty()
                    }
                    _ => false,
                };
                if done {
                    self.set_settlement(SettlementStatus::Settled { reference: None }, now_ms, out);
                    return;
                }
                let attempts = self.settlement.attempts();
                match failure {
                    // seats added while the call was out
                    None if self.rules.settlement_retry.can_retry(attempts) => {
                        self.dispatch_settlement(attempts + 1, now_ms, out);
                    }
                    failure => {
                        let reason = failure.unwrap_or_else(|| "refund incomplete".to_string());
                        self.settlement_failed(reason, now_ms, out);
                    }
                }
            }
        }
    }
}

fn action_name(action: ActionKind) -> &'static str {
    match action {
        ActionKind::SubmitChoice => "submit_choice",
        ActionKind::BeginCharge => "begin_charge",
        ActionKind::ReleaseCharge => "release_charge",
        ActionKind::ConfirmDeposit => "confirm_deposit",
    }
}
