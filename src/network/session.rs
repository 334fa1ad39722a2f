//! Match Session
//!
//! One actor per match. Connection actions, timer expiries and custody
//! results all arrive on the match's command queue and are applied to the
//! [`MatchMachine`] one at a time. After every accepted mutation the actor
//! broadcasts the resulting events followed by exactly one snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::ids::{ConnectionId, MatchId, WalletAddress};
use crate::core::rng::FlipRng;
use crate::game::events::{MatchEvent, MatchEventData};
use crate::game::machine::{
    MatchError, MatchInput, MatchMachine, SeatRole, SettlementCommand, SettlementReport, StepResult,
    TimerKind,
};
use crate::game::power::CoinSource;
use crate::game::state::{ActionKind, AssetProof, MatchListing, Seat, Seats, Side};
use crate::network::auth::ConnectionBinding;
use crate::network::protocol::{
    ErrorCode, MatchSnapshot, PlayerView, ServerMessage, SettlementView,
};
use crate::network::timer::TimerSet;
use crate::settlement::{CustodyError, DepositRequest, PayoutRequest, ReleaseRequest, SettlementBridge};

/// Command queue depth per match.
const COMMAND_BUFFER: usize = 256;

/// A player action routed to a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerAction {
    /// Pick a side.
    SubmitChoice(Side),
    /// Start charging.
    BeginCharge,
    /// Release and flip.
    ReleaseCharge,
    /// Report a deposit.
    ConfirmDeposit(AssetProof),
}

/// Session-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No live session for this match.
    #[error("unknown match {0}")]
    UnknownMatch(MatchId),
    /// Sender is not seated in this match.
    #[error("not a participant in this match")]
    NotAParticipant,
    /// Rejected by the state machine.
    #[error(transparent)]
    Match(#[from] MatchError),
    /// The match actor has stopped.
    #[error("match session closed")]
    Closed,
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::UnknownMatch(_) => ErrorCode::UnknownMatch,
            SessionError::NotAParticipant => ErrorCode::NotAParticipant,
            SessionError::Match(e) => match e {
                MatchError::IllegalPhaseTransition { .. } => ErrorCode::IllegalPhaseTransition,
                MatchError::NotYourTurn { .. } => ErrorCode::NotYourTurn,
                MatchError::ChoiceAlreadyMade => ErrorCode::ChoiceAlreadyMade,
                MatchError::NotAParticipant => ErrorCode::NotAParticipant,
            },
            SessionError::Closed => ErrorCode::InternalError,
        }
    }
}

/// Messages on a match's command queue.
pub enum SessionCommand {
    /// Bind a connection (seat or spectate).
    Join {
        /// Authenticated binding.
        binding: ConnectionBinding,
        /// Outbound channel for this connection.
        outbound: mpsc::Sender<ServerMessage>,
        /// Granted role.
        reply: oneshot::Sender<SeatRole>,
    },
    /// Connection went away.
    Leave {
        /// Connection.
        connection: ConnectionId,
    },
    /// Player action.
    Action {
        /// Sending connection.
        connection: ConnectionId,
        /// What they asked for.
        action: PlayerAction,
        /// Outcome, for the error reply.
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Custody answered a deposit check.
    DepositVerified {
        /// Seat.
        seat: Seat,
        /// Receipt or failure.
        result: Result<String, CustodyError>,
    },
    /// Operator skips deposit confirmation.
    OperatorStart {
        /// Outcome.
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// A timer expired.
    TimerFired {
        /// Which timer.
        kind: TimerKind,
        /// Generation it was armed with.
        generation: u64,
    },
    /// A custody call made by this match returned.
    Settlement(SettlementReport),
    /// Custody reported out of band.
    SettlementNotice(SettlementReport),
    /// Resend the snapshot to one connection.
    Sync {
        /// Connection.
        connection: ConnectionId,
    },
    /// Send a message to everyone bound.
    Broadcast(ServerMessage),
    /// Stop the actor.
    Shutdown,
}

impl SessionCommand {
    #[cfg_attr(not(feature = "debug-tracing"), allow(dead_code))]
    fn name(&self) -> &'static str {
        match self {
            SessionCommand::Join { .. } => "join",
            SessionCommand::Leave { .. } => "leave",
            SessionCommand::Action { .. } => "action",
            SessionCommand::DepositVerified { .. } => "deposit_verified",
            SessionCommand::OperatorStart { .. } => "operator_start",
            SessionCommand::TimerFired { .. } => "timer_fired",
            SessionCommand::Settlement(_) => "settlement",
            SessionCommand::SettlementNotice(_) => "settlement_notice",
            SessionCommand::Sync { .. } => "sync",
            SessionCommand::Broadcast(_) => "broadcast",
            SessionCommand::Shutdown => "shutdown",
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable handle to a running match.
#[derive(Clone, Debug)]
pub struct MatchHandle {
    match_id: MatchId,
    tx: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<MatchSnapshot>,
}

impl MatchHandle {
    /// Match id.
    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    /// Latest published snapshot, without touching the queue.
    pub fn snapshot(&self) -> MatchSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch snapshots as they are published.
    pub fn subscribe(&self) -> watch::Receiver<MatchSnapshot> {
        self.snapshot.clone()
    }

    /// Actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn sender(&self) -> &mpsc::Sender<SessionCommand> {
        &self.tx
    }

    /// Post a command.
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    /// Bind a connection.
    pub async fn join(
        &self,
        binding: ConnectionBinding,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<SeatRole, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Join { binding, outbound, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Unbind a connection.
    pub async fn leave(&self, connection: ConnectionId) {
        let _ = self.send(SessionCommand::Leave { connection }).await;
    }

    /// Route a player action.
    pub async fn act(&self, connection: ConnectionId, action: PlayerAction) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Action { connection, action, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Operator override for a locked match.
    pub async fn operator_start(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::OperatorStart { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Subscriber {
    address: WalletAddress,
    role: SeatRole,
    outbound: mpsc::Sender<ServerMessage>,
}

/// The match actor.
pub struct MatchSession {
    machine: MatchMachine,
    timers: TimerSet,
    bridge: SettlementBridge,
    tx: mpsc::WeakSender<SessionCommand>,
    subscribers: BTreeMap<ConnectionId, Subscriber>,
    snapshot_tx: watch::Sender<MatchSnapshot>,
    clock: Instant,
    created_at: DateTime<Utc>,
}

impl MatchSession {
    /// Spawn the actor for a listing with a fresh flip RNG.
    pub fn spawn(listing: &MatchListing, bridge: SettlementBridge) -> MatchHandle {
        let coin = FlipRng::for_match(&listing.match_id);
        Self::spawn_with_coin(listing, Box::new(coin), bridge)
    }

    /// Spawn the actor with a given coin source.
    pub fn spawn_with_coin(
        listing: &MatchListing,
        coin: Box<dyn CoinSource>,
        bridge: SettlementBridge,
    ) -> MatchHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let machine = MatchMachine::new(listing, coin);
        let created_at = Utc::now();
        let (snapshot_tx, snapshot_rx) = watch::channel(build_snapshot(&machine, 0, created_at));

        let session = Self {
            machine,
            timers: TimerSet::new(&tx),
            bridge,
            tx: tx.downgrade(),
            subscribers: BTreeMap::new(),
            snapshot_tx,
            clock: Instant::now(),
            created_at,
        };
        tokio::spawn(session.run(rx));

        MatchHandle { match_id: listing.match_id, tx, snapshot: snapshot_rx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let match_id = self.machine.id();
        info!(%match_id, "match session started");

        while let Some(command) = rx.recv().await {
            #[cfg(feature = "debug-tracing")]
            debug!(%match_id, command = command.name(), phase = ?self.machine.phase(), "command");

            if !self.handle(command) {
                break;
            }
        }

        self.timers.cancel_all();
        info!(%match_id, phase = ?self.machine.phase(), "match session stopped");
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn handle(&mut self, command: SessionCommand) -> bool {
        let now = self.now_ms();
        match command {
            SessionCommand::Join { binding, outbound, reply } => {
                let connection = binding.connection;
                let (role, step) = self.machine.bind(&binding.address, connection, now);
                info!(
                    match_id = %self.machine.id(),
                    address = %binding.address.short(),
                    %connection,
                    ?role,
                    "connection joined"
                );
                if let SeatRole::Player(seat) = role {
                    self.demote_previous(seat, connection);
                }
                self.subscribers.insert(
                    connection,
                    Subscriber { address: binding.address, role, outbound },
                );

                let mutated = step.mutated;
                self.execute(step, now);
                if !mutated {
                    let snapshot = self.publishable(now);
                    self.send_to(connection, ServerMessage::MatchSnapshot(Box::new(snapshot)));
                }
                let _ = reply.send(role);
            }
            SessionCommand::Leave { connection } => {
                if let Some(subscriber) = self.subscribers.remove(&connection) {
                    debug!(match_id = %self.machine.id(), address = %subscriber.address.short(), "connection left");
                    let step = self.machine.unbind(connection, now);
                    self.execute(step, now);
                }
            }
            SessionCommand::Action { connection, action, reply } => {
                let result = self.act(connection, action, now);
                if let Err(e) = &result {
                    debug!(match_id = %self.machine.id(), %connection, error = %e, "action rejected");
                }
                let _ = reply.send(result);
            }
            SessionCommand::DepositVerified { seat, result } => {
                let input = match result {
                    Ok(receipt) => MatchInput::DepositConfirmed { seat, receipt },
                    Err(e) => MatchInput::DepositRejected { seat, reason: e.reason_code().to_string() },
                };
                self.apply(input, now);
            }
            SessionCommand::OperatorStart { reply } => {
                let result = match self.machine.apply(MatchInput::OperatorStart, now) {
                    Ok(step) => {
                        info!(match_id = %self.machine.id(), "operator started match");
                        self.execute(step, now);
                        Ok(())
                    }
                    Err(e) => Err(SessionError::from(e)),
                };
                let _ = reply.send(result);
            }
            SessionCommand::TimerFired { kind, generation } => {
                if self.timers.take_if_current(kind, generation) {
                    self.apply(MatchInput::TimerExpired(kind), now);
                } else {
                    debug!(match_id = %self.machine.id(), ?kind, generation, "stale timer ignored");
                }
            }
            SessionCommand::Settlement(report) => self.apply(MatchInput::Settlement(report), now),
            SessionCommand::SettlementNotice(report) => {
                self.apply(MatchInput::SettlementNotice(report), now)
            }
            SessionCommand::Sync { connection } => {
                let snapshot = self.publishable(now);
                self.send_to(connection, ServerMessage::MatchSnapshot(Box::new(snapshot)));
            }
            SessionCommand::Broadcast(message) => self.deliver(&message),
            SessionCommand::Shutdown => return false,
        }
        true
    }

    /// A seat has one active connection; older ones for it keep watching.
    fn demote_previous(&mut self, seat: Seat, connection: ConnectionId) {
        for (id, subscriber) in self.subscribers.iter_mut() {
            if *id != connection && subscriber.role == SeatRole::Player(seat) {
                debug!(match_id = %self.machine.id(), connection = %id, ?seat, "seat moved to a new connection");
                subscriber.role = SeatRole::Spectator;
            }
        }
    }

    fn act(&mut self, connection: ConnectionId, action: PlayerAction, now: u64) -> Result<(), SessionError> {
        let seat = self
            .machine
            .seat_of_connection(connection)
            .ok_or(SessionError::NotAParticipant)?;

        let input = match action {
            PlayerAction::SubmitChoice(side) => MatchInput::SubmitChoice { seat, side },
            PlayerAction::BeginCharge => MatchInput::BeginCharge { seat },
            PlayerAction::ReleaseCharge => MatchInput::ReleaseCharge { seat },
            PlayerAction::ConfirmDeposit(proof) => {
                self.machine.check_action(seat, ActionKind::ConfirmDeposit)?;
                self.verify_deposit(seat, proof);
                return Ok(());
            }
        };

        let step = self.machine.apply(input, now)?;
        self.execute(step, now);
        Ok(())
    }

    fn apply(&mut self, input: MatchInput, now: u64) {
        match self.machine.apply(input, now) {
            Ok(step) => self.execute(step, now),
            Err(e) => warn!(match_id = %self.machine.id(), error = %e, "internal input rejected"),
        }
    }

    fn execute(&mut self, step: StepResult, now: u64) {
        self.timers.apply(&step.timers);
        for command in &step.settlement {
            self.start_settlement(command);
        }
        for event in &step.events {
            self.log_event(event);
            let message = self.event_message(event, now);
            self.deliver(&message);
        }
        if step.mutated {
            let snapshot = self.publishable(now);
            self.snapshot_tx.send_replace(snapshot.clone());
            self.deliver(&ServerMessage::MatchSnapshot(Box::new(snapshot)));
        }
    }

    fn publishable(&self, now: u64) -> MatchSnapshot {
        build_snapshot(&self.machine, now, self.created_at)
    }

    // -------------------------------------------------------------------------
    // Custody
    // -------------------------------------------------------------------------

    fn verify_deposit(&self, seat: Seat, proof: AssetProof) {
        let Some(player) = self.machine.player(seat) else {
            return;
        };
        if player.has_deposited() {
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let request = DepositRequest {
            match_id: self.machine.id(),
            seat,
            depositor: player.address.clone(),
            stake: self.machine.stake().clone(),
            proof,
        };
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let result = bridge.confirm_deposit(request).await;
            let _ = tx.send(SessionCommand::DepositVerified { seat, result }).await;
        });
    }

    fn start_settlement(&self, command: &SettlementCommand) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let match_id = self.machine.id();
        let stake = self.machine.stake().clone();
        let bridge = self.bridge.clone();

        match command {
            SettlementCommand::Payout { winner } => {
                let (Some(w), Some(l)) = (self.machine.player(*winner), self.machine.player(winner.other()))
                else {
                    warn!(%match_id, "payout requested without both seats");
                    // the machine waits on a report for every call
                    let report = SettlementReport::Failed { reason: "missing_seat".to_string() };
                    tokio::spawn(async move {
                        let _ = tx.send(SessionCommand::Settlement(report)).await;
                    });
                    return;
                };
                let request = PayoutRequest {
                    match_id,
                    winner: w.address.clone(),
                    loser: l.address.clone(),
                    stake,
                };
                info!(%match_id, winner = %request.winner.short(), "requesting payout");
                tokio::spawn(async move {
                    let report = bridge.request_settlement(request).await;
                    let _ = tx.send(SessionCommand::Settlement(report)).await;
                });
            }
            SettlementCommand::Refund { seats } => {
                let requests: Vec<ReleaseRequest> = seats
                    .iter()
                    .filter_map(|seat| {
                        self.machine.player(*seat).map(|p| ReleaseRequest {
                            match_id,
                            seat: *seat,
                            owner: p.address.clone(),
                            stake: stake.clone(),
                        })
                    })
                    .collect();
                info!(%match_id, seats = ?seats, "releasing deposits");
                tokio::spawn(async move {
                    let report = bridge.release_deposits(requests).await;
                    let _ = tx.send(SessionCommand::Settlement(report)).await;
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    fn log_event(&self, event: &MatchEvent) {
        let match_id = self.machine.id();
        match &event.data {
            MatchEventData::PhaseChanged { from, to } => {
                info!(%match_id, ?from, ?to, round = self.machine.round(), "phase changed");
            }
            MatchEventData::RoundResolved { record, scores } => {
                info!(%match_id, round = record.index, winner = ?record.winner, side = ?record.side,
                    creator = scores.creator, opponent = scores.opponent, "round resolved");
            }
            MatchEventData::RoundVoided { round, .. } => {
                info!(%match_id, round, "round voided, both chose the same side");
            }
            MatchEventData::MatchCompleted { winner, reason, .. } => {
                info!(%match_id, ?winner, ?reason, "match completed");
            }
            MatchEventData::MatchErrored { reason } => {
                warn!(%match_id, %reason, "match errored");
            }
            MatchEventData::SettlementUpdated { status } => {
                info!(%match_id, ?status, "settlement status");
            }
            other => debug!(%match_id, seat = ?event.seat, event = ?other, "match event"),
        }
    }

    fn event_message(&self, event: &MatchEvent, now: u64) -> ServerMessage {
        match &event.data {
            MatchEventData::PlayerSeated { seat, .. } | MatchEventData::PlayerReconnected { seat } => {
                ServerMessage::Presence { player: *seat, connected: true }
            }
            MatchEventData::PlayerDisconnected { seat } => {
                ServerMessage::Presence { player: *seat, connected: false }
            }
            MatchEventData::PhaseChanged { to, .. } => ServerMessage::PhaseChanged {
                phase: *to,
                round: self.machine.round(),
                deadline_in_ms: if *to == self.machine.phase() {
                    self.machine.deadline_remaining(now)
                } else {
                    None
                },
            },
            MatchEventData::DepositConfirmed { seat } => {
                ServerMessage::DepositUpdate { player: *seat, confirmed: true, reason: None }
            }
            MatchEventData::DepositRejected { seat, reason } => ServerMessage::DepositUpdate {
                player: *seat,
                confirmed: false,
                reason: Some(reason.clone()),
            },
            MatchEventData::ChoiceMade { seat, phase_complete } => {
                ServerMessage::ChoiceUpdate { player: *seat, phase_complete: *phase_complete }
            }
            MatchEventData::AutoActed { seat, action } => {
                ServerMessage::AutoAction { player: *seat, action: *action }
            }
            MatchEventData::PowerUpdated { seat, power } => {
                ServerMessage::PowerUpdate { player: *seat, power: *power }
            }
            MatchEventData::RoundResolved { record, scores } => {
                ServerMessage::RoundResult { outcome: record.clone(), scores: *scores }
            }
            MatchEventData::RoundVoided { round, side, shared_choice } => {
                ServerMessage::RoundVoided { round: *round, side: *side, shared_choice: *shared_choice }
            }
            MatchEventData::MatchCompleted { winner, final_score, reason } => {
                ServerMessage::MatchCompleted { winner: *winner, final_score: *final_score, reason: *reason }
            }
            MatchEventData::MatchCancelled { reason } => ServerMessage::MatchCancelled { reason: *reason },
            MatchEventData::MatchErrored { reason } => ServerMessage::MatchErrored { reason: reason.clone() },
            MatchEventData::SettlementUpdated { status } => ServerMessage::SettlementStatus {
                status: SettlementView::new(self.machine.settlement_job(), status),
            },
        }
    }

    fn deliver(&self, message: &ServerMessage) {
        for (connection, subscriber) in &self.subscribers {
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.outbound.try_send(message.clone()) {
                warn!(match_id = %self.machine.id(), %connection, "outbound queue full, message dropped");
            }
        }
    }

    fn send_to(&self, connection: ConnectionId, message: ServerMessage) {
        if let Some(subscriber) = self.subscribers.get(&connection) {
            let _ = subscriber.outbound.try_send(message);
        }
    }
}

/// Snapshot of a machine at `now_ms` on its clock.
pub fn build_snapshot(machine: &MatchMachine, now_ms: u64, created_at: DateTime<Utc>) -> MatchSnapshot {
    let view = |seat: Seat| {
        machine.player(seat).map(|p| PlayerView {
            address: p.address.clone(),
            connected: p.is_connected(),
            has_chosen: p.choice.is_some(),
            power: p.power,
            deposited: p.has_deposited(),
            consecutive_timeouts: p.consecutive_timeouts,
        })
    };

    MatchSnapshot {
        match_id: machine.id(),
        phase: machine.phase(),
        round: machine.round(),
        round_target: machine.rules().round_target,
        turn_holder: machine.turn_holder(),
        deadline_in_ms: machine.deadline_remaining(now_ms),
        players: Seats::new(view(Seat::Creator), view(Seat::Opponent)),
        scores: machine.tracker().scores(),
        rounds: machine.tracker().log().to_vec(),
        voided_rounds: machine.voided_rounds(),
        stake: machine.stake().clone(),
        completion: machine.completion(),
        settlement: SettlementView::new(machine.settlement_job(), machine.settlement()),
        version: machine.version(),
        created_at,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::game::machine::SettlementStatus;
    use crate::game::power::tests::ScriptedCoin;
    use crate::game::rules::MatchRules;
    use crate::game::state::{MatchPhase, StakeDescriptor};
    use crate::settlement::InMemoryCustody;

    pub(crate) fn listing(id: u8) -> MatchListing {
        MatchListing::open(
            MatchId::new([id; 16]),
            StakeDescriptor { asset: "nft-mint".into(), equivalent_value: 2_500 },
            MatchRules::default(),
        )
    }

    fn binding(match_id: MatchId, key: u8, conn: u8) -> ConnectionBinding {
        ConnectionBinding {
            connection: ConnectionId([conn; 16]),
            address: WalletAddress::from_key_bytes([key; 32]),
            match_id,
            bound_at: Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    struct Table {
        handle: MatchHandle,
        custody: InMemoryCustody,
        creator: (ConnectionBinding, mpsc::Receiver<ServerMessage>),
        opponent: (ConnectionBinding, mpsc::Receiver<ServerMessage>),
    }

    async fn table(coin: ScriptedCoin) -> Table {
        let custody = InMemoryCustody::new();
        let bridge = SettlementBridge::new(Arc::new(custody.clone()), Duration::from_secs(15));
        let l = listing(1);
        let handle = MatchSession::spawn_with_coin(&l, Box::new(coin), bridge);

        let (ctx, crx) = mpsc::channel(512);
        let (otx, orx) = mpsc::channel(512);
        let creator = binding(l.match_id, 1, 1);
        let opponent = binding(l.match_id, 2, 2);
        assert_eq!(handle.join(creator.clone(), ctx).await.unwrap(), SeatRole::Player(Seat::Creator));
        assert_eq!(handle.join(opponent.clone(), otx).await.unwrap(), SeatRole::Player(Seat::Opponent));

        Table { handle, custody, creator: (creator, crx), opponent: (opponent, orx) }
    }

    async fn deposit(t: &Table, seat: Seat, proof: &str) {
        let conn = match seat {
            Seat::Creator => t.creator.0.connection,
            Seat::Opponent => t.opponent.0.connection,
        };
        t.handle
            .act(conn, PlayerAction::ConfirmDeposit(AssetProof { reference: proof.into() }))
            .await
            .unwrap();
        // let the verification task report back
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposit_timeout_releases_creator_only() {
        let t = table(ScriptedCoin::always(Side::Heads)).await;
        assert_eq!(t.handle.snapshot().phase, MatchPhase::Locked);

        deposit(&t, Seat::Creator, "tx-creator").await;
        assert!(t.handle.snapshot().players.creator.unwrap().deposited);

        tokio::time::sleep(Duration::from_secs(121)).await;

        let snapshot = t.handle.snapshot();
        assert_eq!(snapshot.phase, MatchPhase::Cancelled);
        assert_eq!(snapshot.settlement.label, "refunded");
        let releases = t.custody.releases().await;
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].seat, Seat::Creator);
        assert_eq!(releases[0].owner, t.creator.0.address);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_precede_exactly_one_snapshot() {
        let mut t = table(ScriptedCoin::always(Side::Heads)).await;
        t.handle.operator_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_001)).await;
        assert_eq!(t.handle.snapshot().phase, MatchPhase::Choosing);
        drain(&mut t.opponent.1);

        t.handle
            .act(t.creator.0.connection, PlayerAction::SubmitChoice(Side::Heads))
            .await
            .unwrap();
        let messages = drain(&mut t.opponent.1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ServerMessage::ChoiceUpdate { player: Seat::Creator, phase_complete: false });
        assert!(matches!(messages[1], ServerMessage::MatchSnapshot(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_action_does_not_broadcast() {
        let mut t = table(ScriptedCoin::always(Side::Heads)).await;
        drain(&mut t.opponent.1);
        let err = t
            .handle
            .act(t.creator.0.connection, PlayerAction::BeginCharge)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IllegalPhaseTransition);
        assert!(drain(&mut t.opponent.1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spectator_cannot_act() {
        let t = table(ScriptedCoin::always(Side::Heads)).await;
        let (stx, mut srx) = mpsc::channel(64);
        let spectator = binding(t.handle.match_id(), 3, 3);
        assert_eq!(t.handle.join(spectator.clone(), stx).await.unwrap(), SeatRole::Spectator);
        assert!(matches!(drain(&mut srx).last(), Some(ServerMessage::MatchSnapshot(_))));

        let err = t
            .handle
            .act(spectator.connection, PlayerAction::SubmitChoice(Side::Tails))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotAParticipant);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_identical_state() {
        let t = table(ScriptedCoin::always(Side::Heads)).await;
        t.handle.operator_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_001)).await;
        t.handle
            .act(t.opponent.0.connection, PlayerAction::SubmitChoice(Side::Tails))
            .await
            .unwrap();
        let before = t.handle.snapshot();

        t.handle.leave(t.creator.0.connection).await;
        let (ntx, mut nrx) = mpsc::channel(64);
        let rejoin = ConnectionBinding { connection: ConnectionId([11; 16]), ..t.creator.0.clone() };
        assert_eq!(t.handle.join(rejoin, ntx).await.unwrap(), SeatRole::Player(Seat::Creator));

        let mut after = t.handle.snapshot();
        assert_eq!(after.version, before.version + 2);
        after.version = before.version;
        assert_eq!(after, before);

        let last = drain(&mut nrx).pop();
        assert_eq!(last, Some(ServerMessage::MatchSnapshot(Box::new(t.handle.snapshot()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_deposit_during_refund_releases_each_stake_once() {
        let t = table(ScriptedCoin::always(Side::Heads)).await;
        deposit(&t, Seat::Creator, "tx-creator").await;
        t.custody.set_delay(Some(Duration::from_secs(2))).await;

        // verified only after the deposit window has closed
        tokio::time::sleep(Duration::from_secs(119)).await;
        t.handle
            .act(
                t.opponent.0.connection,
                PlayerAction::ConfirmDeposit(AssetProof { reference: "tx-opponent".into() }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let snapshot = t.handle.snapshot();
        assert_eq!(snapshot.phase, MatchPhase::Cancelled);
        assert_eq!(snapshot.settlement.label, "refunded");
        let released: Vec<Seat> = t.custody.releases().await.iter().map(|r| r.seat).collect();
        assert_eq!(released, vec![Seat::Creator, Seat::Opponent]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_connection_loses_its_seat() {
        let t = table(ScriptedCoin::always(Side::Heads)).await;
        t.handle.operator_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_001)).await;

        // same wallet on a second socket, without leaving the first
        let (ntx, _nrx) = mpsc::channel(64);
        let replacement = ConnectionBinding { connection: ConnectionId([11; 16]), ..t.creator.0.clone() };
        assert_eq!(t.handle.join(replacement.clone(), ntx).await.unwrap(), SeatRole::Player(Seat::Creator));

        let err = t
            .handle
            .act(t.creator.0.connection, PlayerAction::SubmitChoice(Side::Heads))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotAParticipant);

        t.handle
            .act(replacement.connection, PlayerAction::SubmitChoice(Side::Heads))
            .await
            .unwrap();
        assert!(t.handle.snapshot().players.creator.unwrap().has_chosen);

        // the old socket going away does not unseat the new one
        t.handle.leave(t.creator.0.connection).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(t.handle.snapshot().players.creator.unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_match_pays_out_after_retries() {
        let mut t = table(ScriptedCoin::always(Side::Heads)).await;
        t.custody.fail_settlements(2, CustodyError::Unavailable).await;
        deposit(&t, Seat::Creator, "tx-a").await;
        deposit(&t, Seat::Opponent, "tx-b").await;
        assert_eq!(t.handle.snapshot().phase, MatchPhase::Countdown);
        tokio::time::sleep(Duration::from_millis(3_001)).await;

        for _ in 0..3 {
            t.handle
                .act(t.creator.0.connection, PlayerAction::SubmitChoice(Side::Heads))
                .await
                .unwrap();
            t.handle
                .act(t.opponent.0.connection, PlayerAction::SubmitChoice(Side::Tails))
                .await
                .unwrap();
            let holder = t.handle.snapshot().turn_holder.unwrap();
            let conn = match holder {
                Seat::Creator => t.creator.0.connection,
                Seat::Opponent => t.opponent.0.connection,
            };
            t.handle.act(conn, PlayerAction::BeginCharge).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            t.handle.act(conn, PlayerAction::ReleaseCharge).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        let snapshot = t.handle.snapshot();
        assert_eq!(snapshot.phase, MatchPhase::Completed);
        assert_eq!(snapshot.scores, Seats::new(3, 0));
        assert_eq!(snapshot.rounds.len(), 3);

        // two failures, then success after 1 s + 2 s of backoff
        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = t.handle.snapshot();
        assert!(matches!(snapshot.settlement.status, SettlementStatus::Settled { .. }));
        let payouts = t.custody.settlements().await;
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].winner, t.creator.0.address);

        let messages = drain(&mut t.opponent.1);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::MatchCompleted { winner: Seat::Creator, .. }
        )));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::PowerUpdate { player: Seat::Creator, power } if *power > 0)));
    }
}
