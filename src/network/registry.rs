//! Session Registry
//!
//! Maps match ids to running match actors. The map is the only shared
//! mutable structure; its lock is held for lookup and insert only.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::core::ids::{ConnectionId, MatchId};
use crate::game::machine::{SeatRole, SettlementReport};
use crate::game::rules::MatchRules;
use crate::game::state::{MatchListing, StakeDescriptor};
use crate::network::auth::ConnectionBinding;
use crate::network::protocol::{MatchSnapshot, ServerMessage};
use crate::network::session::{MatchHandle, MatchSession, PlayerAction, SessionCommand, SessionError};
use crate::settlement::SettlementBridge;

/// Manages all live matches.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<MatchId, MatchHandle>>,
    bridge: SettlementBridge,
    default_rules: MatchRules,
}

impl SessionRegistry {
    /// Create a new registry.
    pub fn new(bridge: SettlementBridge, default_rules: MatchRules) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            bridge,
            default_rules,
        }
    }

    /// Rules used for matches opened on demand.
    pub fn default_rules(&self) -> &MatchRules {
        &self.default_rules
    }

    /// Handle for a listing, spawning its actor on first use.
    pub async fn get_or_create(&self, listing: &MatchListing) -> MatchHandle {
        if let Some(handle) = self.get(listing.match_id).await {
            return handle;
        }

        let mut sessions = self.sessions.write().await;
        // another task may have won the race between the two locks
        if let Some(handle) = sessions.get(&listing.match_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let handle = MatchSession::spawn(listing, self.bridge.clone());
        sessions.insert(listing.match_id, handle.clone());
        info!(match_id = %listing.match_id, stake = %listing.stake.asset, "match opened");
        handle
    }

    /// Open a match with the default rules and an unreserved creator seat.
    pub async fn open(&self, match_id: MatchId, stake: StakeDescriptor) -> MatchHandle {
        let listing = MatchListing::open(match_id, stake, self.default_rules.clone());
        self.get_or_create(&listing).await
    }

    /// Live handle for a match.
    pub async fn get(&self, match_id: MatchId) -> Option<MatchHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(&match_id).filter(|h| !h.is_closed()).cloned()
    }

    async fn require(&self, match_id: MatchId) -> Result<MatchHandle, SessionError> {
        self.get(match_id).await.ok_or(SessionError::UnknownMatch(match_id))
    }

    /// Bind an authenticated connection to its match.
    pub async fn join(
        &self,
        binding: ConnectionBinding,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<SeatRole, SessionError> {
        let handle = self.require(binding.match_id).await?;
        handle.join(binding, outbound).await
    }

    /// Unbind a connection. The seat survives.
    pub async fn leave(&self, match_id: MatchId, connection: ConnectionId) {
        if let Some(handle) = self.get(match_id).await {
            handle.leave(connection).await;
        }
    }

    /// Route a player action to the binding's match.
    pub async fn route(
        &self,
        match_id: MatchId,
        binding: &ConnectionBinding,
        action: PlayerAction,
    ) -> Result<(), SessionError> {
        let handle = self.require(match_id).await?;
        if binding.match_id != match_id {
            return Err(SessionError::NotAParticipant);
        }
        handle.act(binding.connection, action).await
    }

    /// Resend the current snapshot to one connection.
    pub async fn sync(&self, match_id: MatchId, connection: ConnectionId) -> Result<(), SessionError> {
        self.require(match_id)
            .await?
            .send(SessionCommand::Sync { connection })
            .await
    }

    /// Send a message to every connection bound to a match.
    pub async fn broadcast(&self, match_id: MatchId, message: ServerMessage) -> Result<(), SessionError> {
        self.require(match_id)
            .await?
            .send(SessionCommand::Broadcast(message))
            .await
    }

    /// Latest snapshot, without queueing behind the actor.
    pub async fn snapshot(&self, match_id: MatchId) -> Result<MatchSnapshot, SessionError> {
        Ok(self.require(match_id).await?.snapshot())
    }

    /// Operator override: start a locked match without deposits.
    pub async fn operator_start(&self, match_id: MatchId) -> Result<(), SessionError> {
        self.require(match_id).await?.operator_start().await
    }

    /// Custody confirmed a submitted payout out of band.
    pub async fn on_settlement_confirmed(
        &self,
        match_id: MatchId,
        reference: Option<String>,
    ) -> Result<(), SessionError> {
        self.require(match_id)
            .await?
            .send(SessionCommand::SettlementNotice(SettlementReport::Confirmed { reference }))
            .await
    }

    /// Custody reported a payout failure out of band.
    pub async fn on_settlement_failed(&self, match_id: MatchId, reason: String) -> Result<(), SessionError> {
        self.require(match_id)
            .await?
            .send(SessionCommand::SettlementNotice(SettlementReport::Failed { reason }))
            .await
    }

    /// Stop and drop a match once it is terminal and custody is done.
    pub async fn remove_if_terminal(&self, match_id: MatchId) -> bool {
        let handle = {
            let mut sessions = self.sessions.write().await;
            let Some(handle) = sessions.get(&match_id) else {
                return false;
            };
            if !handle.is_closed() && !is_finished(&handle.snapshot()) {
                return false;
            }
            sessions.remove(&match_id)
        };
        // the queue may be backed up; never wait on it under the map lock
        if let Some(handle) = handle {
            let _ = handle.send(SessionCommand::Shutdown).await;
            info!(%match_id, "match removed");
        }
        true
    }

    /// Sweep finished matches nobody is seated at any more.
    pub async fn cleanup(&self) -> usize {
        let stale: Vec<MatchId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, handle)| {
                    let snapshot = handle.snapshot();
                    handle.is_closed() || (is_finished(&snapshot) && !anyone_connected(&snapshot))
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut removed = 0;
        for match_id in stale {
            if self.remove_if_terminal(match_id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "cleaned up matches");
        }
        removed
    }

    /// Live match count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop every match.
    pub async fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.sessions.write().await);
        for (_, handle) in drained {
            let _ = handle.send(SessionCommand::Shutdown).await;
        }
    }
}

fn is_finished(snapshot: &MatchSnapshot) -> bool {
    snapshot.phase.is_terminal() && !snapshot.settlement.status.is_open()
}

fn anyone_connected(snapshot: &MatchSnapshot) -> bool {
    [&snapshot.players.creator, &snapshot.players.opponent]
        .into_iter()
        .flatten()
        .any(|p| p.connected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use crate::core::ids::WalletAddress;
    use crate::game::state::{MatchPhase, Seat, Side};
    use crate::network::protocol::ErrorCode;
    use crate::network::session::tests::listing;
    use crate::settlement::InMemoryCustody;

    fn registry() -> SessionRegistry {
        let bridge = SettlementBridge::new(Arc::new(InMemoryCustody::new()), Duration::from_secs(15));
        SessionRegistry::new(bridge, MatchRules::default())
    }

    fn binding(match_id: MatchId, key: u8) -> ConnectionBinding {
        ConnectionBinding {
            connection: ConnectionId([key; 16]),
            address: WalletAddress::from_key_bytes([key; 32]),
            match_id,
            bound_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_one_actor_per_match() {
        let registry = registry();
        let l = listing(7);
        let a = registry.get_or_create(&l).await;
        let b = registry.get_or_create(&l).await;
        assert_eq!(registry.session_count().await, 1);

        let (tx, _rx) = mpsc::channel(16);
        a.join(binding(l.match_id, 1), tx).await.unwrap();
        assert_eq!(b.snapshot().version, a.snapshot().version);
        assert!(b.snapshot().players.creator.is_some());
    }

    #[tokio::test]
    async fn test_unknown_match_is_rejected() {
        let registry = registry();
        let missing = MatchId::new([9; 16]);
        let err = registry
            .route(missing, &binding(missing, 1), PlayerAction::SubmitChoice(Side::Heads))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::UnknownMatch(missing));
        assert_eq!(err.code(), ErrorCode::UnknownMatch);
        assert!(registry.snapshot(missing).await.is_err());
    }

    #[tokio::test]
    async fn test_binding_for_other_match_is_not_a_participant() {
        let registry = registry();
        let l = listing(7);
        registry.get_or_create(&l).await;

        let before = registry.snapshot(l.match_id).await.unwrap();
        let stranger = binding(MatchId::new([8; 16]), 1);
        let err = registry
            .route(l.match_id, &stranger, PlayerAction::BeginCharge)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotAParticipant);
        assert_eq!(registry.snapshot(l.match_id).await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_match_is_cleaned_up() {
        let registry = registry();
        let l = listing(7);
        registry.get_or_create(&l).await;

        let (tx1, _rx1) = mpsc::channel(64);
        let (tx2, _rx2) = mpsc::channel(64);
        let creator = binding(l.match_id, 1);
        let opponent = binding(l.match_id, 2);
        assert_eq!(registry.join(creator.clone(), tx1).await.unwrap(), SeatRole::Player(Seat::Creator));
        registry.join(opponent.clone(), tx2).await.unwrap();

        // still live while players are seated
        assert_eq!(registry.cleanup().await, 0);

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(registry.snapshot(l.match_id).await.unwrap().phase, MatchPhase::Cancelled);
        assert_eq!(registry.cleanup().await, 0);

        registry.leave(l.match_id, creator.connection).await;
        registry.leave(l.match_id, opponent.connection).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(registry.cleanup().await, 1);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookups_do_not_wait_on_a_backed_up_match() {
        let registry = Arc::new(registry());
        let stuck = listing(7);
        let other = listing(8);
        let stuck_handle = registry.get_or_create(&stuck).await;
        registry.get_or_create(&other).await;

        let (tx1, _rx1) = mpsc::channel(64);
        let (tx2, _rx2) = mpsc::channel(64);
        registry.join(binding(stuck.match_id, 1), tx1).await.unwrap();
        registry.join(binding(stuck.match_id, 2), tx2).await.unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(stuck_handle.snapshot().phase, MatchPhase::Cancelled);

        // hold every queue slot so the shutdown send has to wait
        let sender = stuck_handle.sender().clone();
        let mut permits = Vec::new();
        while let Ok(permit) = sender.try_reserve() {
            permits.push(permit);
        }

        let remover = {
            let registry = registry.clone();
            let match_id = stuck.match_id;
            tokio::spawn(async move { registry.remove_if_terminal(match_id).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let lookup = tokio::time::timeout(Duration::from_secs(1), registry.get(other.match_id)).await;
        assert!(matches!(lookup, Ok(Some(_))));
        assert!(registry.get(stuck.match_id).await.is_none());
        assert!(!remover.is_finished());

        drop(permits);
        assert!(remover.await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_if_terminal_keeps_live_match() {
        let registry = registry();
        let l = listing(7);
        registry.get_or_create(&l).await;
        assert!(!registry.remove_if_terminal(l.match_id).await);
        assert!(registry.get(l.match_id).await.is_some());
    }
}
