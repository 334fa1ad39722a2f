//! WebSocket Match Server
//!
//! Accepts WebSocket connections, runs the challenge-response handshake
//! and routes authenticated traffic to the match actors through the
//! [`SessionRegistry`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{ConnectionId, MatchId, WalletAddress};
use crate::game::rules::MatchRules;
use crate::game::state::StakeDescriptor;
use crate::network::auth::{AuthConfig, AuthError, Authenticator, ConnectionBinding};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::registry::SessionRegistry;
use crate::network::session::{PlayerAction, SessionError};
use crate::settlement::SettlementBridge;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    /// Open unknown matches on the first challenge request instead of
    /// rejecting them.
    pub open_on_demand: bool,
    /// Stake used for matches opened on demand.
    pub on_demand_stake: StakeDescriptor,
    /// How often expired challenges and finished matches are swept.
    pub cleanup_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_buffer: 64,
            open_on_demand: false,
            on_demand_stake: StakeDescriptor {
                asset: "unlisted".to_string(),
                equivalent_value: 0,
            },
            cleanup_interval: Duration::from_secs(60),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("FLIP_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("FLIP_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            open_on_demand: std::env::var("FLIP_OPEN_ON_DEMAND")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.open_on_demand),
            ..defaults
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Authentication error.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

/// Connected client bookkeeping.
struct ConnectedClient {
    peer: SocketAddr,
    connected_at: Instant,
    match_id: Option<MatchId>,
}

type Clients = Arc<RwLock<BTreeMap<ConnectionId, ConnectedClient>>>;

/// The match server.
pub struct GameServer {
    config: ServerConfig,
    auth: Arc<Authenticator>,
    registry: Arc<SessionRegistry>,
    clients: Clients,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        rules: MatchRules,
        bridge: SettlementBridge,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            auth: Arc::new(Authenticator::new(auth)),
            registry: Arc::new(SessionRegistry::new(bridge, rules)),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Match registry, for listing matches and custody callbacks.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind and run until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run on an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!(addr = %listener.local_addr()?, version = %self.config.version, "match server listening");

        let cleanup_auth = self.auth.clone();
        let cleanup_registry = self.registry.clone();
        let cleanup_every = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_auth, cleanup_registry, cleanup_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!(%peer, "connection limit reached, rejecting");
                                continue;
                            }

                            debug!(%peer, "new connection");
                            self.handle_connection(stream, peer);
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        self.registry.shutdown().await;

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut conn = ClientConnection {
            id: ConnectionId::random(),
            peer,
            config: self.config.clone(),
            auth: self.auth.clone(),
            registry: self.registry.clone(),
            clients: self.clients.clone(),
            binding: None,
            outbound: None,
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "websocket handshake failed");
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(conn.config.outbound_buffer);
            conn.outbound = Some(msg_tx.clone());

            conn.clients.write().await.insert(
                conn.id,
                ConnectedClient { peer, connected_at: Instant::now(), match_id: None },
            );

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!(error = %e, "failed to serialize message");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => conn.handle_client_message(client_msg).await,
                                    Err(e) => {
                                        debug!(%peer, error = %e, "invalid message");
                                        conn.reply(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        )).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(%peer, "client disconnected");
                                break;
                            }
                            Some(Err(e)) => {
                                debug!(%peer, error = %e, "websocket error");
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        conn.reply(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            conn.disconnect().await;
            drop(msg_tx);
            conn.outbound = None;
            // let the writer flush what is queued, then stop it
            let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;
            debug!(%peer, "client cleaned up");
        });
    }

    /// Sweep expired challenges and finished matches.
    async fn run_cleanup_loop(auth: Arc<Authenticator>, registry: Arc<SessionRegistry>, every: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let challenges = auth.purge_expired().await;
            let matches = registry.cleanup().await;
            if challenges > 0 || matches > 0 {
                debug!(challenges, matches, "cleanup pass");
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Live match count.
    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }
}

/// Per-connection state, owned by the connection task.
struct ClientConnection {
    id: ConnectionId,
    peer: SocketAddr,
    config: ServerConfig,
    auth: Arc<Authenticator>,
    registry: Arc<SessionRegistry>,
    clients: Clients,
    binding: Option<ConnectionBinding>,
    outbound: Option<mpsc::Sender<ServerMessage>>,
}

impl ClientConnection {
    async fn reply(&self, message: ServerMessage) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(message).await;
        }
    }

    async fn handle_client_message(&mut self, msg: ClientMessage) {
        if self.binding.is_none() && !msg.allowed_unauthenticated() {
            self.reply(ServerMessage::error(ErrorCode::NotAuthenticated, "Must authenticate first")).await;
            return;
        }

        match msg {
            ClientMessage::AuthChallengeRequest { match_id, address } => {
                self.handle_challenge_request(match_id, address).await;
            }
            ClientMessage::AuthResponse { signature } => {
                let result = self.auth.complete_challenge(self.id, &signature).await;
                self.handle_auth_result(result).await;
            }
            ClientMessage::Resume { token } => {
                let result = self.auth.resume(self.id, &token).await;
                self.handle_auth_result(result).await;
            }
            ClientMessage::SubmitChoice { side } => self.handle_action(PlayerAction::SubmitChoice(side)).await,
            ClientMessage::BeginCharge => self.handle_action(PlayerAction::BeginCharge).await,
            ClientMessage::ReleaseCharge => self.handle_action(PlayerAction::ReleaseCharge).await,
            ClientMessage::ConfirmDeposit { proof } => {
                self.handle_action(PlayerAction::ConfirmDeposit(proof)).await;
            }
            ClientMessage::SyncRequest => {
                if let Some(binding) = &self.binding {
                    if let Err(e) = self.registry.sync(binding.match_id, self.id).await {
                        self.reply(ServerMessage::error(e.code(), e.to_string())).await;
                    }
                }
            }
            ClientMessage::Ping { timestamp } => {
                self.reply(ServerMessage::Pong {
                    timestamp,
                    server_time: Utc::now().timestamp_millis().max(0) as u64,
                })
                .await;
            }
            ClientMessage::Logout => {
                self.release_binding().await;
                self.auth.unbind(self.id).await;
            }
        }
    }

    async fn handle_challenge_request(&mut self, match_id: MatchId, address: WalletAddress) {
        // on-demand matches are opened only once the wallet has proven itself
        if !self.config.open_on_demand && self.registry.get(match_id).await.is_none() {
            self.reply(ServerMessage::AuthFailed {
                code: ErrorCode::UnknownMatch,
                reason: SessionError::UnknownMatch(match_id).to_string(),
            })
            .await;
            return;
        }

        let challenge = self.auth.begin_challenge(self.id, match_id, address).await;
        debug!(peer = %self.peer, %match_id, "challenge issued");
        self.reply(ServerMessage::AuthChallenge {
            expires_in_ms: challenge.expires_in_ms(Utc::now()),
            nonce: challenge.nonce,
        })
        .await;
    }

    async fn handle_auth_result(&mut self, result: Result<ConnectionBinding, AuthError>) {
        let binding = match result {
            Ok(binding) => binding,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "authentication failed");
                self.reply(ServerMessage::AuthFailed { code: e.code(), reason: e.to_string() }).await;
                return;
            }
        };

        if let Err(e) = self.establish(binding).await {
            warn!(peer = %self.peer, error = %e, "could not bind connection");
            let code = match &e {
                GameServerError::Session(s) => s.code(),
                GameServerError::Auth(a) => a.code(),
                _ => ErrorCode::InternalError,
            };
            self.auth.unbind(self.id).await;
            self.reply(ServerMessage::AuthFailed { code, reason: e.to_string() }).await;
        }
    }

    async fn establish(&mut self, binding: ConnectionBinding) -> Result<(), GameServerError> {
        // a connection follows one match at a time
        self.release_binding().await;

        let outbound = self
            .outbound
            .clone()
            .ok_or(GameServerError::Session(SessionError::Closed))?;
        let resume_token = self.auth.issue_resume_token(&binding)?;
        if self.config.open_on_demand && self.registry.get(binding.match_id).await.is_none() {
            self.registry
                .open(binding.match_id, self.config.on_demand_stake.clone())
                .await;
        }
        let role = self.registry.join(binding.clone(), outbound).await?;

        if let Some(client) = self.clients.write().await.get_mut(&self.id) {
            client.match_id = Some(binding.match_id);
        }
        info!(
            peer = %self.peer,
            match_id = %binding.match_id,
            address = %binding.address.short(),
            ?role,
            "session established"
        );

        self.reply(ServerMessage::SessionEstablished {
            match_id: binding.match_id,
            address: binding.address.clone(),
            role,
            resume_token,
        })
        .await;
        // the join snapshot can race the reply above; resend after it
        self.registry.sync(binding.match_id, self.id).await?;
        self.binding = Some(binding);
        Ok(())
    }

    async fn handle_action(&self, action: PlayerAction) {
        let Some(binding) = &self.binding else {
            return;
        };
        if let Err(e) = self.registry.route(binding.match_id, binding, action).await {
            self.reply(ServerMessage::error(e.code(), e.to_string())).await;
        }
    }

    async fn release_binding(&mut self) {
        if let Some(binding) = self.binding.take() {
            self.registry.leave(binding.match_id, self.id).await;
            if let Some(client) = self.clients.write().await.get_mut(&self.id) {
                client.match_id = None;
            }
        }
    }

    async fn disconnect(&mut self) {
        self.release_binding().await;
        self.auth.unbind(self.id).await;
        if let Some(client) = self.clients.write().await.remove(&self.id) {
            debug!(
                peer = %client.peer,
                match_id = ?client.match_id,
                connected_for = ?client.connected_at.elapsed(),
                "client removed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::game::machine::SeatRole;
    use crate::game::state::Seat;
    use crate::network::auth::tests::{sign, signing_key, wallet};
    use crate::settlement::InMemoryCustody;

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn server(open_on_demand: bool) -> GameServer {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            open_on_demand,
            ..Default::default()
        };
        let bridge = SettlementBridge::new(Arc::new(InMemoryCustody::new()), Duration::from_secs(5));
        GameServer::new(config, AuthConfig::default(), MatchRules::default(), bridge)
    }

    async fn start(server: GameServer) -> (Arc<GameServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let running = server.clone();
        tokio::spawn(async move {
            let _ = running.serve(listener).await;
        });
        (server, addr)
    }

    async fn send(ws: &mut Ws, msg: &ClientMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn recv(ws: &mut Ws) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn recv_until<F>(ws: &mut Ws, mut pred: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let msg = recv(ws).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(!config.open_on_demand);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = server(false);
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_handshake_and_snapshot_over_websocket() {
        let (server, addr) = start(server(false)).await;
        let match_id = MatchId::new([5; 16]);
        server
            .registry()
            .open(match_id, StakeDescriptor { asset: "nft-mint".into(), equivalent_value: 100 })
            .await;

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        // nothing but the handshake before authenticating
        send(&mut ws, &ClientMessage::BeginCharge).await;
        match recv(&mut ws).await {
            ServerMessage::Error(e) => assert_eq!(e.code, ErrorCode::NotAuthenticated),
            other => panic!("unexpected {other:?}"),
        }

        let key = signing_key(21);
        send(&mut ws, &ClientMessage::AuthChallengeRequest { match_id, address: wallet(&key) }).await;
        let nonce = match recv(&mut ws).await {
            ServerMessage::AuthChallenge { nonce, expires_in_ms } => {
                assert!(expires_in_ms > 0);
                nonce
            }
            other => panic!("unexpected {other:?}"),
        };
        send(&mut ws, &ClientMessage::AuthResponse { signature: sign(&key, &nonce) }).await;

        let established = recv_until(&mut ws, |m| matches!(m, ServerMessage::SessionEstablished { .. })).await;
        let token = match established {
            ServerMessage::SessionEstablished { role, address, resume_token, .. } => {
                assert_eq!(role, SeatRole::Player(Seat::Creator));
                assert_eq!(address, wallet(&key));
                resume_token
            }
            _ => unreachable!(),
        };
        assert!(!token.is_empty());

        let snapshot = recv_until(&mut ws, |m| matches!(m, ServerMessage::MatchSnapshot(_))).await;
        match snapshot {
            ServerMessage::MatchSnapshot(s) => {
                assert_eq!(s.match_id, match_id);
                assert_eq!(s.players.creator.as_ref().map(|p| p.address.clone()), Some(wallet(&key)));
            }
            _ => unreachable!(),
        }

        send(&mut ws, &ClientMessage::Ping { timestamp: 42 }).await;
        let pong = recv_until(&mut ws, |m| matches!(m, ServerMessage::Pong { .. })).await;
        assert!(matches!(pong, ServerMessage::Pong { timestamp: 42, .. }));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let (server, addr) = start(server(true)).await;
        let match_id = MatchId::new([6; 16]);
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let claimed = signing_key(1);
        let impostor = signing_key(2);
        send(&mut ws, &ClientMessage::AuthChallengeRequest { match_id, address: wallet(&claimed) }).await;
        let nonce = match recv(&mut ws).await {
            ServerMessage::AuthChallenge { nonce, .. } => nonce,
            other => panic!("unexpected {other:?}"),
        };
        send(&mut ws, &ClientMessage::AuthResponse { signature: sign(&impostor, &nonce) }).await;
        match recv(&mut ws).await {
            ServerMessage::AuthFailed { code, .. } => assert_eq!(code, ErrorCode::AuthFailed),
            other => panic!("unexpected {other:?}"),
        }

        // the challenge was consumed
        send(&mut ws, &ClientMessage::AuthResponse { signature: sign(&claimed, &nonce) }).await;
        match recv(&mut ws).await {
            ServerMessage::AuthFailed { code, .. } => assert_eq!(code, ErrorCode::AuthFailed),
            other => panic!("unexpected {other:?}"),
        }
        // a failed handshake never opens a match
        assert_eq!(server.session_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_on_demand_match_opens_after_authentication() {
        let (server, addr) = start(server(true)).await;
        let match_id = MatchId::new([8; 16]);
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        // challenges for unknown matches cost nothing until answered
        for n in 0..5u8 {
            let stranger = signing_key(40 + n);
            let request = ClientMessage::AuthChallengeRequest {
                match_id: MatchId::new([50 + n; 16]),
                address: wallet(&stranger),
            };
            send(&mut ws, &request).await;
            assert!(matches!(recv(&mut ws).await, ServerMessage::AuthChallenge { .. }));
        }
        assert_eq!(server.session_count().await, 0);

        let key = signing_key(9);
        send(&mut ws, &ClientMessage::AuthChallengeRequest { match_id, address: wallet(&key) }).await;
        let nonce = match recv(&mut ws).await {
            ServerMessage::AuthChallenge { nonce, .. } => nonce,
            other => panic!("unexpected {other:?}"),
        };
        send(&mut ws, &ClientMessage::AuthResponse { signature: sign(&key, &nonce) }).await;
        match recv_until(&mut ws, |m| matches!(m, ServerMessage::SessionEstablished { .. })).await {
            ServerMessage::SessionEstablished { role, .. } => assert_eq!(role, SeatRole::Player(Seat::Creator)),
            _ => unreachable!(),
        }
        assert_eq!(server.session_count().await, 1);
        assert!(server.registry().get(match_id).await.is_some());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_match_without_open_on_demand() {
        let (server, addr) = start(server(false)).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let key = signing_key(3);
        send(
            &mut ws,
            &ClientMessage::AuthChallengeRequest { match_id: MatchId::new([7; 16]), address: wallet(&key) },
        )
        .await;
        match recv(&mut ws).await {
            ServerMessage::AuthFailed { code, .. } => assert_eq!(code, ErrorCode::UnknownMatch),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.session_count().await, 0);
        server.shutdown();
    }
}
