//! Wallet Authentication
//!
//! Challenge-response over ed25519 wallet keys. The server hands out a
//! nonce, the client signs it with the key behind its base58 address, and
//! the connection is bound to that wallet for one match. A successful bind
//! also yields an HS256 resume token so a reconnecting client can skip the
//! signing round trip.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::ids::{ConnectionId, MatchId, WalletAddress};
use crate::network::protocol::ErrorCode;

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 secret for resume tokens.
    pub session_secret: String,
    /// How long a challenge stays answerable.
    pub challenge_window: Duration,
    /// Resume token lifetime.
    pub session_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_secret: random_secret(),
            challenge_window: Duration::from_secs(30),
            session_ttl: Duration::from_secs(3_600),
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    ///
    /// Without `AUTH_SESSION_SECRET` a random secret is generated, so
    /// resume tokens do not survive a restart.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_secret: std::env::var("AUTH_SESSION_SECRET").unwrap_or(defaults.session_secret),
            challenge_window: std::env::var("AUTH_CHALLENGE_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.challenge_window),
            session_ttl: std::env::var("AUTH_SESSION_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
        }
    }
}

fn random_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Claims carried by a resume token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeClaims {
    /// Wallet address.
    pub sub: String,
    /// Match the binding belongs to.
    pub match_id: String,
    /// Issued at (Unix seconds).
    pub iat: u64,
    /// Expiry (Unix seconds).
    pub exp: u64,
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No challenge outstanding for this connection.
    #[error("no challenge pending")]
    NoChallenge,
    /// Challenge window passed.
    #[error("challenge expired")]
    ChallengeExpired,
    /// Signature is not 64 bytes of base58.
    #[error("malformed signature")]
    MalformedSignature,
    /// Address bytes are not a valid ed25519 key.
    #[error("address is not a valid public key")]
    InvalidKey,
    /// Signature does not verify against the address.
    #[error("invalid signature")]
    InvalidSignature,
    /// Resume token has expired.
    #[error("token expired")]
    TokenExpired,
    /// Resume token is forged or malformed.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Connection is not bound.
    #[error("not authenticated")]
    NotAuthenticated,
}

impl AuthError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::ChallengeExpired => ErrorCode::ChallengeExpired,
            AuthError::TokenExpired => ErrorCode::TokenExpired,
            AuthError::InvalidToken(_) => ErrorCode::InvalidToken,
            AuthError::NotAuthenticated => ErrorCode::NotAuthenticated,
            _ => ErrorCode::AuthFailed,
        }
    }
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken(err.to_string()),
    }
}

/// Check an ed25519 signature (base58) over `message` against a wallet.
pub fn verify_signature(
    address: &WalletAddress,
    message: &[u8],
    signature_b58: &str,
) -> Result<(), AuthError> {
    let bytes = bs58::decode(signature_b58)
        .into_vec()
        .map_err(|_| AuthError::MalformedSignature)?;
    let bytes: [u8; 64] = bytes.try_into().map_err(|_| AuthError::MalformedSignature)?;
    let signature = Signature::from_bytes(&bytes);
    let key = VerifyingKey::from_bytes(address.key_bytes()).map_err(|_| AuthError::InvalidKey)?;
    key.verify(message, &signature).map_err(|_| AuthError::InvalidSignature)
}

// =============================================================================
// CHALLENGES AND BINDINGS
// =============================================================================

/// An outstanding challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Text to sign.
    pub nonce: String,
    /// Match the connection wants.
    pub match_id: MatchId,
    /// Claimed wallet.
    pub address: WalletAddress,
    /// Answer deadline.
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    /// Time left to answer.
    pub fn expires_in_ms(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_milliseconds().max(0) as u64
    }
}

/// A connection bound to a wallet and a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionBinding {
    /// Connection.
    pub connection: ConnectionId,
    /// Wallet.
    pub address: WalletAddress,
    /// Match.
    pub match_id: MatchId,
    /// When the binding was made.
    pub bound_at: DateTime<Utc>,
}

/// Issues challenges, verifies answers, tracks bindings.
#[derive(Debug)]
pub struct Authenticator {
    config: AuthConfig,
    challenges: RwLock<BTreeMap<ConnectionId, Challenge>>,
    bindings: RwLock<BTreeMap<ConnectionId, ConnectionBinding>>,
}

impl Authenticator {
    /// Create a new authenticator.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            challenges: RwLock::new(BTreeMap::new()),
            bindings: RwLock::new(BTreeMap::new()),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Start (or restart) a challenge for a connection.
    pub async fn begin_challenge(
        &self,
        connection: ConnectionId,
        match_id: MatchId,
        address: WalletAddress,
    ) -> Challenge {
        self.begin_challenge_at(connection, match_id, address, Utc::now()).await
    }

    async fn begin_challenge_at(
        &self,
        connection: ConnectionId,
        match_id: MatchId,
        address: WalletAddress,
        now: DateTime<Utc>,
    ) -> Challenge {
        let nonce = format!(
            "flip-duel:{}:{}:{}:{}",
            match_id,
            address,
            now.timestamp_millis(),
            hex::encode(uuid::Uuid::new_v4().as_bytes())
        );
        let window = chrono::Duration::from_std(self.config.challenge_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let challenge = Challenge { nonce, match_id, address, expires_at: now + window };
        self.challenges.write().await.insert(connection, challenge.clone());
        challenge
    }

    /// Answer the pending challenge. The challenge is consumed whatever
    /// the outcome.
    pub async fn complete_challenge(
        &self,
        connection: ConnectionId,
        signature: &str,
    ) -> Result<ConnectionBinding, AuthError> {
        self.complete_challenge_at(connection, signature, Utc::now()).await
    }

    async fn complete_challenge_at(
        &self,
        connection: ConnectionId,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<ConnectionBinding, AuthError> {
        let challenge = self
            .challenges
            .write()
            .await
            .remove(&connection)
            .ok_or(AuthError::NoChallenge)?;

        if now > challenge.expires_at {
            return Err(AuthError::ChallengeExpired);
        }
        verify_signature(&challenge.address, challenge.nonce.as_bytes(), signature)?;

        Ok(self.bind(connection, challenge.address, challenge.match_id, now).await)
    }

    async fn bind(
        &self,
        connection: ConnectionId,
        address: WalletAddress,
        match_id: MatchId,
        now: DateTime<Utc>,
    ) -> ConnectionBinding {
        let binding = ConnectionBinding { connection, address, match_id, bound_at: now };
        self.bindings.write().await.insert(connection, binding.clone());
        binding
    }

    /// Resume token for a binding.
    pub fn issue_resume_token(&self, binding: &ConnectionBinding) -> Result<String, AuthError> {
        let iat = binding.bound_at.timestamp().max(0) as u64;
        let claims = ResumeClaims {
            sub: binding.address.to_string(),
            match_id: binding.match_id.to_string(),
            iat,
            exp: iat + self.config.session_ttl.as_secs(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.session_secret.as_bytes()),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    fn validate_resume_token(&self, token: &str) -> Result<ResumeClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<ResumeClaims>(
            token,
            &DecodingKey::from_secret(self.config.session_secret.as_bytes()),
            &validation,
        )
        .map_err(map_jwt_error)?;
        Ok(data.claims)
    }

    /// Bind a connection from a resume token.
    pub async fn resume(
        &self,
        connection: ConnectionId,
        token: &str,
    ) -> Result<ConnectionBinding, AuthError> {
        let claims = self.validate_resume_token(token)?;
        let address: WalletAddress = claims
            .sub
            .parse()
            .map_err(|_| AuthError::InvalidToken("bad subject".into()))?;
        let match_id: MatchId = claims
            .match_id
            .parse()
            .map_err(|_| AuthError::InvalidToken("bad match id".into()))?;
        self.challenges.write().await.remove(&connection);
        Ok(self.bind(connection, address, match_id, Utc::now()).await)
    }

    /// Current binding for a connection.
    pub async fn binding(&self, connection: ConnectionId) -> Option<ConnectionBinding> {
        self.bindings.read().await.get(&connection).cloned()
    }

    /// Forget a connection.
    pub async fn unbind(&self, connection: ConnectionId) -> Option<ConnectionBinding> {
        self.challenges.write().await.remove(&connection);
        self.bindings.write().await.remove(&connection)
    }

    /// Drop challenges past their window.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut challenges = self.challenges.write().await;
        let before = challenges.len();
        challenges.retain(|_, c| c.expires_at >= now);
        before - challenges.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub(crate) fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub(crate) fn wallet(key: &SigningKey) -> WalletAddress {
        WalletAddress::from_key_bytes(key.verifying_key().to_bytes())
    }

    pub(crate) fn sign(key: &SigningKey, nonce: &str) -> String {
        bs58::encode(key.sign(nonce.as_bytes()).to_bytes()).into_string()
    }

    fn auth() -> Authenticator {
        Authenticator::new(AuthConfig {
            session_secret: "test-secret-key-256-bits-long!!".into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_challenge_round_trip() {
        let auth = auth();
        let key = signing_key(7);
        let conn = ConnectionId([1; 16]);
        let match_id = MatchId::new([2; 16]);

        let challenge = auth.begin_challenge(conn, match_id, wallet(&key)).await;
        assert!(challenge.nonce.contains(&match_id.to_string()));
        assert!(challenge.nonce.contains(wallet(&key).as_str()));

        let binding = auth.complete_challenge(conn, &sign(&key, &challenge.nonce)).await.unwrap();
        assert_eq!(binding.address, wallet(&key));
        assert_eq!(binding.match_id, match_id);
        assert_eq!(auth.binding(conn).await, Some(binding));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let auth = auth();
        let conn = ConnectionId([1; 16]);
        let challenge = auth
            .begin_challenge(conn, MatchId::new([2; 16]), wallet(&signing_key(7)))
            .await;
        let forged = sign(&signing_key(8), &challenge.nonce);
        assert_eq!(auth.complete_challenge(conn, &forged).await, Err(AuthError::InvalidSignature));
        assert_eq!(auth.binding(conn).await, None);
    }

    #[tokio::test]
    async fn test_challenge_is_single_use() {
        let auth = auth();
        let key = signing_key(7);
        let conn = ConnectionId([1; 16]);
        let challenge = auth.begin_challenge(conn, MatchId::new([2; 16]), wallet(&key)).await;
        let signature = sign(&key, &challenge.nonce);
        assert!(auth.complete_challenge(conn, &signature).await.is_ok());
        assert_eq!(auth.complete_challenge(conn, &signature).await, Err(AuthError::NoChallenge));
    }

    #[tokio::test]
    async fn test_expired_challenge_rejected() {
        let auth = auth();
        let key = signing_key(7);
        let conn = ConnectionId([1; 16]);
        let issued = Utc::now() - chrono::Duration::seconds(31);
        let challenge = auth
            .begin_challenge_at(conn, MatchId::new([2; 16]), wallet(&key), issued)
            .await;
        let result = auth
            .complete_challenge_at(conn, &sign(&key, &challenge.nonce), Utc::now())
            .await;
        assert_eq!(result, Err(AuthError::ChallengeExpired));
        assert_eq!(AuthError::ChallengeExpired.code(), ErrorCode::ChallengeExpired);
    }

    #[tokio::test]
    async fn test_malformed_signature() {
        let auth = auth();
        let conn = ConnectionId([1; 16]);
        auth.begin_challenge(conn, MatchId::new([2; 16]), wallet(&signing_key(7))).await;
        assert_eq!(auth.complete_challenge(conn, "abc").await, Err(AuthError::MalformedSignature));
    }

    #[tokio::test]
    async fn test_resume_token() {
        let auth = auth();
        let key = signing_key(7);
        let binding = ConnectionBinding {
            connection: ConnectionId([1; 16]),
            address: wallet(&key),
            match_id: MatchId::new([2; 16]),
            bound_at: Utc::now(),
        };
        let token = auth.issue_resume_token(&binding).unwrap();

        let resumed = auth.resume(ConnectionId([9; 16]), &token).await.unwrap();
        assert_eq!(resumed.address, binding.address);
        assert_eq!(resumed.match_id, binding.match_id);
        assert_eq!(resumed.connection, ConnectionId([9; 16]));
    }

    #[tokio::test]
    async fn test_expired_and_forged_tokens() {
        let auth = auth();
        let binding = ConnectionBinding {
            connection: ConnectionId([1; 16]),
            address: wallet(&signing_key(7)),
            match_id: MatchId::new([2; 16]),
            bound_at: Utc::now() - chrono::Duration::hours(2),
        };
        let expired = auth.issue_resume_token(&binding).unwrap();
        assert_eq!(auth.resume(ConnectionId([9; 16]), &expired).await, Err(AuthError::TokenExpired));

        let other = Authenticator::new(AuthConfig {
            session_secret: "another-secret-entirely-here!!".into(),
            ..Default::default()
        });
        let fresh = ConnectionBinding { bound_at: Utc::now(), ..binding };
        let forged = other.issue_resume_token(&fresh).unwrap();
        assert!(matches!(
            auth.resume(ConnectionId([9; 16]), &forged).await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_unbind_and_purge() {
        let auth = auth();
        let conn = ConnectionId([1; 16]);
        auth.begin_challenge_at(
            conn,
            MatchId::new([2; 16]),
            wallet(&signing_key(7)),
            Utc::now() - chrono::Duration::minutes(5),
        )
        .await;
        assert_eq!(auth.purge_expired().await, 1);
        assert_eq!(auth.unbind(conn).await, None);
    }
}
