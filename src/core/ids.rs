//! Identifiers
//!
//! Match, wallet and connection identifiers shared by every layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors parsing an identifier from its wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Match id is not a UUID.
    #[error("invalid match id: {0}")]
    InvalidMatchId(String),
    /// Address is not base58.
    #[error("address is not valid base58")]
    InvalidEncoding,
    /// Address does not decode to a 32-byte public key.
    #[error("address must decode to 32 bytes, got {0}")]
    InvalidLength(usize),
}

// =============================================================================
// MATCH ID
// =============================================================================

/// Unique match identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MatchId(pub [u8; 16]);

impl MatchId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First four bytes, hex encoded. Used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

impl FromStr for MatchId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(|u| Self(*u.as_bytes()))
            .map_err(|_| IdError::InvalidMatchId(s.to_string()))
    }
}

impl From<MatchId> for String {
    fn from(id: MatchId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MatchId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// =============================================================================
// WALLET ADDRESS
// =============================================================================

/// A wallet identity: an ed25519 public key, base58 encoded.
///
/// The decoded key is validated on construction, so holding a
/// `WalletAddress` means the bytes are a 32-byte key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WalletAddress {
    encoded: String,
    key: [u8; 32],
}

impl WalletAddress {
    /// Build from raw public key bytes.
    pub fn from_key_bytes(key: [u8; 32]) -> Self {
        Self {
            encoded: bs58::encode(key).into_string(),
            key,
        }
    }

    /// Public key bytes.
    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Base58 form.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Abbreviated form for logs (`AbCd..WxYz`).
    pub fn short(&self) -> String {
        let s = &self.encoded;
        if s.len() <= 10 {
            return s.clone();
        }
        format!("{}..{}", &s[..4], &s[s.len() - 4..])
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl FromStr for WalletAddress {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| IdError::InvalidEncoding)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdError::InvalidLength(bytes.len()))?;
        Ok(Self {
            encoded: s.to_string(),
            key,
        })
    }
}

impl From<WalletAddress> for String {
    fn from(addr: WalletAddress) -> Self {
        addr.encoded
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// =============================================================================
// CONNECTION ID
// =============================================================================

/// Transport-level connection identifier, one per WebSocket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub [u8; 16]);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_id_string_roundtrip() {
        let id = MatchId::random();
        let parsed: MatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<MatchId>().is_err());
    }

    #[test]
    fn test_wallet_address_validates_length() {
        let addr = WalletAddress::from_key_bytes([7; 32]);
        let parsed: WalletAddress = addr.as_str().parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.key_bytes(), &[7; 32]);

        let short = bs58::encode([1u8; 20]).into_string();
        assert_eq!(short.parse::<WalletAddress>(), Err(IdError::InvalidLength(20)));
        assert_eq!("0OIl".parse::<WalletAddress>(), Err(IdError::InvalidEncoding));
    }

    #[test]
    fn test_wallet_address_serde_as_string() {
        let addr = WalletAddress::from_key_bytes([3; 32]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.as_str()));
        let back: WalletAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
