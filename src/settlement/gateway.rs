//! Custody Gateway
//!
//! The boundary to whatever holds the stakes. The engine only ever sees
//! receipts and reason codes from here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::ids::{MatchId, WalletAddress};
use crate::game::state::{AssetProof, Seat, StakeDescriptor};

/// Custody failures. Each carries a stable reason code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CustodyError {
    /// Custody refused the request.
    #[error("rejected by custody: {0}")]
    Rejected(String),
    /// Custody could not be reached.
    #[error("custody unavailable")]
    Unavailable,
    /// Call exceeded its timeout.
    #[error("custody call timed out")]
    Timeout,
    /// Deposit proof does not check out.
    #[error("invalid deposit proof")]
    InvalidProof,
}

impl CustodyError {
    /// Reason code reported to clients and the state machine.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CustodyError::Rejected(_) => "rejected",
            CustodyError::Unavailable => "unavailable",
            CustodyError::Timeout => "timeout",
            CustodyError::InvalidProof => "invalid_proof",
        }
    }
}

/// A seat's stake claimed to be in custody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Match.
    pub match_id: MatchId,
    /// Depositing seat.
    pub seat: Seat,
    /// Depositing wallet.
    pub depositor: WalletAddress,
    /// Stakes for the match.
    pub stake: StakeDescriptor,
    /// Proof supplied by the client.
    pub proof: AssetProof,
}

/// Pot payout to the winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    /// Match.
    pub match_id: MatchId,
    /// Winning wallet.
    pub winner: WalletAddress,
    /// Losing wallet.
    pub loser: WalletAddress,
    /// Stakes for the match.
    pub stake: StakeDescriptor,
}

/// Return of one seat's stake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// Match.
    pub match_id: MatchId,
    /// Seat being refunded.
    pub seat: Seat,
    /// Wallet receiving the stake.
    pub owner: WalletAddress,
    /// Stakes for the match.
    pub stake: StakeDescriptor,
}

/// What custody said about a payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutReceipt {
    /// Final.
    Confirmed {
        /// Custody reference.
        reference: String,
    },
    /// Accepted; confirmation arrives through the settlement callbacks.
    Submitted {
        /// Custody reference.
        reference: String,
    },
}

/// Asset custody.
#[async_trait]
pub trait CustodyGateway: Send + Sync {
    /// Check a deposit proof and return a custody receipt.
    async fn verify_deposit(&self, request: &DepositRequest) -> Result<String, CustodyError>;

    /// Pay the pot out.
    async fn settle(&self, request: &PayoutRequest) -> Result<PayoutReceipt, CustodyError>;

    /// Return one seat's stake and give back a custody reference.
    async fn release(&self, request: &ReleaseRequest) -> Result<String, CustodyError>;
}

// =============================================================================
// IN-MEMORY CUSTODY
// =============================================================================

/// How [`InMemoryCustody`] answers payouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayoutMode {
    /// Confirm immediately.
    #[default]
    Confirm,
    /// Only acknowledge; confirmation is external.
    Submit,
}

#[derive(Debug, Default)]
struct Ledger {
    deposits: Vec<DepositRequest>,
    settlements: Vec<PayoutRequest>,
    releases: Vec<ReleaseRequest>,
    settle_failures: VecDeque<CustodyError>,
    release_failures: VecDeque<CustodyError>,
    payout_mode: PayoutMode,
    delay: Option<Duration>,
    next_reference: u64,
}

impl Ledger {
    fn reference(&mut self, prefix: &str) -> String {
        self.next_reference += 1;
        format!("{prefix}-{:06}", self.next_reference)
    }
}

/// Development custody. Accepts any non-empty proof, records every call
/// and can be told to fail or stall.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCustody {
    ledger: Arc<Mutex<Ledger>>,
}

impl InMemoryCustody {
    /// Create a new in-memory custody.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` payouts with `error`.
    pub async fn fail_settlements(&self, times: usize, error: CustodyError) {
        let mut ledger = self.ledger.lock().await;
        ledger.settle_failures.extend(std::iter::repeat(error).take(times));
    }

    /// Fail the next `times` releases with `error`.
    pub async fn fail_releases(&self, times: usize, error: CustodyError) {
        let mut ledger = self.ledger.lock().await;
        ledger.release_failures.extend(std::iter::repeat(error).take(times));
    }

    /// Switch payout behaviour.
    pub async fn set_payout_mode(&self, mode: PayoutMode) {
        self.ledger.lock().await.payout_mode = mode;
    }

    /// Stall every call by `delay`.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.ledger.lock().await.delay = delay;
    }

    /// Deposits accepted so far.
    pub async fn deposits(&self) -> Vec<DepositRequest> {
        self.ledger.lock().await.deposits.clone()
    }

    /// Payouts accepted so far.
    pub async fn settlements(&self) -> Vec<PayoutRequest> {
        self.ledger.lock().await.settlements.clone()
    }

    /// Releases accepted so far.
    pub async fn releases(&self) -> Vec<ReleaseRequest> {
        self.ledger.lock().await.releases.clone()
    }

    async fn stall(&self) {
        let delay = self.ledger.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CustodyGateway for InMemoryCustody {
    async fn verify_deposit(&self, request: &DepositRequest) -> Result<String, CustodyError> {
        self.stall().await;
        if request.proof.reference.trim().is_empty() {
            return Err(CustodyError::InvalidProof);
        }
        let mut ledger = self.ledger.lock().await;
        if ledger
            .deposits
            .iter()
            .any(|d| d.proof.reference == request.proof.reference)
        {
            return Err(CustodyError::Rejected("proof already used".into()));
        }
        ledger.deposits.push(request.clone());
        Ok(ledger.reference("dep"))
    }

    async fn settle(&self, request: &PayoutRequest) -> Result<PayoutReceipt, CustodyError> {
        self.stall().await;
        let mut ledger = self.ledger.lock().await;
        if let Some(error) = ledger.settle_failures.pop_front() {
            return Err(error);
        }
        ledger.settlements.push(request.clone());
        let reference = ledger.reference("pay");
        Ok(match ledger.payout_mode {
            PayoutMode::Confirm => PayoutReceipt::Confirmed { reference },
            PayoutMode::Submit => PayoutReceipt::Submitted { reference },
        })
    }

    async fn release(&self, request: &ReleaseRequest) -> Result<String, CustodyError> {
        self.stall().await;
        let mut ledger = self.ledger.lock().await;
        if let Some(error) = ledger.release_failures.pop_front() {
            return Err(error);
        }
        ledger.releases.push(request.clone());
        Ok(ledger.reference("rel"))
    }
}
