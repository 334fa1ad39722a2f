//! Settlement Bridge
//!
//! Runs custody calls under a timeout and turns their results into
//! [`SettlementReport`]s for the match actor. Retrying is the state
//! machine's job; one bridge call is one attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::game::machine::SettlementReport;
use crate::settlement::gateway::{
    CustodyError, CustodyGateway, DepositRequest, PayoutReceipt, PayoutRequest, ReleaseRequest,
};

/// Shared handle to the custody gateway.
#[derive(Clone)]
pub struct SettlementBridge {
    gateway: Arc<dyn CustodyGateway>,
    call_timeout: Duration,
}

impl std::fmt::Debug for SettlementBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementBridge")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl SettlementBridge {
    /// Create a new bridge.
    pub fn new(gateway: Arc<dyn CustodyGateway>, call_timeout: Duration) -> Self {
        Self { gateway, call_timeout }
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, CustodyError>>,
    ) -> Result<T, CustodyError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CustodyError::Timeout),
        }
    }

    /// Verify a deposit; returns the custody receipt.
    pub async fn confirm_deposit(&self, request: DepositRequest) -> Result<String, CustodyError> {
        let result = self.call(self.gateway.verify_deposit(&request)).await;
        match &result {
            Ok(receipt) => debug!(match_id = %request.match_id, seat = ?request.seat, %receipt, "deposit verified"),
            Err(e) => warn!(match_id = %request.match_id, seat = ?request.seat, reason = e.reason_code(), "deposit refused"),
        }
        result
    }

    /// One payout attempt.
    pub async fn request_settlement(&self, request: PayoutRequest) -> SettlementReport {
        match self.call(self.gateway.settle(&request)).await {
            Ok(PayoutReceipt::Confirmed { reference }) => {
                debug!(match_id = %request.match_id, %reference, "payout confirmed");
                SettlementReport::Confirmed { reference: Some(reference) }
            }
            Ok(PayoutReceipt::Submitted { reference }) => {
                debug!(match_id = %request.match_id, %reference, "payout submitted");
                SettlementReport::Submitted { reference }
            }
            Err(e) => {
                warn!(match_id = %request.match_id, reason = e.reason_code(), "payout failed");
                SettlementReport::Failed { reason: e.reason_code().to_string() }
            }
        }
    }

    /// One refund attempt over every listed seat. Stops at the first failure.
    pub async fn release_deposits(&self, requests: Vec<ReleaseRequest>) -> SettlementReport {
        let mut released = Vec::with_capacity(requests.len());
        for request in requests {
            match self.call(self.gateway.release(&request)).await {
                Ok(reference) => {
                    debug!(match_id = %request.match_id, seat = ?request.seat, %reference, "stake released");
                    released.push(request.seat);
                }
                Err(e) => {
                    warn!(match_id = %request.match_id, seat = ?request.seat, reason = e.reason_code(), "release failed");
                    return SettlementReport::Refunded {
                        released,
                        failure: Some(e.reason_code().to_string()),
                    };
                }
            }
        }
        SettlementReport::Refunded { released, failure: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{MatchId, WalletAddress};
    use crate::game::state::{Seat, StakeDescriptor};
    use crate::settlement::gateway::InMemoryCustody;

    fn stake() -> StakeDescriptor {
        StakeDescriptor { asset: "mint".into(), equivalent_value: 5 }
    }

    fn payout() -> PayoutRequest {
        PayoutRequest {
            match_id: MatchId::new([4; 16]),
            winner: WalletAddress::from_key_bytes([1; 32]),
            loser: WalletAddress::from_key_bytes([2; 32]),
            stake: stake(),
        }
    }

    fn release(seat: Seat, key: u8) -> ReleaseRequest {
        ReleaseRequest {
            match_id: MatchId::new([4; 16]),
            seat,
            owner: WalletAddress::from_key_bytes([key; 32]),
            stake: stake(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gateway_times_out() {
        let custody = InMemoryCustody::new();
        custody.set_delay(Some(Duration::from_secs(30))).await;
        let bridge = SettlementBridge::new(Arc::new(custody.clone()), Duration::from_secs(5));

        let report = bridge.request_settlement(payout()).await;
        assert_eq!(report, SettlementReport::Failed { reason: "timeout".into() });
        assert!(custody.settlements().await.is_empty());
    }

    #[tokio::test]
    async fn test_payout_modes() {
        let custody = InMemoryCustody::new();
        let bridge = SettlementBridge::new(Arc::new(custody.clone()), Duration::from_secs(5));
        assert!(matches!(
            bridge.request_settlement(payout()).await,
            SettlementReport::Confirmed { reference: Some(_) }
        ));

        custody.set_payout_mode(crate::settlement::gateway::PayoutMode::Submit).await;
        assert!(matches!(
            bridge.request_settlement(payout()).await,
            SettlementReport::Submitted { .. }
        ));
    }

    #[tokio::test]
    async fn test_partial_release_reports_progress() {
        let custody = InMemoryCustody::new();
        let bridge = SettlementBridge::new(Arc::new(custody.clone()), Duration::from_secs(5));
        custody.fail_releases(1, CustodyError::Unavailable).await;

        // first seat fails, so nothing is released
        let report = bridge
            .release_deposits(vec![release(Seat::Creator, 1), release(Seat::Opponent, 2)])
            .await;
        assert_eq!(
            report,
            SettlementReport::Refunded { released: vec![], failure: Some("unavailable".into()) }
        );

        let report = bridge
            .release_deposits(vec![release(Seat::Creator, 1), release(Seat::Opponent, 2)])
            .await;
        assert_eq!(
            report,
            SettlementReport::Refunded { released: vec![Seat::Creator, Seat::Opponent], failure: None }
        );
    }
}
