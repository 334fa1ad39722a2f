//! Settlement Layer
//!
//! Stake custody and payouts. The match actor hands work to the
//! [`SettlementBridge`], which calls the [`CustodyGateway`] and reports
//! back into the actor's queue. Game results never wait on custody.

pub mod bridge;
pub mod gateway;

pub use bridge::SettlementBridge;
pub use gateway::{
    CustodyError, CustodyGateway, DepositRequest, InMemoryCustody, PayoutMode, PayoutReceipt,
    PayoutRequest, ReleaseRequest,
};
