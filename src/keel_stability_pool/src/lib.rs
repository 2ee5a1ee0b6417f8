//! Stability pool for the Keel protocol.
//!
//! Holds kUSD deposits that absorb liquidated debt in exchange for the
//! liquidated collateral at a discount, and streams incentive-token
//! emission to depositors. All accounting is O(1) per offset via the
//! compounding product P and the gain sums S and G.

pub mod deposits;
pub mod liquidation;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use deposits::{claim_gains, provide, withdraw};
pub use liquidation::{offset, EnginePoolAdapter};
pub use state::StabilityPoolState;
pub use types::{Deposit, Snapshots, StabilityPoolError, MINIMUM_DEPOSIT};

use candid::{CandidType, Principal};
use keel_protocol_core::numeric::{Collateral, Keel, KUSD};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct PoolStatus {
    pub total_deposits: KUSD,
    pub depositor_count: u64,
    pub collateral_balances: BTreeMap<Principal, Collateral>,
    pub emission_rate_per_sec: Keel,
    pub current_epoch: u64,
    pub current_scale: u64,
}

impl StabilityPoolState {
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            total_deposits: self.total_deposits,
            depositor_count: self.deposits.len() as u64,
            collateral_balances: self.collateral_balances.clone(),
            emission_rate_per_sec: self.emission_rate_per_sec,
            current_epoch: self.current_epoch,
            current_scale: self.current_scale,
        }
    }
}
