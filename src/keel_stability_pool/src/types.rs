use candid::{CandidType, Principal};
use keel_protocol_core::management::TransferError;
use keel_protocol_core::numeric::{E18, KUSD};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 18-decimal unit for the compounding product and the gain sums.
pub const PRECISION: U256 = U256([1_000_000_000_000_000_000, 0, 0, 0]);

/// When P would drop below 1e9 it is multiplied by this and the scale
/// advances, keeping P in [1e9, 1e18].
pub const SCALE_FACTOR: U256 = U256([1_000_000_000, 0, 0, 0]);

/// Compounded balances below one billionth of the original deposit are
/// treated as zero. Policy constant, not a numerical necessity.
pub const COMPOUNDED_DEPOSIT_FLOOR_DIVISOR: u128 = 1_000_000_000;

/// Smallest accepted deposit, 1 kUSD.
pub const MINIMUM_DEPOSIT: KUSD = KUSD::new(E18);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub initial_value: KUSD,
    /// Set on every provide; withdrawing at the same timestamp is refused.
    pub last_deposit_time: u64,
}

/// Accumulator values frozen at the depositor's last balance change. Gains
/// and the compounded balance are differences against these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshots {
    pub p: U256,
    pub g: U256,
    pub sums: BTreeMap<Principal, U256>,
    pub epoch: u64,
    pub scale: u64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum StabilityPoolError {
    AmountTooLow { minimum_amount: u128 },
    InsufficientPoolBalance { available: u128 },
    NoDepositorFound,
    DepositTooRecent,
    Unauthorized,
    TemporarilyUnavailable(String),
    TransferError(TransferError),
}

impl From<TransferError> for StabilityPoolError {
    fn from(e: TransferError) -> Self {
        StabilityPoolError::TransferError(e)
    }
}
