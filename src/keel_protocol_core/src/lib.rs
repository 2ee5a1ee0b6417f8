//! Keel Protocol accounting core.
//!
//! Deterministic state machine for a collateralized-debt-position
//! stablecoin: the sorted vault ledger, the liquidation engine, hints and
//! redemptions. Token transfers, prices and incentives live behind the
//! trait seams in [`management`]; hosts drive the core by passing
//! implementations and timestamps into each entry point.

use rust_decimal_macros::dec;

pub mod event;
pub mod guard;
pub mod hints;
pub mod ledger;
pub mod liquidation;
pub mod management;
pub mod numeric;
pub mod redemption;
pub mod sim;
pub mod sorted;
pub mod state;
pub mod storage;
pub mod vault;


use candid::{CandidType, Principal};
use management::{PriceError, TransferError};
use numeric::{KUSD, Ratio, E18, SEC_NANOS};
use serde::Deserialize;

pub use state::{InitArg, Mode, Protocol, ProtocolState};

/// Vaults below this individual collateral ratio can be liquidated.
pub const MINIMUM_COLLATERAL_RATIO: Ratio = Ratio::new(dec!(1.1));

/// Below this system-wide ratio a market enters recovery mode.
pub const CRITICAL_COLLATERAL_RATIO: Ratio = Ratio::new(dec!(1.5));

pub const HUNDRED_PERCENT: Ratio = Ratio::new(dec!(1));

/// Fixed kUSD amount reserved in every vault to pay whoever triggers its
/// liquidation.
pub const DEBT_GAS_COMPENSATION: KUSD = KUSD::new(200 * E18);

/// Share of liquidated collateral paid to the liquidation caller,
/// as a divisor (1/200 = 0.5%).
pub const COLL_GAS_COMPENSATION_DIVISOR: u128 = 200;

/// Smallest debt a vault may carry, gas compensation excluded.
pub const MIN_NET_DEBT: KUSD = KUSD::new(1_800 * E18);

/// Default one-time fee on newly borrowed kUSD.
pub const BORROWING_FEE: Ratio = Ratio::new(dec!(0.005));

pub const REDEMPTION_FEE_FLOOR: Ratio = Ratio::new(dec!(0.005));
pub const REDEMPTION_FEE_CEILING: Ratio = Ratio::new(dec!(0.05));

/// Hourly decay of the redemption base rate.
pub const REDEMPTION_DECAY_FACTOR: Ratio = Ratio::new(dec!(0.94));

/// The base rate grows by half the redeemed fraction of total debt.
pub const REDEMPTION_RATE_HALF: Ratio = Ratio::new(dec!(0.5));

/// Redemptions stay disabled this long after deployment.
pub const REDEMPTION_BOOTSTRAP_PERIOD_NANOS: u64 = 14 * 24 * 3_600 * SEC_NANOS;

#[derive(CandidType, Clone, Debug, PartialEq, Deserialize)]
pub enum ProtocolError {
    AlreadyProcessing,
    TooManyConcurrentRequests,
    TemporarilyUnavailable(String),
    CollateralNotRegistered(Principal),
    CollateralAlreadyRegistered(Principal),
    VaultNotFound { vault_id: u64 },
    CallerNotOwner,
    AmountTooLow { minimum_amount: u128 },
    InsufficientCollateral { available: u128 },
    InsufficientFunds { balance: u128 },
    CollateralRatioTooLow { ratio: f64, minimum_ratio: f64 },
    NothingToLiquidate,
    NothingToRedeem,
    RedemptionsNotActive { active_at: u64 },
    FeeTooHigh { fee: f64, maximum_fee: f64 },
    NoSurplusToClaim,
    TransferError(TransferError),
    PriceError(PriceError),
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}

#[macro_export]
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr, $err:expr) => {
        if $lhs != $rhs {
            return Err($err);
        }
    };
}
