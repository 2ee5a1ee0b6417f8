//! Trait seams between the accounting core and its surroundings: price
//! discovery, the kUSD token, collateral tokens and the incentive token.
//!
//! The core never moves value itself. Entry points sequence inbound
//! transfers before state mutation and outbound transfers after, so a
//! failed inbound transfer aborts before anything is recorded.

use crate::numeric::{CollateralPrice, Keel, KUSD};
use candid::{CandidType, Principal};
use serde::Deserialize;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum TransferError {
    InsufficientFunds { balance: u128 },
    Rejected(String),
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum PriceError {
    Stale,
    Unavailable(String),
}

pub trait PriceSource {
    /// USD value of one whole collateral token.
    fn fetch_price(&self, collateral: Principal) -> Result<CollateralPrice, PriceError>;
}

pub trait DebtTokenLedger {
    fn mint(&mut self, to: Principal, amount: KUSD) -> Result<(), TransferError>;
    fn burn(&mut self, from: Principal, amount: KUSD) -> Result<(), TransferError>;
    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: KUSD,
    ) -> Result<(), TransferError>;
    fn balance_of(&self, owner: &Principal) -> KUSD;
}

pub trait CollateralLedger {
    fn decimals(&self, collateral: Principal) -> u8;
    /// Amounts are in the token's native decimals.
    fn transfer_in(
        &mut self,
        collateral: Principal,
        from: Principal,
        amount: u128,
    ) -> Result<(), TransferError>;
    fn transfer_out(
        &mut self,
        collateral: Principal,
        to: Principal,
        amount: u128,
    ) -> Result<(), TransferError>;
}

pub trait IncentiveLedger {
    /// Draws up to `amount` from the pool's emission allowance and returns
    /// what was actually available.
    fn collect_allocated(&mut self, pool: Principal, amount: Keel) -> Keel;
    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Keel,
    ) -> Result<(), TransferError>;
}

/// Everything an entry point needs from outside the core.
pub struct Externals<'a> {
    pub price: &'a dyn PriceSource,
    pub debt_token: &'a mut dyn DebtTokenLedger,
    pub collateral: &'a mut dyn CollateralLedger,
}
