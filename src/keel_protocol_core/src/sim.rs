//! In-memory implementations of the management seams, for simulations and
//! tests. Balances are explicit: transfers fail with the same error shapes
//! a real token ledger would produce.

use crate::management::{
    CollateralLedger, DebtTokenLedger, IncentiveLedger, PriceSource, PriceError, TransferError,
};
use crate::numeric::{CollateralPrice, Keel, KUSD};
use candid::Principal;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct SimPriceSource {
    prices: BTreeMap<Principal, CollateralPrice>,
}

impl SimPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&mut self, collateral: Principal, price: CollateralPrice) {
        self.prices.insert(collateral, price);
    }
}

impl PriceSource for SimPriceSource {
    fn fetch_price(&self, collateral: Principal) -> Result<CollateralPrice, PriceError> {
        self.prices
            .get(&collateral)
            .copied()
            .ok_or_else(|| PriceError::Unavailable(format!("no price for {}", collateral)))
    }
}

#[derive(Default)]
pub struct SimDebtToken {
    balances: BTreeMap<Principal, KUSD>,
    total_supply: KUSD,
}

impl SimDebtToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_supply(&self) -> KUSD {
        self.total_supply
    }

    fn debit(&mut self, from: &Principal, amount: KUSD) -> Result<(), TransferError> {
        let balance = self.balances.get(from).copied().unwrap_or(KUSD::ZERO);
        match balance.checked_sub(amount) {
            Some(rest) => {
                self.balances.insert(*from, rest);
                Ok(())
            }
            None => Err(TransferError::InsufficientFunds {
                balance: balance.to_u128(),
            }),
        }
    }

    fn credit(&mut self, to: &Principal, amount: KUSD) {
        *self.balances.entry(*to).or_insert(KUSD::ZERO) += amount;
    }
}

impl DebtTokenLedger for SimDebtToken {
    fn mint(&mut self, to: Principal, amount: KUSD) -> Result<(), TransferError> {
        self.credit(&to, amount);
        self.total_supply += amount;
        Ok(())
    }

    fn burn(&mut self, from: Principal, amount: KUSD) -> Result<(), TransferError> {
        self.debit(&from, amount)?;
        self.total_supply -= amount;
        Ok(())
    }

    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: KUSD,
    ) -> Result<(), TransferError> {
        self.debit(&from, amount)?;
        self.credit(&to, amount);
        Ok(())
    }

    fn balance_of(&self, owner: &Principal) -> KUSD {
        self.balances.get(owner).copied().unwrap_or(KUSD::ZERO)
    }
}

/// Tracks per-owner native-decimals balances for any number of collateral
/// tokens, plus what the protocol currently holds in custody.
#[derive(Default)]
pub struct SimCollateralLedger {
    balances: BTreeMap<(Principal, Principal), u128>,
    custody: BTreeMap<Principal, u128>,
    decimals: BTreeMap<Principal, u8>,
}

impl SimCollateralLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_decimals(&mut self, collateral: Principal, decimals: u8) {
        self.decimals.insert(collateral, decimals);
    }

    pub fn fund(&mut self, collateral: Principal, owner: Principal, amount: u128) {
        *self.balances.entry((collateral, owner)).or_insert(0) += amount;
    }

    pub fn balance_of(&self, collateral: Principal, owner: Principal) -> u128 {
        self.balances
            .get(&(collateral, owner))
            .copied()
            .unwrap_or(0)
    }

    pub fn in_custody(&self, collateral: Principal) -> u128 {
        self.custody.get(&collateral).copied().unwrap_or(0)
    }
}

impl CollateralLedger for SimCollateralLedger {
    fn decimals(&self, collateral: Principal) -> u8 {
        self.decimals.get(&collateral).copied().unwrap_or(18)
    }

    fn transfer_in(
        &mut self,
        collateral: Principal,
        from: Principal,
        amount: u128,
    ) -> Result<(), TransferError> {
        let balance = self.balances.entry((collateral, from)).or_insert(0);
        if *balance < amount {
            return Err(TransferError::InsufficientFunds { balance: *balance });
        }
        *balance -= amount;
        *self.custody.entry(collateral).or_insert(0) += amount;
        Ok(())
    }

    fn transfer_out(
        &mut self,
        collateral: Principal,
        to: Principal,
        amount: u128,
    ) -> Result<(), TransferError> {
        let held = self.custody.entry(collateral).or_insert(0);
        if *held < amount {
            return Err(TransferError::InsufficientFunds { balance: *held });
        }
        *held -= amount;
        *self.balances.entry((collateral, to)).or_insert(0) += amount;
        Ok(())
    }
}

#[derive(Default)]
pub struct SimIncentiveLedger {
    allocations: BTreeMap<Principal, Keel>,
    balances: BTreeMap<Principal, Keel>,
}

impl SimIncentiveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, pool: Principal, amount: Keel) {
        *self.allocations.entry(pool).or_insert(Keel::ZERO) += amount;
    }

    pub fn balance_of(&self, owner: Principal) -> Keel {
        self.balances.get(&owner).copied().unwrap_or(Keel::ZERO)
    }
}

impl IncentiveLedger for SimIncentiveLedger {
    fn collect_allocated(&mut self, pool: Principal, amount: Keel) -> Keel {
        let allocation = self.allocations.entry(pool).or_insert(Keel::ZERO);
        let collected = amount.min(*allocation);
        *allocation -= collected;
        *self.balances.entry(pool).or_insert(Keel::ZERO) += collected;
        collected
    }

    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Keel,
    ) -> Result<(), TransferError> {
        let balance = self.balances.get(&from).copied().unwrap_or(Keel::ZERO);
        match balance.checked_sub(amount) {
            Some(rest) => {
                self.balances.insert(from, rest);
                *self.balances.entry(to).or_insert(Keel::ZERO) += amount;
                Ok(())
            }
            None => Err(TransferError::InsufficientFunds {
                balance: balance.to_u128(),
            }),
        }
    }
}
