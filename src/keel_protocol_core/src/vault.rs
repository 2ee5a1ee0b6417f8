use crate::numeric::{Collateral, CollateralPrice, KUSD, Ratio};
use candid::{CandidType, Principal};
use primitive_types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type VaultId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    Active,
    ClosedByOwner,
    ClosedByLiquidation,
    ClosedByRedemption,
}

/// Per-vault snapshot of the market's reward accumulators, taken whenever
/// pending rewards are folded in. The gap between the live accumulator and
/// the snapshot, scaled by the vault's stake, is the vault's pending share.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSnapshot {
    pub collateral: U256,
    pub debt: U256,
}

/// A collateralized debt position. `debt` includes the fixed gas
/// compensation reserved at open; `collateral` is canonical 18-decimal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub vault_id: VaultId,
    pub owner: Principal,
    pub collateral_type: Principal,
    pub debt: KUSD,
    pub collateral: Collateral,
    pub stake: Collateral,
    pub status: VaultStatus,
    pub reward_snapshot: RewardSnapshot,
    /// Position in the ledger's dense id array, kept in sync by swap-remove.
    pub array_index: u32,
}

impl Vault {
    pub fn is_active(&self) -> bool {
        self.status == VaultStatus::Active
    }
}

/// Read view of a vault for off-core consumers.
#[derive(CandidType, Clone, Debug, Deserialize)]
pub struct VaultSummary {
    pub vault_id: VaultId,
    pub owner: Principal,
    pub collateral_type: Principal,
    pub debt: u128,
    pub collateral: u128,
    pub collateral_ratio: f64,
}

impl VaultSummary {
    pub fn new(
        vault: &Vault,
        entire_debt: KUSD,
        entire_collateral: Collateral,
        price: CollateralPrice,
    ) -> Self {
        Self {
            vault_id: vault.vault_id,
            owner: vault.owner,
            collateral_type: vault.collateral_type,
            debt: entire_debt.to_u128(),
            collateral: entire_collateral.to_u128(),
            collateral_ratio: compute_collateral_ratio(entire_collateral, entire_debt, price)
                .to_f64(),
        }
    }
}

/// ICR at the given price. Zero debt maps to the maximal ratio so empty
/// positions sort ahead of everything and never look liquidatable.
pub fn compute_collateral_ratio(
    collateral: Collateral,
    debt: KUSD,
    price: CollateralPrice,
) -> Ratio {
    if debt.is_zero() {
        return Ratio::from(Decimal::MAX);
    }
    (collateral * price) / debt
}

/// Price-free nominal ratio used as the sort key.
pub fn compute_nominal_ratio(collateral: Collateral, debt: KUSD) -> Ratio {
    if debt.is_zero() {
        return Ratio::from(Decimal::MAX);
    }
    collateral / debt
}
