//! Per-market position ledger.
//!
//! Tracks every vault of one collateral market together with the aggregate
//! buckets liquidation accounting needs: active totals (backing live
//! vaults), pending totals (redistributed but not yet folded into
//! individual vaults), stake bookkeeping and the per-unit-staked reward
//! accumulators.

use crate::numeric::{mul_div, Collateral, CollateralPrice, KUSD, Ratio, E18};
use crate::sorted::SortedVaults;
use crate::vault::{
    compute_collateral_ratio, compute_nominal_ratio, RewardSnapshot, Vault, VaultId, VaultStatus,
};
use crate::CRITICAL_COLLATERAL_RATIO;
use candid::{CandidType, Principal};
use primitive_types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static parameters of one collateral market.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralConfig {
    /// Token this market is collateralized with, also the market key.
    pub collateral_id: Principal,
    /// Native decimal precision of the token (e.g. 8 for ckBTC).
    pub decimals: u8,
    /// Below this ratio a vault can be liquidated.
    pub liquidation_ratio: Ratio,
    /// One-time fee charged on newly borrowed kUSD.
    pub borrowing_fee: Ratio,
}

#[derive(CandidType, Clone, Debug, Deserialize, Serialize)]
pub struct CollateralConfigArg {
    pub collateral_id: Principal,
    pub decimals: u8,
    pub liquidation_ratio: Option<f64>,
    pub borrowing_fee: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultLedger {
    pub vaults: BTreeMap<VaultId, Vault>,
    /// Dense id array for O(1) random sampling by the hint producer.
    /// `Vault::array_index` always points back into it.
    pub vault_ids: Vec<VaultId>,
    pub sorted: SortedVaults,

    /// Debt and collateral backing live vaults.
    pub active_debt: KUSD,
    pub active_collateral: Collateral,
    /// Redistributed debt and collateral not yet folded into vaults.
    pub pending_debt: KUSD,
    pub pending_collateral: Collateral,
    /// kUSD reserved at open time to pay liquidation callers.
    pub gas_pool_debt: KUSD,

    pub total_stakes: Collateral,
    pub total_stakes_snapshot: Collateral,
    pub total_collateral_snapshot: Collateral,

    /// Accumulated rewards per unit staked, 1e18-scaled.
    pub l_collateral: U256,
    pub l_debt: U256,
    pub last_collateral_error_redistribution: U256,
    pub last_debt_error_redistribution: U256,

    /// Collateral overflow from capped liquidations and redeemed-away
    /// vaults, claimable by the original owner.
    pub collateral_surplus: BTreeMap<Principal, Collateral>,

    pub base_rate: Ratio,
    pub last_fee_operation_time: u64,
}

fn reward_share(stake: Collateral, accumulator: U256, snapshot: U256) -> u128 {
    let wide = U256::from(stake.to_u128()) * (accumulator - snapshot) / U256::from(E18);
    u128::try_from(wide).unwrap_or(u128::MAX)
}

impl VaultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_debt(&self) -> KUSD {
        self.active_debt + self.pending_debt
    }

    pub fn total_collateral(&self) -> Collateral {
        self.active_collateral + self.pending_collateral
    }

    pub fn total_collateral_ratio(&self, price: CollateralPrice) -> Ratio {
        compute_collateral_ratio(self.total_collateral(), self.total_debt(), price)
    }

    pub fn is_recovery_mode(&self, price: CollateralPrice) -> bool {
        self.total_collateral_ratio(price) < CRITICAL_COLLATERAL_RATIO
    }

    /// Rewards accumulated for a vault since its last snapshot.
    pub fn pending_rewards(&self, id: VaultId) -> (KUSD, Collateral) {
        let Some(vault) = self.vaults.get(&id) else {
            return (KUSD::ZERO, Collateral::ZERO);
        };
        if vault.stake.is_zero() {
            return (KUSD::ZERO, Collateral::ZERO);
        }
        let debt = reward_share(vault.stake, self.l_debt, vault.reward_snapshot.debt);
        let coll = reward_share(vault.stake, self.l_collateral, vault.reward_snapshot.collateral);
        (KUSD::new(debt), Collateral::new(coll))
    }

    /// Entire (recorded + pending) debt and collateral of a vault. An
    /// unknown id reads as empty, so its ICR is the zero-debt sentinel and
    /// a scan can never mistake a closed vault for an undercollateralized
    /// one.
    pub fn entire_debt_and_collateral(
        &self,
        id: VaultId,
    ) -> (KUSD, Collateral, KUSD, Collateral) {
        let Some(vault) = self.vaults.get(&id) else {
            return (KUSD::ZERO, Collateral::ZERO, KUSD::ZERO, Collateral::ZERO);
        };
        let (pending_debt, pending_coll) = self.pending_rewards(id);
        (
            vault.debt + pending_debt,
            vault.collateral + pending_coll,
            pending_debt,
            pending_coll,
        )
    }

    pub fn nominal_ratio(&self, id: VaultId) -> Ratio {
        let (debt, coll, _, _) = self.entire_debt_and_collateral(id);
        compute_nominal_ratio(coll, debt)
    }

    pub fn current_icr(&self, id: VaultId, price: CollateralPrice) -> Ratio {
        let (debt, coll, _, _) = self.entire_debt_and_collateral(id);
        compute_collateral_ratio(coll, debt, price)
    }

    /// Folds pending redistribution rewards into the vault's recorded
    /// amounts and refreshes its accumulator snapshot.
    pub fn apply_pending_rewards(&mut self, id: VaultId) {
        let (pending_debt, pending_coll) = self.pending_rewards(id);
        if !pending_debt.is_zero() || !pending_coll.is_zero() {
            let vault = self.vaults.get_mut(&id).unwrap();
            vault.debt += pending_debt;
            vault.collateral += pending_coll;
            self.pending_debt -= pending_debt;
            self.pending_collateral -= pending_coll;
            self.active_debt += pending_debt;
            self.active_collateral += pending_coll;
        }
        self.update_reward_snapshot(id);
    }

    pub fn update_reward_snapshot(&mut self, id: VaultId) {
        let snapshot = RewardSnapshot {
            collateral: self.l_collateral,
            debt: self.l_debt,
        };
        self.vaults.get_mut(&id).unwrap().reward_snapshot = snapshot;
    }

    fn compute_new_stake(&self, collateral: Collateral) -> Collateral {
        if self.total_collateral_snapshot.is_zero() {
            collateral
        } else {
            Collateral::new(mul_div(
                collateral.to_u128(),
                self.total_stakes_snapshot.to_u128(),
                self.total_collateral_snapshot.to_u128(),
            ))
        }
    }

    /// Recomputes the vault's stake from its current collateral.
    pub fn update_stake(&mut self, id: VaultId) -> Collateral {
        let collateral = self.vaults[&id].collateral;
        let new_stake = self.compute_new_stake(collateral);
        let vault = self.vaults.get_mut(&id).unwrap();
        let old_stake = vault.stake;
        vault.stake = new_stake;
        self.total_stakes = self.total_stakes - old_stake + new_stake;
        new_stake
    }

    pub fn remove_stake(&mut self, id: VaultId) {
        let vault = self.vaults.get_mut(&id).unwrap();
        self.total_stakes -= vault.stake;
        vault.stake = Collateral::ZERO;
    }

    pub fn open_vault(
        &mut self,
        vault_id: VaultId,
        owner: Principal,
        collateral_type: Principal,
        debt: KUSD,
        collateral: Collateral,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    ) {
        let stake = self.compute_new_stake(collateral);
        let vault = Vault {
            vault_id,
            owner,
            collateral_type,
            debt,
            collateral,
            stake,
            status: VaultStatus::Active,
            reward_snapshot: RewardSnapshot {
                collateral: self.l_collateral,
                debt: self.l_debt,
            },
            array_index: self.vault_ids.len() as u32,
        };
        self.vault_ids.push(vault_id);
        self.total_stakes += stake;
        self.active_debt += debt;
        self.active_collateral += collateral;
        let nicr = compute_nominal_ratio(collateral, debt);
        self.sorted.insert(vault_id, nicr, prev_hint, next_hint);
        self.vaults.insert(vault_id, vault);
    }

    /// Removes a vault from every index. The caller is responsible for the
    /// aggregate totals and the stake, which differ per close reason.
    pub fn close_vault(&mut self, id: VaultId, status: VaultStatus) -> Vault {
        self.sorted.remove(id);
        let mut vault = self.vaults.remove(&id).unwrap();
        vault.status = status;
        let index = vault.array_index as usize;
        let last = self.vault_ids.pop().unwrap();
        if last != id {
            self.vault_ids[index] = last;
            self.vaults.get_mut(&last).unwrap().array_index = index as u32;
        }
        vault
    }

    pub fn increase_vault_collateral(&mut self, id: VaultId, amount: Collateral) {
        self.vaults.get_mut(&id).unwrap().collateral += amount;
        self.active_collateral += amount;
    }

    pub fn decrease_vault_collateral(&mut self, id: VaultId, amount: Collateral) {
        self.vaults.get_mut(&id).unwrap().collateral -= amount;
        self.active_collateral -= amount;
    }

    pub fn increase_vault_debt(&mut self, id: VaultId, amount: KUSD) {
        self.vaults.get_mut(&id).unwrap().debt += amount;
        self.active_debt += amount;
    }

    pub fn decrease_vault_debt(&mut self, id: VaultId, amount: KUSD) {
        self.vaults.get_mut(&id).unwrap().debt -= amount;
        self.active_debt -= amount;
    }

    /// Re-ranks a vault in the sorted list after its amounts changed.
    pub fn reinsert(&mut self, id: VaultId, prev_hint: Option<VaultId>, next_hint: Option<VaultId>) {
        let nicr = self.nominal_ratio(id);
        self.sorted.reinsert(id, nicr, prev_hint, next_hint);
    }

    /// Spreads liquidated debt and collateral across all remaining stakes.
    ///
    /// Division truncation is carried forward through the error terms: the
    /// numerator of each round includes the remainder the previous round
    /// could not distribute.
    pub fn redistribute(&mut self, debt: KUSD, collateral: Collateral) {
        if debt.is_zero() && collateral.is_zero() {
            return;
        }
        debug_assert!(!self.total_stakes.is_zero());
        let stakes = U256::from(self.total_stakes.to_u128());

        let coll_numerator = U256::from(collateral.to_u128()) * U256::from(E18)
            + self.last_collateral_error_redistribution;
        let coll_per_unit = coll_numerator / stakes;
        self.last_collateral_error_redistribution = coll_numerator - coll_per_unit * stakes;

        let debt_numerator =
            U256::from(debt.to_u128()) * U256::from(E18) + self.last_debt_error_redistribution;
        let debt_per_unit = debt_numerator / stakes;
        self.last_debt_error_redistribution = debt_numerator - debt_per_unit * stakes;

        self.l_collateral += coll_per_unit;
        self.l_debt += debt_per_unit;

        self.active_debt -= debt;
        self.active_collateral -= collateral;
        self.pending_debt += debt;
        self.pending_collateral += collateral;
    }

    /// Refreshes the stake-normalization snapshots after a liquidation, so
    /// stakes opened later are scaled against the post-liquidation totals.
    pub fn update_system_snapshots(&mut self) {
        self.total_stakes_snapshot = self.total_stakes;
        self.total_collateral_snapshot = self.total_collateral();
    }

    pub fn record_surplus(&mut self, owner: Principal, amount: Collateral) {
        if amount.is_zero() {
            return;
        }
        *self
            .collateral_surplus
            .entry(owner)
            .or_insert(Collateral::ZERO) += amount;
    }

    pub fn take_surplus(&mut self, owner: &Principal) -> Collateral {
        self.collateral_surplus
            .remove(owner)
            .unwrap_or(Collateral::ZERO)
    }

    /// Consistency check used by tests and debug assertions.
    pub fn validate(&self) -> Result<(), String> {
        let debt_sum: KUSD = self.vaults.values().map(|v| v.debt).sum();
        if debt_sum != self.active_debt {
            return Err(format!(
                "recorded vault debt {} does not match active debt {}",
                debt_sum, self.active_debt
            ));
        }
        let coll_sum: Collateral = self.vaults.values().map(|v| v.collateral).sum();
        if coll_sum != self.active_collateral {
            return Err(format!(
                "recorded vault collateral {} does not match active collateral {}",
                coll_sum, self.active_collateral
            ));
        }
        let stake_sum: Collateral = self.vaults.values().map(|v| v.stake).sum();
        if stake_sum != self.total_stakes {
            return Err("stake sum does not match total stakes".to_string());
        }
        if self.sorted.len() != self.vaults.len() {
            return Err("sorted list and vault map disagree on population".to_string());
        }
        if self.vault_ids.len() != self.vaults.len() {
            return Err("id array and vault map disagree on population".to_string());
        }
        for (index, id) in self.vault_ids.iter().enumerate() {
            if self.vaults[id].array_index as usize != index {
                return Err(format!("vault {} has a stale array index", id));
            }
        }
        let mut previous: Option<Ratio> = None;
        for id in self.sorted.iter() {
            let nicr = self
                .sorted
                .nicr_of(id)
                .ok_or_else(|| "dangling sorted entry".to_string())?;
            if let Some(prev) = previous {
                if nicr > prev {
                    return Err(format!("sorted list out of order at vault {}", id));
                }
            }
            previous = Some(nicr);
        }
        Ok(())
    }
}

/// Read view of one market.
#[derive(CandidType, Clone, Debug, Deserialize)]
pub struct MarketStatus {
    pub collateral_id: Principal,
    pub vault_count: u64,
    pub total_debt: u128,
    pub total_collateral: u128,
    pub total_collateral_ratio: f64,
    pub recovery_mode: bool,
    pub base_rate: f64,
}

impl MarketStatus {
    pub fn new(config: &CollateralConfig, ledger: &VaultLedger, price: CollateralPrice) -> Self {
        let tcr = ledger.total_collateral_ratio(price);
        Self {
            collateral_id: config.collateral_id,
            vault_count: ledger.vaults.len() as u64,
            total_debt: ledger.total_debt().to_u128(),
            total_collateral: ledger.total_collateral().to_u128(),
            total_collateral_ratio: if tcr == Ratio::from(Decimal::MAX) {
                f64::INFINITY
            } else {
                tcr.to_f64()
            },
            recovery_mode: tcr < CRITICAL_COLLATERAL_RATIO,
            base_rate: ledger.base_rate.to_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::E18;
    use rust_decimal_macros::dec;

    fn principal(n: u8) -> Principal {
        Principal::from_slice(&[n; 8])
    }

    fn ledger_with_three_vaults() -> VaultLedger {
        let mut ledger = VaultLedger::new();
        for (id, owner) in [(1u64, 1u8), (2, 2), (3, 3)] {
            ledger.open_vault(
                id,
                principal(owner),
                principal(100),
                KUSD::new(10_000 * E18),
                Collateral::new(E18),
                None,
                None,
            );
        }
        ledger
    }

    #[test]
    fn open_vault_tracks_totals_and_order() {
        let ledger = ledger_with_three_vaults();
        assert_eq!(ledger.active_debt, KUSD::new(30_000 * E18));
        assert_eq!(ledger.active_collateral, Collateral::new(3 * E18));
        assert_eq!(ledger.total_stakes, Collateral::new(3 * E18));
        ledger.validate().unwrap();
    }

    #[test]
    fn redistribution_splits_evenly_across_equal_stakes() {
        let mut ledger = ledger_with_three_vaults();
        ledger.remove_stake(1);
        // The closed vault's amounts stay in the active bucket until the
        // redistribution moves them to pending.
        ledger.close_vault(1, VaultStatus::ClosedByLiquidation);

        ledger.redistribute(KUSD::new(10_000 * E18), Collateral::new(E18));

        let (pending_debt_2, pending_coll_2) = ledger.pending_rewards(2);
        let (pending_debt_3, pending_coll_3) = ledger.pending_rewards(3);
        assert_eq!(pending_debt_2, KUSD::new(5_000 * E18));
        assert_eq!(pending_debt_3, KUSD::new(5_000 * E18));
        assert_eq!(pending_coll_2, Collateral::new(E18 / 2));
        assert_eq!(pending_coll_3, Collateral::new(E18 / 2));
    }

    #[test]
    fn pending_rewards_conserve_redistributed_amounts_with_uneven_stakes() {
        let mut ledger = VaultLedger::new();
        ledger.open_vault(
            1,
            principal(1),
            principal(100),
            KUSD::new(2_000 * E18),
            Collateral::new(E18 / 3),
            None,
            None,
        );
        ledger.open_vault(
            2,
            principal(2),
            principal(100),
            KUSD::new(9_000 * E18),
            Collateral::new(7 * E18 / 11),
            None,
            None,
        );
        let debt = KUSD::new(12_345 * E18 + 678);
        let coll = Collateral::new(E18 / 7);
        // Amounts enter pending without touching the per-vault books.
        let active_debt_before = ledger.active_debt;
        ledger.active_debt += debt;
        ledger.active_collateral += coll;
        ledger.redistribute(debt, coll);
        assert_eq!(ledger.active_debt, active_debt_before);
        assert_eq!(ledger.pending_debt, debt);

        let (d1, c1) = ledger.pending_rewards(1);
        let (d2, c2) = ledger.pending_rewards(2);
        // Truncation may strand dust in the error terms, never overshoot.
        assert!(d1 + d2 <= debt);
        assert!(c1 + c2 <= coll);
        assert!((debt - (d1 + d2)).to_u128() < 1_000);
        assert!((coll - (c1 + c2)).to_u128() < 1_000);
    }

    #[test]
    fn apply_pending_rewards_moves_buckets() {
        let mut ledger = ledger_with_three_vaults();
        ledger.remove_stake(1);
        ledger.close_vault(1, VaultStatus::ClosedByLiquidation);
        ledger.redistribute(KUSD::new(10_000 * E18), Collateral::new(E18));

        ledger.apply_pending_rewards(2);
        assert_eq!(ledger.vaults[&2].debt, KUSD::new(15_000 * E18));
        assert_eq!(ledger.vaults[&2].collateral, Collateral::new(3 * E18 / 2));
        assert_eq!(ledger.pending_debt, KUSD::new(5_000 * E18));
        // Second application is a no-op.
        ledger.apply_pending_rewards(2);
        assert_eq!(ledger.vaults[&2].debt, KUSD::new(15_000 * E18));
        ledger.validate().unwrap();
    }

    #[test]
    fn close_vault_swap_removes_from_id_array() {
        let mut ledger = ledger_with_three_vaults();
        ledger.remove_stake(1);
        let closed = ledger.close_vault(1, VaultStatus::ClosedByOwner);
        ledger.active_debt -= closed.debt;
        ledger.active_collateral -= closed.collateral;
        assert_eq!(ledger.vault_ids, vec![3, 2]);
        assert_eq!(ledger.vaults[&3].array_index, 0);
        ledger.validate().unwrap();
    }

    #[test]
    fn stake_normalization_after_snapshot() {
        let mut ledger = ledger_with_three_vaults();
        // Simulate a liquidation aftermath where snapshots diverge from 1:1.
        ledger.total_stakes_snapshot = Collateral::new(2 * E18);
        ledger.total_collateral_snapshot = Collateral::new(3 * E18);
        ledger.open_vault(
            4,
            principal(4),
            principal(100),
            KUSD::new(3_000 * E18),
            Collateral::new(3 * E18),
            None,
            None,
        );
        assert_eq!(ledger.vaults[&4].stake, Collateral::new(2 * E18));
    }

    #[test]
    fn recovery_mode_follows_price() {
        let ledger = ledger_with_three_vaults();
        // 3 coll * 20_000 = 60_000 usd against 30_000 debt: TCR 2.0.
        assert!(!ledger.is_recovery_mode(CollateralPrice::new(dec!(20000))));
        // At 14_000: TCR 1.4 < 1.5.
        assert!(ledger.is_recovery_mode(CollateralPrice::new(dec!(14000))));
    }

    #[test]
    fn unknown_vault_reads_as_empty_with_maximal_ratio() {
        let ledger = ledger_with_three_vaults();
        let (debt, coll, pending_debt, pending_coll) = ledger.entire_debt_and_collateral(99);
        assert_eq!(debt, KUSD::ZERO);
        assert_eq!(coll, Collateral::ZERO);
        assert_eq!(pending_debt, KUSD::ZERO);
        assert_eq!(pending_coll, Collateral::ZERO);
        assert_eq!(ledger.pending_rewards(99), (KUSD::ZERO, Collateral::ZERO));
        assert_eq!(
            ledger.current_icr(99, CollateralPrice::new(dec!(20000))),
            Ratio::from(Decimal::MAX)
        );
        assert_eq!(ledger.nominal_ratio(99), Ratio::from(Decimal::MAX));
    }

    #[test]
    fn surplus_accumulates_and_clears() {
        let mut ledger = VaultLedger::new();
        ledger.record_surplus(principal(9), Collateral::new(5));
        ledger.record_surplus(principal(9), Collateral::new(7));
        assert_eq!(ledger.take_surplus(&principal(9)), Collateral::new(12));
        assert_eq!(ledger.take_surplus(&principal(9)), Collateral::ZERO);
    }
}
