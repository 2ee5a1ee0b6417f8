//! Liquidation engine.
//!
//! The sequence driver walks the sorted list from the weakest vault upward,
//! classifies each candidate against the market mode, and accumulates one
//! set of totals so the stability pool is hit with a single offset and the
//! ledger with a single redistribution at the end.

use crate::ledger::{CollateralConfig, VaultLedger};
use crate::numeric::{mul_div, Collateral, CollateralPrice, KUSD, Ratio};
use crate::vault::{compute_collateral_ratio, VaultId, VaultStatus};
use crate::{
    ProtocolError, COLL_GAS_COMPENSATION_DIVISOR, CRITICAL_COLLATERAL_RATIO, HUNDRED_PERCENT,
};
use candid::Principal;
use serde::{Deserialize, Serialize};

/// Seam to the stability pool. The engine only ever needs the remaining
/// deposit total and the one offset call per liquidation.
pub trait StabilityAbsorber {
    fn remaining_deposits(&self) -> KUSD;
    fn offset(
        &mut self,
        collateral: Principal,
        debt_to_offset: KUSD,
        collateral_to_add: Collateral,
    ) -> Result<(), ProtocolError>;
}

/// A pool that absorbs nothing, for markets running without one.
pub struct NoAbsorber;

impl StabilityAbsorber for NoAbsorber {
    fn remaining_deposits(&self) -> KUSD {
        KUSD::ZERO
    }

    fn offset(
        &mut self,
        _collateral: Principal,
        _debt_to_offset: KUSD,
        _collateral_to_add: Collateral,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::TemporarilyUnavailable(
            "no stability pool attached".to_string(),
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationMode {
    Normal,
    RecoveryCapped,
    RedistributionOnly,
}

/// Outcome of liquidating a single vault. Debt splits into the offset and
/// redistributed parts; collateral additionally sheds the caller's gas
/// compensation and, in the capped case, the owner's surplus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationValues {
    pub vault_id: VaultId,
    pub mode: LiquidationMode,
    pub entire_debt: KUSD,
    pub entire_collateral: Collateral,
    pub debt_gas_compensation: KUSD,
    pub collateral_gas_compensation: Collateral,
    pub debt_to_offset: KUSD,
    pub collateral_to_pool: Collateral,
    pub debt_to_redistribute: KUSD,
    pub collateral_to_redistribute: Collateral,
    pub collateral_surplus: Collateral,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTotals {
    pub debt_in_sequence: KUSD,
    pub collateral_in_sequence: Collateral,
    pub debt_gas_compensation: KUSD,
    pub collateral_gas_compensation: Collateral,
    pub debt_to_offset: KUSD,
    pub collateral_to_pool: Collateral,
    pub debt_to_redistribute: KUSD,
    pub collateral_to_redistribute: Collateral,
    pub collateral_surplus: Collateral,
    pub vaults: Vec<VaultId>,
}

/// Totals plus the per-vault breakdown, which the event log keeps so
/// replay can apply the same outcome without a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    pub totals: LiquidationTotals,
    pub values: Vec<LiquidationValues>,
}

/// Absorber used on replay: the per-vault splits are already decided, so
/// the offset is a no-op.
pub(crate) struct AcceptingAbsorber;

impl StabilityAbsorber for AcceptingAbsorber {
    fn remaining_deposits(&self) -> KUSD {
        KUSD::ZERO
    }

    fn offset(
        &mut self,
        _collateral: Principal,
        _debt_to_offset: KUSD,
        _collateral_to_add: Collateral,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl LiquidationTotals {
    fn add(&mut self, values: &LiquidationValues) {
        self.debt_in_sequence += values.entire_debt;
        self.collateral_in_sequence += values.entire_collateral;
        self.debt_gas_compensation += values.debt_gas_compensation;
        self.collateral_gas_compensation += values.collateral_gas_compensation;
        self.debt_to_offset += values.debt_to_offset;
        self.collateral_to_pool += values.collateral_to_pool;
        self.debt_to_redistribute += values.debt_to_redistribute;
        self.collateral_to_redistribute += values.collateral_to_redistribute;
        self.collateral_surplus += values.collateral_surplus;
        self.vaults.push(values.vault_id);
    }
}

fn split_with_pool(
    vault_id: VaultId,
    entire_debt: KUSD,
    entire_coll: Collateral,
    remaining_pool: KUSD,
) -> LiquidationValues {
    let coll_gas = entire_coll / COLL_GAS_COMPENSATION_DIVISOR;
    let coll_to_liquidate = entire_coll - coll_gas;
    let (mode, debt_to_offset, coll_to_pool) = if remaining_pool.is_zero() {
        (LiquidationMode::RedistributionOnly, KUSD::ZERO, Collateral::ZERO)
    } else {
        let offset = entire_debt.min(remaining_pool);
        let coll_to_pool = Collateral::new(mul_div(
            coll_to_liquidate.to_u128(),
            offset.to_u128(),
            entire_debt.to_u128(),
        ));
        (LiquidationMode::Normal, offset, coll_to_pool)
    };
    LiquidationValues {
        vault_id,
        mode,
        entire_debt,
        entire_collateral: entire_coll,
        debt_gas_compensation: crate::DEBT_GAS_COMPENSATION,
        collateral_gas_compensation: coll_gas,
        debt_to_offset,
        collateral_to_pool: coll_to_pool,
        debt_to_redistribute: entire_debt - debt_to_offset,
        collateral_to_redistribute: coll_to_liquidate - coll_to_pool,
        collateral_surplus: Collateral::ZERO,
    }
}

fn split_redistribution_only(
    vault_id: VaultId,
    entire_debt: KUSD,
    entire_coll: Collateral,
) -> LiquidationValues {
    let mut values = split_with_pool(vault_id, entire_debt, entire_coll, KUSD::ZERO);
    values.mode = LiquidationMode::RedistributionOnly;
    values
}

/// Capped recovery-mode liquidation: seize exactly `debt * MCR / price` of
/// collateral, return the rest to the owner. Only reachable when the pool
/// can absorb the entire debt.
fn split_capped(
    vault_id: VaultId,
    entire_debt: KUSD,
    entire_coll: Collateral,
    mcr: Ratio,
    price: CollateralPrice,
) -> LiquidationValues {
    let capped_coll = (entire_debt * mcr) / price;
    let capped_coll = capped_coll.min(entire_coll);
    let coll_gas = capped_coll / COLL_GAS_COMPENSATION_DIVISOR;
    LiquidationValues {
        vault_id,
        mode: LiquidationMode::RecoveryCapped,
        entire_debt,
        entire_collateral: entire_coll,
        debt_gas_compensation: crate::DEBT_GAS_COMPENSATION,
        collateral_gas_compensation: coll_gas,
        debt_to_offset: entire_debt,
        collateral_to_pool: capped_coll - coll_gas,
        debt_to_redistribute: KUSD::ZERO,
        collateral_to_redistribute: Collateral::ZERO,
        collateral_surplus: entire_coll - capped_coll,
    }
}

/// Classifies one vault. `None` means the vault is not liquidatable right
/// now: the sequence driver stops there, the batch driver skips it.
fn classify(
    ledger: &VaultLedger,
    mcr: Ratio,
    id: VaultId,
    price: CollateralPrice,
    remaining_pool: KUSD,
    in_recovery: bool,
    tcr: Ratio,
) -> Option<LiquidationValues> {
    let (entire_debt, entire_coll, _, _) = ledger.entire_debt_and_collateral(id);
    let icr = compute_collateral_ratio(entire_coll, entire_debt, price);
    let values = if icr <= HUNDRED_PERCENT {
        // A position worth less than its debt redistributes in every mode;
        // the pool never absorbs it.
        split_redistribution_only(id, entire_debt, entire_coll)
    } else if !in_recovery {
        if icr >= mcr {
            return None;
        }
        split_with_pool(id, entire_debt, entire_coll, remaining_pool)
    } else if icr < mcr {
        split_with_pool(id, entire_debt, entire_coll, remaining_pool)
    } else if icr < tcr && remaining_pool >= entire_debt && !remaining_pool.is_zero() {
        split_capped(id, entire_debt, entire_coll, mcr, price)
    } else {
        return None;
    };
    // Redistribution needs at least one surviving stake to land on.
    if !values.debt_to_redistribute.is_zero()
        && ledger.total_stakes == ledger.vaults[&id].stake
    {
        return None;
    }
    Some(values)
}

/// Removes one classified vault from the ledger. The liquidated amounts
/// stay in the active bucket until `finalize` moves them out.
pub(crate) fn apply_liquidation(ledger: &mut VaultLedger, values: &LiquidationValues) {
    ledger.apply_pending_rewards(values.vault_id);
    ledger.remove_stake(values.vault_id);
    let vault = ledger.close_vault(values.vault_id, VaultStatus::ClosedByLiquidation);
    ledger.record_surplus(vault.owner, values.collateral_surplus);
}

/// Settles the accumulated totals: one pool offset, one redistribution,
/// snapshot refresh, gas pool payout.
pub(crate) fn finalize_liquidation(
    ledger: &mut VaultLedger,
    config: &CollateralConfig,
    pool: &mut dyn StabilityAbsorber,
    totals: &LiquidationTotals,
) -> Result<(), ProtocolError> {
    if !totals.debt_to_offset.is_zero() {
        pool.offset(
            config.collateral_id,
            totals.debt_to_offset,
            totals.collateral_to_pool,
        )?;
    }
    ledger.active_debt -= totals.debt_to_offset;
    ledger.active_collateral = ledger.active_collateral
        - totals.collateral_to_pool
        - totals.collateral_gas_compensation
        - totals.collateral_surplus;
    ledger.redistribute(totals.debt_to_redistribute, totals.collateral_to_redistribute);
    ledger.gas_pool_debt -= totals.debt_gas_compensation;
    ledger.update_system_snapshots();
    log::info!(
        "liquidated {} vaults: offset {} kUSD against the pool, redistributed {} kUSD",
        totals.vaults.len(),
        totals.debt_to_offset,
        totals.debt_to_redistribute,
    );
    Ok(())
}

struct SequenceContext {
    remaining_pool: KUSD,
    system_debt: KUSD,
    system_collateral: Collateral,
    in_recovery: bool,
}

impl SequenceContext {
    fn new(ledger: &VaultLedger, pool: &dyn StabilityAbsorber, price: CollateralPrice) -> Self {
        let system_debt = ledger.total_debt();
        let system_collateral = ledger.total_collateral();
        let tcr = compute_collateral_ratio(system_collateral, system_debt, price);
        Self {
            remaining_pool: pool.remaining_deposits(),
            system_debt,
            system_collateral,
            in_recovery: tcr < CRITICAL_COLLATERAL_RATIO,
        }
    }

    fn tcr(&self, price: CollateralPrice) -> Ratio {
        compute_collateral_ratio(self.system_collateral, self.system_debt, price)
    }

    /// Tracks how a liquidation changes the running system totals: offset
    /// debt leaves, redistributed debt stays; collateral sent to the pool,
    /// the caller or the surplus pool leaves.
    fn absorb(&mut self, values: &LiquidationValues, price: CollateralPrice) {
        self.remaining_pool -= values.debt_to_offset;
        self.system_debt -= values.debt_to_offset;
        self.system_collateral = self.system_collateral
            - values.collateral_to_pool
            - values.collateral_gas_compensation
            - values.collateral_surplus;
        if self.in_recovery && self.tcr(price) >= CRITICAL_COLLATERAL_RATIO {
            self.in_recovery = false;
        }
    }
}

/// Liquidates up to `max_vaults` starting from the weakest position,
/// stopping at the first vault that is safe under the current mode or
/// whose ICR reaches the caller's `max_icr` ceiling.
pub fn liquidate_sequence(
    ledger: &mut VaultLedger,
    config: &CollateralConfig,
    price: CollateralPrice,
    max_vaults: u64,
    max_icr: Ratio,
    pool: &mut dyn StabilityAbsorber,
) -> Result<LiquidationOutcome, ProtocolError> {
    let mut ctx = SequenceContext::new(ledger, pool, price);
    let mut outcome = LiquidationOutcome::default();
    let mut cursor = ledger.sorted.last();
    while let Some(id) = cursor {
        if outcome.values.len() as u64 >= max_vaults {
            break;
        }
        if ledger.current_icr(id, price) >= max_icr {
            break;
        }
        let next = ledger.sorted.prev(id);
        let Some(values) = classify(
            ledger,
            config.liquidation_ratio,
            id,
            price,
            ctx.remaining_pool,
            ctx.in_recovery,
            ctx.tcr(price),
        ) else {
            break;
        };
        apply_liquidation(ledger, &values);
        ctx.absorb(&values, price);
        outcome.totals.add(&values);
        outcome.values.push(values);
        cursor = next;
    }
    if outcome.values.is_empty() {
        return Err(ProtocolError::NothingToLiquidate);
    }
    finalize_liquidation(ledger, config, pool, &outcome.totals)?;
    Ok(outcome)
}

/// Liquidates an explicit list of vaults, skipping ids that are unknown or
/// currently safe.
pub fn liquidate_batch(
    ledger: &mut VaultLedger,
    config: &CollateralConfig,
    price: CollateralPrice,
    vault_ids: &[VaultId],
    pool: &mut dyn StabilityAbsorber,
) -> Result<LiquidationOutcome, ProtocolError> {
    let mut ctx = SequenceContext::new(ledger, pool, price);
    let mut outcome = LiquidationOutcome::default();
    for &id in vault_ids {
        if !ledger.vaults.contains_key(&id) {
            continue;
        }
        let Some(values) = classify(
            ledger,
            config.liquidation_ratio,
            id,
            price,
            ctx.remaining_pool,
            ctx.in_recovery,
            ctx.tcr(price),
        ) else {
            continue;
        };
        apply_liquidation(ledger, &values);
        ctx.absorb(&values, price);
        outcome.totals.add(&values);
        outcome.values.push(values);
    }
    if outcome.values.is_empty() {
        return Err(ProtocolError::NothingToLiquidate);
    }
    finalize_liquidation(ledger, config, pool, &outcome.totals)?;
    Ok(outcome)
}
