//! Redemption: kUSD holders exchange the token for collateral at face
//! value, drawn from the weakest vaults first.
//!
//! The walk runs on a working copy of the ledger so a fee above the
//! caller's maximum rejects the whole operation without touching state.

use crate::ledger::VaultLedger;
use crate::numeric::{Collateral, CollateralPrice, KUSD, Ratio, SEC_NANOS};
use crate::vault::{VaultId, VaultStatus};
use crate::{
    ProtocolError, DEBT_GAS_COMPENSATION, MIN_NET_DEBT, REDEMPTION_DECAY_FACTOR,
    REDEMPTION_FEE_CEILING, REDEMPTION_FEE_FLOOR, REDEMPTION_RATE_HALF,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionTotals {
    pub debt_redeemed: KUSD,
    pub collateral_drawn: Collateral,
    pub collateral_fee: Collateral,
    pub fee_rate: Ratio,
    pub vaults_closed: Vec<VaultId>,
}

/// How much one vault contributes to a redemption.
pub(crate) struct RedemptionLot {
    pub debt_lot: KUSD,
    pub collateral_lot: Collateral,
    pub full: bool,
    /// Nominal ratio the vault would have after a partial redemption.
    pub new_nicr: Option<Ratio>,
}

/// Shared between the live walk and the hint simulation so both always
/// agree on lot sizes and truncation.
pub(crate) fn compute_lot(
    entire_debt: KUSD,
    entire_collateral: Collateral,
    remaining: KUSD,
    price: CollateralPrice,
) -> Option<RedemptionLot> {
    let net_debt = entire_debt - DEBT_GAS_COMPENSATION;
    if net_debt <= remaining {
        return Some(RedemptionLot {
            debt_lot: net_debt,
            collateral_lot: net_debt / price,
            full: true,
            new_nicr: None,
        });
    }
    // A partial redemption may not leave the vault below the minimum net
    // debt, so the lot is truncated; a vault already at the minimum
    // contributes nothing and ends the walk.
    if net_debt <= MIN_NET_DEBT {
        return None;
    }
    let debt_lot = remaining.min(net_debt - MIN_NET_DEBT);
    if debt_lot.is_zero() {
        return None;
    }
    let collateral_lot = debt_lot / price;
    let new_debt = entire_debt - debt_lot;
    let new_collateral = entire_collateral - collateral_lot;
    Some(RedemptionLot {
        debt_lot,
        collateral_lot,
        full: false,
        new_nicr: Some(crate::vault::compute_nominal_ratio(new_collateral, new_debt)),
    })
}

/// The redemption entry point starts at the vault with the lowest ICR still
/// at or above the liquidation ratio. Underwater vaults are skipped; their
/// debt is a matter for the liquidation engine.
pub(crate) fn first_redeemable(
    ledger: &VaultLedger,
    price: CollateralPrice,
    mcr: Ratio,
    hint: Option<VaultId>,
) -> Option<VaultId> {
    if let Some(h) = hint {
        if ledger.sorted.contains(h) && ledger.current_icr(h, price) >= mcr {
            let toward_tail = ledger.sorted.next(h);
            if toward_tail.map_or(true, |n| ledger.current_icr(n, price) < mcr) {
                return Some(h);
            }
        }
    }
    let mut cursor = ledger.sorted.last();
    while let Some(id) = cursor {
        if ledger.current_icr(id, price) >= mcr {
            return Some(id);
        }
        cursor = ledger.sorted.prev(id);
    }
    None
}

/// Decayed base rate plus half the redeemed fraction of total debt,
/// clamped into the fee corridor.
pub fn compute_redemption_fee(
    elapsed_hours: u64,
    redeemed: KUSD,
    total_debt: KUSD,
    base_rate: Ratio,
) -> Ratio {
    let decayed = base_rate * REDEMPTION_DECAY_FACTOR.pow(elapsed_hours);
    let proportion = if total_debt.is_zero() {
        Ratio::default()
    } else {
        (redeemed / total_debt) * REDEMPTION_RATE_HALF
    };
    (decayed + proportion)
        .max(REDEMPTION_FEE_FLOOR)
        .min(REDEMPTION_FEE_CEILING)
}

#[allow(clippy::too_many_arguments)]
pub fn redeem_collateral(
    ledger: &mut VaultLedger,
    mcr: Ratio,
    price: CollateralPrice,
    amount: KUSD,
    first_hint: Option<VaultId>,
    partial_prev_hint: Option<VaultId>,
    partial_next_hint: Option<VaultId>,
    partial_nicr: Option<Ratio>,
    max_iterations: u64,
    max_fee: Ratio,
    now: u64,
) -> Result<RedemptionTotals, ProtocolError> {
    let tcr = ledger.total_collateral_ratio(price);
    if tcr < mcr {
        return Err(ProtocolError::CollateralRatioTooLow {
            ratio: tcr.to_f64(),
            minimum_ratio: mcr.to_f64(),
        });
    }

    let mut working = ledger.clone();
    let total_debt_before = working.total_debt();
    let mut totals = RedemptionTotals::default();
    let mut remaining = amount;
    let mut iterations = if max_iterations == 0 {
        u64::MAX
    } else {
        max_iterations
    };
    let mut cursor = first_redeemable(&working, price, mcr, first_hint);

    while let Some(id) = cursor {
        if iterations == 0 || remaining.is_zero() {
            break;
        }
        iterations -= 1;
        let next = working.sorted.prev(id);
        working.apply_pending_rewards(id);
        let (entire_debt, entire_coll, _, _) = working.entire_debt_and_collateral(id);
        let Some(lot) = compute_lot(entire_debt, entire_coll, remaining, price) else {
            break;
        };
        if lot.full {
            working.remove_stake(id);
            let vault = working.close_vault(id, VaultStatus::ClosedByRedemption);
            working.active_debt -= vault.debt;
            working.active_collateral -= vault.collateral;
            working.gas_pool_debt -= DEBT_GAS_COMPENSATION;
            working.record_surplus(vault.owner, entire_coll - lot.collateral_lot);
            totals.vaults_closed.push(id);
        } else {
            // The caller precomputed the post-redemption ratio off-core. A
            // mismatch means the vault changed since; stop rather than
            // reinsert at a wrong rank.
            if partial_nicr != lot.new_nicr {
                break;
            }
            working.decrease_vault_debt(id, lot.debt_lot);
            working.decrease_vault_collateral(id, lot.collateral_lot);
            working.update_stake(id);
            working.reinsert(id, partial_prev_hint, partial_next_hint);
        }
        totals.debt_redeemed += lot.debt_lot;
        totals.collateral_drawn += lot.collateral_lot;
        remaining -= lot.debt_lot;
        cursor = next;
    }

    if totals.debt_redeemed.is_zero() {
        return Err(ProtocolError::NothingToRedeem);
    }

    let elapsed_hours =
        now.saturating_sub(working.last_fee_operation_time) / (3_600 * SEC_NANOS);
    let fee_rate = compute_redemption_fee(
        elapsed_hours,
        totals.debt_redeemed,
        total_debt_before,
        working.base_rate,
    );
    if fee_rate > max_fee {
        return Err(ProtocolError::FeeTooHigh {
            fee: fee_rate.to_f64(),
            maximum_fee: max_fee.to_f64(),
        });
    }
    totals.fee_rate = fee_rate;
    totals.collateral_fee = totals.collateral_drawn * fee_rate;
    working.base_rate = fee_rate;
    working.last_fee_operation_time = now;

    log::info!(
        "redeemed {} kUSD for {} collateral (fee rate {})",
        totals.debt_redeemed,
        totals.collateral_drawn,
        fee_rate,
    );
    *ledger = working;
    Ok(totals)
}
