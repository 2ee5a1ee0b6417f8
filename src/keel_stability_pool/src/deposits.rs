//! Depositor-facing operations: provide, withdraw and claim.

use crate::state::StabilityPoolState;
use crate::types::{StabilityPoolError, MINIMUM_DEPOSIT};
use candid::Principal;
use keel_protocol_core::ensure;
use keel_protocol_core::management::{CollateralLedger, DebtTokenLedger, IncentiveLedger};
use keel_protocol_core::numeric::{from_canonical, Collateral, Keel, KUSD};
use std::collections::BTreeMap;

/// Accrues incentives, stashes gains and returns the compounded value of the
/// caller's deposit. Every depositor operation starts here so gains are
/// always measured against the snapshots about to be replaced.
fn settle(
    state: &mut StabilityPoolState,
    incentives: &mut dyn IncentiveLedger,
    depositor: &Principal,
    now: u64,
) -> KUSD {
    state.trigger_incentive_accrual(incentives, now);
    let compounded = state.compounded_deposit(depositor);
    state.stash_gains(depositor);
    compounded
}

/// Adds `amount` to the caller's deposit. The kUSD moves into the pool
/// account before the ledger is touched, so a failed transfer leaves the
/// pool unchanged.
pub fn provide(
    state: &mut StabilityPoolState,
    debt_token: &mut dyn DebtTokenLedger,
    incentives: &mut dyn IncentiveLedger,
    caller: Principal,
    amount: KUSD,
    now: u64,
) -> Result<KUSD, StabilityPoolError> {
    ensure!(
        amount >= MINIMUM_DEPOSIT,
        StabilityPoolError::AmountTooLow {
            minimum_amount: MINIMUM_DEPOSIT.to_u128(),
        }
    );
    debt_token.transfer(caller, state.pool_account, amount)?;
    let compounded = settle(state, incentives, &caller, now);
    let new_value = compounded + amount;
    state.total_deposits += amount;
    state.update_deposit(&caller, new_value, now);
    log::info!(
        "[provide] {} deposited {}, compounded balance {}",
        caller,
        amount,
        new_value
    );
    Ok(new_value)
}

/// Withdraws up to `amount` from the caller's compounded deposit; asking
/// for more than is left simply withdraws the whole balance. Withdrawal in
/// the same tick as the last provide is rejected so a deposit cannot dodge
/// an offset it was counted into.
pub fn withdraw(
    state: &mut StabilityPoolState,
    debt_token: &mut dyn DebtTokenLedger,
    incentives: &mut dyn IncentiveLedger,
    caller: Principal,
    amount: KUSD,
    now: u64,
) -> Result<KUSD, StabilityPoolError> {
    let deposit = state
        .deposits
        .get(&caller)
        .ok_or(StabilityPoolError::NoDepositorFound)?;
    ensure!(
        deposit.last_deposit_time != now,
        StabilityPoolError::DepositTooRecent
    );
    let last_deposit_time = deposit.last_deposit_time;
    let compounded = settle(state, incentives, &caller, now);
    let amount = amount.min(compounded);
    let new_value = compounded - amount;
    state.total_deposits -= amount;
    state.update_deposit(&caller, new_value, last_deposit_time);
    debt_token.transfer(state.pool_account, caller, amount)?;
    log::info!(
        "[withdraw] {} withdrew {}, compounded balance {}",
        caller,
        amount,
        new_value
    );
    Ok(new_value)
}

/// Pays out all stashed and freshly accrued gains to the caller. Leaves the
/// deposit itself untouched apart from refreshing its snapshots.
pub fn claim_gains(
    state: &mut StabilityPoolState,
    collateral_ledger: &mut dyn CollateralLedger,
    incentives: &mut dyn IncentiveLedger,
    caller: Principal,
    now: u64,
) -> Result<(BTreeMap<Principal, Collateral>, Keel), StabilityPoolError> {
    let compounded = settle(state, incentives, &caller, now);
    if let Some(deposit) = state.deposits.get(&caller) {
        let last_deposit_time = deposit.last_deposit_time;
        state.update_deposit(&caller, compounded, last_deposit_time);
    }

    let collateral_gains = state.pending_collateral_gains.remove(&caller).unwrap_or_default();
    let incentive_gain = state
        .pending_incentive_gains
        .remove(&caller)
        .unwrap_or(Keel::ZERO);

    for (collateral_type, gain) in &collateral_gains {
        let balance = state
            .collateral_balances
            .entry(*collateral_type)
            .or_insert(Collateral::ZERO);
        *balance = balance.saturating_sub(*gain);
        let decimals = collateral_ledger.decimals(*collateral_type);
        if let Err(error) =
            collateral_ledger.transfer_out(*collateral_type, caller, from_canonical(*gain, decimals))
        {
            // Put the gain back so the depositor can retry the claim.
            *state
                .collateral_balances
                .entry(*collateral_type)
                .or_insert(Collateral::ZERO) += *gain;
            *state
                .pending_collateral_gains
                .entry(caller)
                .or_default()
                .entry(*collateral_type)
                .or_insert(Collateral::ZERO) += *gain;
            return Err(error.into());
        }
    }
    if !incentive_gain.is_zero() {
        if let Err(error) = incentives.transfer(state.pool_account, caller, incentive_gain) {
            *state
                .pending_incentive_gains
                .entry(caller)
                .or_insert(Keel::ZERO) += incentive_gain;
            return Err(error.into());
        }
    }
    log::info!(
        "[claim_gains] {} claimed {} incentive and {} collateral positions",
        caller,
        incentive_gain,
        collateral_gains.len()
    );
    Ok((collateral_gains, incentive_gain))
}
