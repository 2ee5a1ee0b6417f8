//! Offset entry point and the adapter plugging the pool into the
//! liquidation engine.

use crate::state::StabilityPoolState;
use crate::types::StabilityPoolError;
use candid::Principal;
use keel_protocol_core::management::{DebtTokenLedger, IncentiveLedger};
use keel_protocol_core::numeric::{Collateral, KUSD};
use keel_protocol_core::liquidation::StabilityAbsorber;
use keel_protocol_core::{ensure, ensure_eq, ProtocolError};

/// Cancels `debt` against the pooled deposits and credits `collateral` to
/// depositors. Only the registered liquidation engine may call this; the
/// kUSD burn is the caller's responsibility since the pool does not hold
/// the debt token ledger.
pub fn offset(
    state: &mut StabilityPoolState,
    incentives: &mut dyn IncentiveLedger,
    caller: Principal,
    collateral_type: Principal,
    debt_to_offset: KUSD,
    collateral_to_add: Collateral,
    now: u64,
) -> Result<(), StabilityPoolError> {
    ensure_eq!(
        caller,
        state.liquidation_engine,
        StabilityPoolError::Unauthorized
    );
    ensure!(
        !debt_to_offset.is_zero(),
        StabilityPoolError::AmountTooLow { minimum_amount: 1 }
    );
    ensure!(
        debt_to_offset <= state.total_deposits,
        StabilityPoolError::InsufficientPoolBalance {
            available: state.total_deposits.to_u128(),
        }
    );
    // Incentives accrue against the pre-offset total.
    state.trigger_incentive_accrual(incentives, now);
    state.absorb(collateral_type, debt_to_offset, collateral_to_add);
    log::info!(
        "[offset] absorbed {} debt against {} collateral of {}",
        debt_to_offset,
        collateral_to_add,
        collateral_type
    );
    Ok(())
}

/// Lets the liquidation engine treat the pool as its absorber. Burns the
/// offset debt from the pool account as part of each offset.
pub struct EnginePoolAdapter<'a> {
    pub pool: &'a mut StabilityPoolState,
    pub caller: Principal,
    pub debt_token: &'a mut dyn DebtTokenLedger,
    pub incentives: &'a mut dyn IncentiveLedger,
    pub now: u64,
}

impl StabilityAbsorber for EnginePoolAdapter<'_> {
    fn remaining_deposits(&self) -> KUSD {
        self.pool.total_deposits
    }

    fn offset(
        &mut self,
        collateral: Principal,
        debt_to_offset: KUSD,
        collateral_to_add: Collateral,
    ) -> Result<(), ProtocolError> {
        offset(
            self.pool,
            self.incentives,
            self.caller,
            collateral,
            debt_to_offset,
            collateral_to_add,
            self.now,
        )
        .map_err(|error| ProtocolError::TemporarilyUnavailable(format!("{:?}", error)))?;
        self.debt_token
            .burn(self.pool.pool_account, debt_to_offset)
            .map_err(ProtocolError::TransferError)
    }
}
