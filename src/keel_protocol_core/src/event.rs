//! Event log. Every state mutation is recorded as an [`Event`] and the
//! whole protocol state can be rebuilt by [`replay`], which is also how
//! upgrades restore from the persisted log.

use crate::ledger::CollateralConfig;
use crate::liquidation::{LiquidationTotals, LiquidationValues};
use crate::numeric::{Collateral, CollateralPrice, KUSD, Ratio};
use crate::state::{InitArg, Mode, ProtocolState};
use crate::vault::VaultId;
use candid::Principal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "init")]
    Init(InitArg),
    #[serde(rename = "set_mode")]
    SetMode { mode: Mode },
    #[serde(rename = "register_collateral")]
    RegisterCollateral { config: CollateralConfig },
    #[serde(rename = "open_vault")]
    OpenVault {
        vault_id: VaultId,
        owner: Principal,
        collateral_type: Principal,
        /// Recorded debt: borrowed amount plus borrowing fee plus gas
        /// compensation.
        composite_debt: KUSD,
        collateral: Collateral,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
        timestamp: u64,
    },
    #[serde(rename = "add_collateral")]
    AddCollateral {
        vault_id: VaultId,
        amount: Collateral,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    },
    #[serde(rename = "withdraw_collateral")]
    WithdrawCollateral {
        vault_id: VaultId,
        amount: Collateral,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    },
    #[serde(rename = "borrow")]
    Borrow {
        vault_id: VaultId,
        /// Debt added: borrowed amount plus borrowing fee.
        composite_amount: KUSD,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    },
    #[serde(rename = "repay")]
    Repay {
        vault_id: VaultId,
        amount: KUSD,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    },
    #[serde(rename = "close_vault")]
    CloseVault { vault_id: VaultId },
    #[serde(rename = "liquidation")]
    Liquidation {
        collateral_type: Principal,
        /// Per-vault outcomes, applied verbatim on replay so the result
        /// does not depend on reconstructing pool balances.
        values: Vec<LiquidationValues>,
        totals: LiquidationTotals,
        price: CollateralPrice,
        timestamp: u64,
    },
    #[serde(rename = "redemption")]
    Redemption {
        collateral_type: Principal,
        amount: KUSD,
        price: CollateralPrice,
        first_hint: Option<VaultId>,
        partial_prev_hint: Option<VaultId>,
        partial_next_hint: Option<VaultId>,
        partial_nicr: Option<Ratio>,
        max_iterations: u64,
        timestamp: u64,
    },
    #[serde(rename = "claim_surplus")]
    ClaimSurplus {
        collateral_type: Principal,
        owner: Principal,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayLogError {
    EmptyLog,
    InconsistentLog(String),
}

/// Rebuilds the protocol state by folding the event log from its `init`
/// event forward.
pub fn replay(events: &[Event]) -> Result<ProtocolState, ReplayLogError> {
    let mut iter = events.iter();
    let mut state = match iter.next() {
        Some(Event::Init(init)) => ProtocolState::from_init(init.clone()),
        Some(other) => {
            return Err(ReplayLogError::InconsistentLog(format!(
                "first event must be init, got {:?}",
                other
            )))
        }
        None => return Err(ReplayLogError::EmptyLog),
    };
    for event in iter {
        state
            .apply_event(event)
            .map_err(ReplayLogError::InconsistentLog)?;
    }
    Ok(state)
}
