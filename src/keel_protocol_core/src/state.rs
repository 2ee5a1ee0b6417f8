//! Protocol state and entry points.
//!
//! [`ProtocolState`] is plain owned data; there are no ambient globals.
//! Mutations flow through [`Event`] values: entry points validate, move
//! inbound funds, then record-and-apply, so `replay` over the log always
//! reproduces the same state.

use crate::ensure;
use crate::event::Event;
use crate::guard::{GuardError, OperationGuards};
use crate::hints::{self, ApproxHint, RedemptionHints};
use crate::ledger::{CollateralConfig, CollateralConfigArg, MarketStatus, VaultLedger};
use crate::liquidation::{
    self, AcceptingAbsorber, LiquidationOutcome, StabilityAbsorber,
};
use crate::management::{Externals, PriceError, TransferError};
use crate::numeric::{
    from_canonical, to_canonical, Collateral, CollateralPrice, KUSD, Ratio,
};
use crate::redemption::{self, RedemptionTotals};
use crate::vault::{compute_collateral_ratio, VaultId, VaultStatus, VaultSummary};
use crate::{
    ProtocolError, BORROWING_FEE, CRITICAL_COLLATERAL_RATIO, DEBT_GAS_COMPENSATION,
    MINIMUM_COLLATERAL_RATIO, MIN_NET_DEBT, REDEMPTION_BOOTSTRAP_PERIOD_NANOS,
    REDEMPTION_FEE_CEILING,
};
use candid::{CandidType, Principal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub enum Mode {
    /// Mutating entry points are rejected.
    ReadOnly,
    #[default]
    GeneralAvailability,
}

#[derive(CandidType, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitArg {
    /// Receives borrowing and redemption fees.
    pub fee_recipient: Principal,
    /// Account the core controls; holds the gas pool kUSD.
    pub protocol_account: Principal,
    pub deployment_time: u64,
    pub initial_mode: Mode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub config: CollateralConfig,
    pub ledger: VaultLedger,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub mode: Mode,
    pub markets: BTreeMap<Principal, Market>,
    pub next_vault_id: VaultId,
    pub deployment_time: u64,
    pub fee_recipient: Principal,
    pub protocol_account: Principal,
    pub guards: OperationGuards,
}

impl ProtocolState {
    pub fn from_init(init: InitArg) -> Self {
        Self {
            mode: init.initial_mode,
            markets: BTreeMap::new(),
            next_vault_id: 0,
            deployment_time: init.deployment_time,
            fee_recipient: init.fee_recipient,
            protocol_account: init.protocol_account,
            guards: OperationGuards::default(),
        }
    }

    pub fn market(&self, collateral: &Principal) -> Result<&Market, ProtocolError> {
        self.markets
            .get(collateral)
            .ok_or(ProtocolError::CollateralNotRegistered(*collateral))
    }

    fn market_of_vault(&self, vault_id: VaultId) -> Result<&Market, ProtocolError> {
        self.markets
            .values()
            .find(|m| m.ledger.vaults.contains_key(&vault_id))
            .ok_or(ProtocolError::VaultNotFound { vault_id })
    }

    /// Applies one event to the state. This is the single mutation path:
    /// live entry points and `replay` both go through it.
    pub fn apply_event(&mut self, event: &Event) -> Result<(), String> {
        match event {
            Event::Init(_) => return Err("duplicate init event".to_string()),
            Event::SetMode { mode } => {
                self.mode = *mode;
            }
            Event::RegisterCollateral { config } => {
                if self.markets.contains_key(&config.collateral_id) {
                    return Err(format!(
                        "collateral {} already registered",
                        config.collateral_id
                    ));
                }
                self.markets.insert(
                    config.collateral_id,
                    Market {
                        config: config.clone(),
                        ledger: VaultLedger::new(),
                    },
                );
            }
            Event::OpenVault {
                vault_id,
                owner,
                collateral_type,
                composite_debt,
                collateral,
                prev_hint,
                next_hint,
                timestamp: _,
            } => {
                let market = self
                    .markets
                    .get_mut(collateral_type)
                    .ok_or_else(|| format!("unknown collateral {}", collateral_type))?;
                market.ledger.open_vault(
                    *vault_id,
                    *owner,
                    *collateral_type,
                    *composite_debt,
                    *collateral,
                    *prev_hint,
                    *next_hint,
                );
                market.ledger.gas_pool_debt += DEBT_GAS_COMPENSATION;
                self.next_vault_id = self.next_vault_id.max(vault_id + 1);
            }
            Event::AddCollateral {
                vault_id,
                amount,
                prev_hint,
                next_hint,
            } => {
                let ledger = self.ledger_of_vault_mut(*vault_id)?;
                ledger.apply_pending_rewards(*vault_id);
                ledger.increase_vault_collateral(*vault_id, *amount);
                ledger.update_stake(*vault_id);
                ledger.reinsert(*vault_id, *prev_hint, *next_hint);
            }
            Event::WithdrawCollateral {
                vault_id,
                amount,
                prev_hint,
                next_hint,
            } => {
                let ledger = self.ledger_of_vault_mut(*vault_id)?;
                ledger.apply_pending_rewards(*vault_id);
                ledger.decrease_vault_collateral(*vault_id, *amount);
                ledger.update_stake(*vault_id);
                ledger.reinsert(*vault_id, *prev_hint, *next_hint);
            }
            Event::Borrow {
                vault_id,
                composite_amount,
                prev_hint,
                next_hint,
            } => {
                let ledger = self.ledger_of_vault_mut(*vault_id)?;
                ledger.apply_pending_rewards(*vault_id);
                ledger.increase_vault_debt(*vault_id, *composite_amount);
                ledger.reinsert(*vault_id, *prev_hint, *next_hint);
            }
            Event::Repay {
                vault_id,
                amount,
                prev_hint,
                next_hint,
            } => {
                let ledger = self.ledger_of_vault_mut(*vault_id)?;
                ledger.apply_pending_rewards(*vault_id);
                ledger.decrease_vault_debt(*vault_id, *amount);
                ledger.reinsert(*vault_id, *prev_hint, *next_hint);
            }
            Event::CloseVault { vault_id } => {
                let ledger = self.ledger_of_vault_mut(*vault_id)?;
                ledger.apply_pending_rewards(*vault_id);
                ledger.remove_stake(*vault_id);
                let vault = ledger.close_vault(*vault_id, VaultStatus::ClosedByOwner);
                ledger.active_debt -= vault.debt;
                ledger.active_collateral -= vault.collateral;
                ledger.gas_pool_debt -= DEBT_GAS_COMPENSATION;
            }
            Event::Liquidation {
                collateral_type,
                values,
                totals,
                ..
            } => {
                let market = self
                    .markets
                    .get_mut(collateral_type)
                    .ok_or_else(|| format!("unknown collateral {}", collateral_type))?;
                let Market { config, ledger } = market;
                for value in values {
                    liquidation::apply_liquidation(ledger, value);
                }
                liquidation::finalize_liquidation(
                    ledger,
                    config,
                    &mut AcceptingAbsorber,
                    totals,
                )
                .map_err(|e| format!("liquidation replay failed: {:?}", e))?;
            }
            Event::Redemption {
                collateral_type,
                amount,
                price,
                first_hint,
                partial_prev_hint,
                partial_next_hint,
                partial_nicr,
                max_iterations,
                timestamp,
            } => {
                let market = self
                    .markets
                    .get_mut(collateral_type)
                    .ok_or_else(|| format!("unknown collateral {}", collateral_type))?;
                redemption::redeem_collateral(
                    &mut market.ledger,
                    market.config.liquidation_ratio,
                    *price,
                    *amount,
                    *first_hint,
                    *partial_prev_hint,
                    *partial_next_hint,
                    *partial_nicr,
                    *max_iterations,
                    REDEMPTION_FEE_CEILING,
                    *timestamp,
                )
                .map_err(|e| format!("redemption replay failed: {:?}", e))?;
            }
            Event::ClaimSurplus {
                collateral_type,
                owner,
            } => {
                let market = self
                    .markets
                    .get_mut(collateral_type)
                    .ok_or_else(|| format!("unknown collateral {}", collateral_type))?;
                market.ledger.take_surplus(owner);
            }
        }
        Ok(())
    }

    fn ledger_of_vault_mut(&mut self, vault_id: VaultId) -> Result<&mut VaultLedger, String> {
        self.markets
            .values_mut()
            .map(|m| &mut m.ledger)
            .find(|l| l.vaults.contains_key(&vault_id))
            .ok_or_else(|| format!("unknown vault {}", vault_id))
    }
}

pub struct Protocol {
    pub state: ProtocolState,
    pub events: Vec<Event>,
}

#[derive(CandidType, Clone, Debug, Deserialize)]
pub struct ProtocolStatus {
    pub mode: Mode,
    pub market_count: u64,
    pub vault_count: u64,
    pub total_debt: u128,
    pub event_count: u64,
    pub operations_in_flight: u64,
}

impl Protocol {
    pub fn new(init: InitArg) -> Self {
        let state = ProtocolState::from_init(init.clone());
        Self {
            state,
            events: vec![Event::Init(init)],
        }
    }

    /// Rebuilds a protocol from a persisted event log.
    pub fn from_events(events: Vec<Event>) -> Result<Self, crate::event::ReplayLogError> {
        let state = crate::event::replay(&events)?;
        Ok(Self { state, events })
    }

    fn record_and_apply(&mut self, event: Event) -> Result<(), ProtocolError> {
        self.state
            .apply_event(&event)
            .map_err(ProtocolError::TemporarilyUnavailable)?;
        self.events.push(event);
        Ok(())
    }

    fn check_mode(&self) -> Result<(), ProtocolError> {
        ensure!(
            self.state.mode == Mode::GeneralAvailability,
            ProtocolError::TemporarilyUnavailable("protocol is in read-only mode".to_string())
        );
        Ok(())
    }

    fn guarded<T>(
        &mut self,
        caller: Principal,
        operation: &str,
        now: u64,
        f: impl FnOnce(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        self.state.guards.begin(caller, operation, now)?;
        let result = f(self);
        self.state.guards.end(&caller);
        result
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<(), ProtocolError> {
        self.record_and_apply(Event::SetMode { mode })
    }

    pub fn register_collateral(&mut self, arg: CollateralConfigArg) -> Result<(), ProtocolError> {
        ensure!(
            !self.state.markets.contains_key(&arg.collateral_id),
            ProtocolError::CollateralAlreadyRegistered(arg.collateral_id)
        );
        let config = CollateralConfig {
            collateral_id: arg.collateral_id,
            decimals: arg.decimals,
            liquidation_ratio: arg
                .liquidation_ratio
                .and_then(|r| Decimal::try_from(r).ok())
                .map(Ratio::from)
                .unwrap_or(MINIMUM_COLLATERAL_RATIO),
            borrowing_fee: arg
                .borrowing_fee
                .and_then(|r| Decimal::try_from(r).ok())
                .map(Ratio::from)
                .unwrap_or(BORROWING_FEE),
        };
        self.record_and_apply(Event::RegisterCollateral { config })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_vault(
        &mut self,
        caller: Principal,
        collateral_type: Principal,
        collateral_amount: u128,
        borrow_amount: KUSD,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<VaultId, ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "open_vault", now, |p| {
            let market = p.state.market(&collateral_type)?;
            ensure!(
                borrow_amount >= MIN_NET_DEBT,
                ProtocolError::AmountTooLow {
                    minimum_amount: MIN_NET_DEBT.to_u128()
                }
            );
            let decimals = market.config.decimals;
            let borrowing_fee = market.config.borrowing_fee;
            let mcr = market.config.liquidation_ratio;
            let collateral = to_canonical(collateral_amount, decimals);
            let price = ext.price.fetch_price(collateral_type)?;
            let fee = borrow_amount * borrowing_fee;
            let composite_debt = borrow_amount + fee + DEBT_GAS_COMPENSATION;
            let icr = compute_collateral_ratio(collateral, composite_debt, price);
            let required = if market.ledger.is_recovery_mode(price) {
                CRITICAL_COLLATERAL_RATIO
            } else {
                mcr
            };
            ensure!(
                icr >= required,
                ProtocolError::CollateralRatioTooLow {
                    ratio: icr.to_f64(),
                    minimum_ratio: required.to_f64(),
                }
            );
            ext.collateral
                .transfer_in(collateral_type, caller, collateral_amount)?;
            let vault_id = p.state.next_vault_id;
            p.record_and_apply(Event::OpenVault {
                vault_id,
                owner: caller,
                collateral_type,
                composite_debt,
                collateral,
                prev_hint,
                next_hint,
                timestamp: now,
            })?;
            ext.debt_token.mint(caller, borrow_amount)?;
            if !fee.is_zero() {
                ext.debt_token.mint(p.state.fee_recipient, fee)?;
            }
            ext.debt_token
                .mint(p.state.protocol_account, DEBT_GAS_COMPENSATION)?;
            log::info!(
                "vault {} opened by {}: {} kUSD against {} collateral",
                vault_id,
                caller,
                borrow_amount,
                collateral
            );
            Ok(vault_id)
        })
    }

    fn owned_vault_market(
        &self,
        caller: &Principal,
        vault_id: VaultId,
    ) -> Result<&Market, ProtocolError> {
        let market = self.state.market_of_vault(vault_id)?;
        ensure!(
            market.ledger.vaults[&vault_id].owner == *caller,
            ProtocolError::CallerNotOwner
        );
        Ok(market)
    }

    pub fn add_collateral(
        &mut self,
        caller: Principal,
        vault_id: VaultId,
        collateral_amount: u128,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<(), ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "add_collateral", now, |p| {
            let market = p.owned_vault_market(&caller, vault_id)?;
            let collateral_type = market.config.collateral_id;
            let amount = to_canonical(collateral_amount, market.config.decimals);
            ext.collateral
                .transfer_in(collateral_type, caller, collateral_amount)?;
            p.record_and_apply(Event::AddCollateral {
                vault_id,
                amount,
                prev_hint,
                next_hint,
            })
        })
    }

    pub fn withdraw_collateral(
        &mut self,
        caller: Principal,
        vault_id: VaultId,
        collateral_amount: u128,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<(), ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "withdraw_collateral", now, |p| {
            let market = p.owned_vault_market(&caller, vault_id)?;
            let collateral_type = market.config.collateral_id;
            let amount = to_canonical(collateral_amount, market.config.decimals);
            let price = ext.price.fetch_price(collateral_type)?;
            let (entire_debt, entire_coll, _, _) =
                market.ledger.entire_debt_and_collateral(vault_id);
            ensure!(
                amount <= entire_coll,
                ProtocolError::InsufficientCollateral {
                    available: entire_coll.to_u128()
                }
            );
            let new_icr =
                compute_collateral_ratio(entire_coll - amount, entire_debt, price);
            let required = if market.ledger.is_recovery_mode(price) {
                CRITICAL_COLLATERAL_RATIO
            } else {
                market.config.liquidation_ratio
            };
            ensure!(
                new_icr >= required,
                ProtocolError::CollateralRatioTooLow {
                    ratio: new_icr.to_f64(),
                    minimum_ratio: required.to_f64(),
                }
            );
            p.record_and_apply(Event::WithdrawCollateral {
                vault_id,
                amount,
                prev_hint,
                next_hint,
            })?;
            ext.collateral
                .transfer_out(collateral_type, caller, collateral_amount)?;
            Ok(())
        })
    }

    pub fn borrow(
        &mut self,
        caller: Principal,
        vault_id: VaultId,
        amount: KUSD,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<(), ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "borrow", now, |p| {
            let market = p.owned_vault_market(&caller, vault_id)?;
            let collateral_type = market.config.collateral_id;
            let price = ext.price.fetch_price(collateral_type)?;
            let fee = amount * market.config.borrowing_fee;
            let composite_amount = amount + fee;
            let (entire_debt, entire_coll, _, _) =
                market.ledger.entire_debt_and_collateral(vault_id);
            let new_icr =
                compute_collateral_ratio(entire_coll, entire_debt + composite_amount, price);
            let required = if market.ledger.is_recovery_mode(price) {
                CRITICAL_COLLATERAL_RATIO
            } else {
                market.config.liquidation_ratio
            };
            ensure!(
                new_icr >= required,
                ProtocolError::CollateralRatioTooLow {
                    ratio: new_icr.to_f64(),
                    minimum_ratio: required.to_f64(),
                }
            );
            p.record_and_apply(Event::Borrow {
                vault_id,
                composite_amount,
                prev_hint,
                next_hint,
            })?;
            ext.debt_token.mint(caller, amount)?;
            if !fee.is_zero() {
                ext.debt_token.mint(p.state.fee_recipient, fee)?;
            }
            Ok(())
        })
    }

    pub fn repay(
        &mut self,
        caller: Principal,
        vault_id: VaultId,
        amount: KUSD,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<(), ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "repay", now, |p| {
            let market = p.owned_vault_market(&caller, vault_id)?;
            let (entire_debt, _, _, _) = market.ledger.entire_debt_and_collateral(vault_id);
            let net_debt = entire_debt - DEBT_GAS_COMPENSATION;
            // Full repayment goes through close_vault; a partial one may
            // not leave the vault below the minimum.
            ensure!(
                amount <= net_debt.saturating_sub(MIN_NET_DEBT),
                ProtocolError::AmountTooLow {
                    minimum_amount: MIN_NET_DEBT.to_u128()
                }
            );
            ext.debt_token.burn(caller, amount)?;
            p.record_and_apply(Event::Repay {
                vault_id,
                amount,
                prev_hint,
                next_hint,
            })
        })
    }

    pub fn close_vault(
        &mut self,
        caller: Principal,
        vault_id: VaultId,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<(), ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "close_vault", now, |p| {
            let market = p.owned_vault_market(&caller, vault_id)?;
            let collateral_type = market.config.collateral_id;
            let decimals = market.config.decimals;
            let price = ext.price.fetch_price(collateral_type)?;
            ensure!(
                !market.ledger.is_recovery_mode(price),
                ProtocolError::TemporarilyUnavailable(
                    "vaults cannot be closed while the market is in recovery mode".to_string()
                )
            );
            let (entire_debt, entire_coll, _, _) =
                market.ledger.entire_debt_and_collateral(vault_id);
            let net_debt = entire_debt - DEBT_GAS_COMPENSATION;
            ext.debt_token.burn(caller, net_debt)?;
            p.record_and_apply(Event::CloseVault { vault_id })?;
            ext.debt_token
                .burn(p.state.protocol_account, DEBT_GAS_COMPENSATION)?;
            ext.collateral.transfer_out(
                collateral_type,
                caller,
                from_canonical(entire_coll, decimals),
            )?;
            Ok(())
        })
    }

    /// `max_icr` bounds the scan: the walk stops at the first vault at or
    /// above it. `None` leaves only the mode rules as stop conditions.
    pub fn liquidate_vaults(
        &mut self,
        caller: Principal,
        collateral_type: Principal,
        max_vaults: u64,
        max_icr: Option<f64>,
        pool: &mut dyn StabilityAbsorber,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<LiquidationOutcome, ProtocolError> {
        self.check_mode()?;
        let max_icr = max_icr
            .and_then(|r| Decimal::try_from(r).ok())
            .map(Ratio::from)
            .unwrap_or(Ratio::from(Decimal::MAX));
        self.guarded(caller, "liquidate_vaults", now, |p| {
            let price = ext.price.fetch_price(collateral_type)?;
            let market = p
                .state
                .markets
                .get_mut(&collateral_type)
                .ok_or(ProtocolError::CollateralNotRegistered(collateral_type))?;
            let Market { config, ledger } = market;
            let outcome = liquidation::liquidate_sequence(
                ledger, config, price, max_vaults, max_icr, pool,
            )?;
            p.finish_liquidation(caller, collateral_type, price, outcome, ext, now)
        })
    }

    pub fn batch_liquidate_vaults(
        &mut self,
        caller: Principal,
        collateral_type: Principal,
        vault_ids: &[VaultId],
        pool: &mut dyn StabilityAbsorber,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<LiquidationOutcome, ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "batch_liquidate_vaults", now, |p| {
            let price = ext.price.fetch_price(collateral_type)?;
            let market = p
                .state
                .markets
                .get_mut(&collateral_type)
                .ok_or(ProtocolError::CollateralNotRegistered(collateral_type))?;
            let Market { config, ledger } = market;
            let outcome =
                liquidation::liquidate_batch(ledger, config, price, vault_ids, pool)?;
            p.finish_liquidation(caller, collateral_type, price, outcome, ext, now)
        })
    }

    /// Records the liquidation event and pays the caller's compensation.
    fn finish_liquidation(
        &mut self,
        caller: Principal,
        collateral_type: Principal,
        price: CollateralPrice,
        outcome: LiquidationOutcome,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<LiquidationOutcome, ProtocolError> {
        let decimals = self.state.market(&collateral_type)?.config.decimals;
        self.events.push(Event::Liquidation {
            collateral_type,
            values: outcome.values.clone(),
            totals: outcome.totals.clone(),
            price,
            timestamp: now,
        });
        ext.debt_token.transfer(
            self.state.protocol_account,
            caller,
            outcome.totals.debt_gas_compensation,
        )?;
        ext.collateral.transfer_out(
            collateral_type,
            caller,
            from_canonical(outcome.totals.collateral_gas_compensation, decimals),
        )?;
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn redeem_collateral(
        &mut self,
        caller: Principal,
        collateral_type: Principal,
        amount: KUSD,
        first_hint: Option<VaultId>,
        partial_prev_hint: Option<VaultId>,
        partial_next_hint: Option<VaultId>,
        partial_nicr: Option<Ratio>,
        max_iterations: u64,
        max_fee: Ratio,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<RedemptionTotals, ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "redeem_collateral", now, |p| {
            let active_at = p.state.deployment_time + REDEMPTION_BOOTSTRAP_PERIOD_NANOS;
            ensure!(
                now >= active_at,
                ProtocolError::RedemptionsNotActive { active_at }
            );
            let balance = ext.debt_token.balance_of(&caller);
            ensure!(
                balance >= amount,
                ProtocolError::InsufficientFunds {
                    balance: balance.to_u128()
                }
            );
            let price = ext.price.fetch_price(collateral_type)?;
            let market = p
                .state
                .markets
                .get_mut(&collateral_type)
                .ok_or(ProtocolError::CollateralNotRegistered(collateral_type))?;
            let decimals = market.config.decimals;
            let fee_recipient = p.state.fee_recipient;
            let protocol_account = p.state.protocol_account;
            let totals = redemption::redeem_collateral(
                &mut market.ledger,
                market.config.liquidation_ratio,
                price,
                amount,
                first_hint,
                partial_prev_hint,
                partial_next_hint,
                partial_nicr,
                max_iterations,
                max_fee,
                now,
            )?;
            p.events.push(Event::Redemption {
                collateral_type,
                amount,
                price,
                first_hint,
                partial_prev_hint,
                partial_next_hint,
                partial_nicr,
                max_iterations,
                timestamp: now,
            });
            ext.debt_token.burn(caller, totals.debt_redeemed)?;
            let closed = totals.vaults_closed.len() as u128;
            if closed > 0 {
                ext.debt_token.burn(
                    protocol_account,
                    KUSD::new(DEBT_GAS_COMPENSATION.to_u128() * closed),
                )?;
            }
            let to_redeemer = totals.collateral_drawn - totals.collateral_fee;
            ext.collateral.transfer_out(
                collateral_type,
                caller,
                from_canonical(to_redeemer, decimals),
            )?;
            if !totals.collateral_fee.is_zero() {
                ext.collateral.transfer_out(
                    collateral_type,
                    fee_recipient,
                    from_canonical(totals.collateral_fee, decimals),
                )?;
            }
            Ok(totals)
        })
    }

    pub fn claim_collateral_surplus(
        &mut self,
        caller: Principal,
        collateral_type: Principal,
        ext: &mut Externals<'_>,
        now: u64,
    ) -> Result<Collateral, ProtocolError> {
        self.check_mode()?;
        self.guarded(caller, "claim_collateral_surplus", now, |p| {
            let market = p.state.market(&collateral_type)?;
            let amount = market
                .ledger
                .collateral_surplus
                .get(&caller)
                .copied()
                .unwrap_or(Collateral::ZERO);
            let decimals = market.config.decimals;
            ensure!(!amount.is_zero(), ProtocolError::NoSurplusToClaim);
            p.record_and_apply(Event::ClaimSurplus {
                collateral_type,
                owner: caller,
            })?;
            ext.collateral.transfer_out(
                collateral_type,
                caller,
                from_canonical(amount, decimals),
            )?;
            Ok(amount)
        })
    }

    pub fn get_approx_hint(
        &self,
        collateral_type: Principal,
        nicr: Ratio,
        num_trials: u64,
        seed: u64,
    ) -> Result<ApproxHint, ProtocolError> {
        let market = self.state.market(&collateral_type)?;
        Ok(hints::get_approx_hint(&market.ledger, nicr, num_trials, seed))
    }

    pub fn get_redemption_hints(
        &self,
        collateral_type: Principal,
        amount: KUSD,
        price: CollateralPrice,
        max_iterations: u64,
    ) -> Result<RedemptionHints, ProtocolError> {
        let market = self.state.market(&collateral_type)?;
        Ok(hints::get_redemption_hints(
            &market.ledger,
            market.config.liquidation_ratio,
            price,
            amount,
            max_iterations,
        ))
    }

    pub fn get_vault(
        &self,
        vault_id: VaultId,
        price: CollateralPrice,
    ) -> Result<VaultSummary, ProtocolError> {
        let market = self.state.market_of_vault(vault_id)?;
        let (entire_debt, entire_coll, _, _) =
            market.ledger.entire_debt_and_collateral(vault_id);
        Ok(VaultSummary::new(
            &market.ledger.vaults[&vault_id],
            entire_debt,
            entire_coll,
            price,
        ))
    }

    pub fn market_status(
        &self,
        collateral_type: Principal,
        price: CollateralPrice,
    ) -> Result<MarketStatus, ProtocolError> {
        let market = self.state.market(&collateral_type)?;
        Ok(MarketStatus::new(&market.config, &market.ledger, price))
    }

    pub fn status(&self) -> ProtocolStatus {
        ProtocolStatus {
            mode: self.state.mode,
            market_count: self.state.markets.len() as u64,
            vault_count: self
                .state
                .markets
                .values()
                .map(|m| m.ledger.vaults.len() as u64)
                .sum(),
            total_debt: self
                .state
                .markets
                .values()
                .map(|m| m.ledger.total_debt().to_u128())
                .sum(),
            event_count: self.events.len() as u64,
            operations_in_flight: self.state.guards.in_flight() as u64,
        }
    }
}

impl From<GuardError> for ProtocolError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::AlreadyProcessing => ProtocolError::AlreadyProcessing,
            GuardError::TooManyConcurrentRequests => ProtocolError::TooManyConcurrentRequests,
        }
    }
}

impl From<TransferError> for ProtocolError {
    fn from(e: TransferError) -> Self {
        ProtocolError::TransferError(e)
    }
}

impl From<PriceError> for ProtocolError {
    fn from(e: PriceError) -> Self {
        ProtocolError::PriceError(e)
    }
}
