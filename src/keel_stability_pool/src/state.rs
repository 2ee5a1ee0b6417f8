//! Stability pool state and the P/S/G accounting.
//!
//! Deposits are not updated when debt is absorbed. Instead the pool keeps a
//! running product P of per-offset depletion factors; a deposit's current
//! value is `initial * P / P_snapshot`. Collateral and incentive gains use
//! running sums S and G of per-unit-staked marginals, bucketed by (epoch,
//! scale): the scale advances when P is rescaled to keep its precision, the
//! epoch advances when the pool is fully emptied.

use crate::types::{
    Deposit, Snapshots, COMPOUNDED_DEPOSIT_FLOOR_DIVISOR, PRECISION, SCALE_FACTOR,
};
use candid::Principal;
use keel_protocol_core::management::IncentiveLedger;
use keel_protocol_core::numeric::{mul_div, Collateral, Keel, KUSD, SEC_NANOS};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn to_u128(value: U256) -> u128 {
    u128::try_from(value).unwrap_or(u128::MAX)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityPoolState {
    /// Account holding the pooled kUSD and collecting incentive emission.
    pub pool_account: Principal,
    /// The only principal allowed to offset debt against the pool.
    pub liquidation_engine: Principal,

    pub deposits: BTreeMap<Principal, Deposit>,
    pub snapshots: BTreeMap<Principal, Snapshots>,
    /// Gains already computed for a depositor but not yet paid out.
    pub pending_collateral_gains: BTreeMap<Principal, BTreeMap<Principal, Collateral>>,
    pub pending_incentive_gains: BTreeMap<Principal, Keel>,

    pub total_deposits: KUSD,
    /// Collateral held per market, canonical 18 decimals.
    pub collateral_balances: BTreeMap<Principal, Collateral>,

    pub p: U256,
    pub current_epoch: u64,
    pub current_scale: u64,
    pub epoch_to_scale_to_sums: BTreeMap<(u64, u64), BTreeMap<Principal, U256>>,
    pub epoch_to_scale_to_g: BTreeMap<(u64, u64), U256>,

    /// Truncation residuals. The collateral residual is carried so the pool
    /// never pays out more than it received; the debt residual is carried
    /// the other way so depositors never lose less than the offset debt.
    pub last_collateral_error_offset: BTreeMap<Principal, U256>,
    pub last_debt_loss_error_offset: U256,
    pub last_incentive_error: U256,

    pub emission_rate_per_sec: Keel,
    pub last_emission_time: u64,
}

impl StabilityPoolState {
    pub fn new(
        pool_account: Principal,
        liquidation_engine: Principal,
        emission_rate_per_sec: Keel,
        now: u64,
    ) -> Self {
        Self {
            pool_account,
            liquidation_engine,
            deposits: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            pending_collateral_gains: BTreeMap::new(),
            pending_incentive_gains: BTreeMap::new(),
            total_deposits: KUSD::ZERO,
            collateral_balances: BTreeMap::new(),
            p: PRECISION,
            current_epoch: 0,
            current_scale: 0,
            epoch_to_scale_to_sums: BTreeMap::new(),
            epoch_to_scale_to_g: BTreeMap::new(),
            last_collateral_error_offset: BTreeMap::new(),
            last_debt_loss_error_offset: U256::zero(),
            last_incentive_error: U256::zero(),
            emission_rate_per_sec,
            last_emission_time: now,
        }
    }

    fn sums_at(&self, epoch: u64, scale: u64, collateral: &Principal) -> U256 {
        self.epoch_to_scale_to_sums
            .get(&(epoch, scale))
            .and_then(|bucket| bucket.get(collateral))
            .copied()
            .unwrap_or_else(U256::zero)
    }

    fn g_at(&self, epoch: u64, scale: u64) -> U256 {
        self.epoch_to_scale_to_g
            .get(&(epoch, scale))
            .copied()
            .unwrap_or_else(U256::zero)
    }

    /// Current value of a deposit after all offsets since its snapshot.
    pub fn compounded_deposit(&self, depositor: &Principal) -> KUSD {
        let Some(deposit) = self.deposits.get(depositor) else {
            return KUSD::ZERO;
        };
        let snapshots = &self.snapshots[depositor];
        // A newer epoch means the pool was emptied at least once since.
        if snapshots.epoch < self.current_epoch {
            return KUSD::ZERO;
        }
        let scale_diff = self.current_scale - snapshots.scale;
        if scale_diff > 1 {
            return KUSD::ZERO;
        }
        let initial = U256::from(deposit.initial_value.to_u128());
        let mut compounded = initial * self.p / snapshots.p;
        if scale_diff == 1 {
            compounded /= SCALE_FACTOR;
        }
        let compounded = to_u128(compounded);
        if compounded < deposit.initial_value.to_u128() / COMPOUNDED_DEPOSIT_FLOOR_DIVISOR {
            return KUSD::ZERO;
        }
        KUSD::new(compounded)
    }

    /// Collateral gains accrued since the depositor's snapshot, per market.
    /// Only the snapshot scale and the one after it can hold gains for this
    /// deposit; anything later acts on a balance already rounded to zero.
    pub fn collateral_gains(&self, depositor: &Principal) -> BTreeMap<Principal, Collateral> {
        let mut gains = BTreeMap::new();
        let Some(deposit) = self.deposits.get(depositor) else {
            return gains;
        };
        let snapshots = &self.snapshots[depositor];
        let initial = U256::from(deposit.initial_value.to_u128());
        let mut collaterals: Vec<Principal> = Vec::new();
        for scale in [snapshots.scale, snapshots.scale + 1] {
            if let Some(bucket) = self.epoch_to_scale_to_sums.get(&(snapshots.epoch, scale)) {
                for key in bucket.keys() {
                    if !collaterals.contains(key) {
                        collaterals.push(*key);
                    }
                }
            }
        }
        for collateral in collaterals {
            let snapshot_sum = snapshots
                .sums
                .get(&collateral)
                .copied()
                .unwrap_or_else(U256::zero);
            let first = self.sums_at(snapshots.epoch, snapshots.scale, &collateral) - snapshot_sum;
            let second =
                self.sums_at(snapshots.epoch, snapshots.scale + 1, &collateral) / SCALE_FACTOR;
            let gain = initial * (first + second) / snapshots.p / PRECISION;
            let gain = to_u128(gain);
            if gain > 0 {
                gains.insert(collateral, Collateral::new(gain));
            }
        }
        gains
    }

    /// Incentive-token gain accrued since the depositor's snapshot.
    pub fn incentive_gain(&self, depositor: &Principal) -> Keel {
        let Some(deposit) = self.deposits.get(depositor) else {
            return Keel::ZERO;
        };
        let snapshots = &self.snapshots[depositor];
        let initial = U256::from(deposit.initial_value.to_u128());
        let first = self.g_at(snapshots.epoch, snapshots.scale) - snapshots.g;
        let second = self.g_at(snapshots.epoch, snapshots.scale + 1) / SCALE_FACTOR;
        Keel::new(to_u128(initial * (first + second) / snapshots.p / PRECISION))
    }

    /// Folds linear emission since the last call into G. Runs before every
    /// depositor operation and every offset. Emission while the pool is
    /// empty is collected but not distributed.
    pub fn trigger_incentive_accrual(&mut self, incentives: &mut dyn IncentiveLedger, now: u64) {
        let elapsed = now.saturating_sub(self.last_emission_time);
        if elapsed == 0 {
            return;
        }
        self.last_emission_time = now;
        let issuance = Keel::new(mul_div(
            self.emission_rate_per_sec.to_u128(),
            elapsed as u128,
            SEC_NANOS as u128,
        ));
        if issuance.is_zero() {
            return;
        }
        let collected = incentives.collect_allocated(self.pool_account, issuance);
        if collected.is_zero() || self.total_deposits.is_zero() {
            return;
        }
        let total = U256::from(self.total_deposits.to_u128());
        let numerator = U256::from(collected.to_u128()) * PRECISION + self.last_incentive_error;
        let per_unit = numerator / total;
        self.last_incentive_error = numerator - per_unit * total;
        let marginal = per_unit * self.p;
        *self
            .epoch_to_scale_to_g
            .entry((self.current_epoch, self.current_scale))
            .or_insert_with(U256::zero) += marginal;
    }

    /// Moves the depositor's accrued gains into the pending buckets. The
    /// caller must refresh snapshots afterwards via `update_deposit` or the
    /// gains would be counted again.
    pub(crate) fn stash_gains(&mut self, depositor: &Principal) {
        let collateral_gains = self.collateral_gains(depositor);
        if !collateral_gains.is_empty() {
            let pending = self
                .pending_collateral_gains
                .entry(*depositor)
                .or_default();
            for (collateral, gain) in collateral_gains {
                *pending.entry(collateral).or_insert(Collateral::ZERO) += gain;
            }
        }
        let incentive_gain = self.incentive_gain(depositor);
        if !incentive_gain.is_zero() {
            *self
                .pending_incentive_gains
                .entry(*depositor)
                .or_insert(Keel::ZERO) += incentive_gain;
        }
    }

    /// Rewrites the deposit to `new_value` and snapshots the current
    /// accumulators. A zero value removes the deposit entirely; pending
    /// gains remain claimable.
    pub(crate) fn update_deposit(
        &mut self,
        depositor: &Principal,
        new_value: KUSD,
        last_deposit_time: u64,
    ) {
        if new_value.is_zero() {
            self.deposits.remove(depositor);
            self.snapshots.remove(depositor);
            return;
        }
        self.deposits.insert(
            *depositor,
            Deposit {
                initial_value: new_value,
                last_deposit_time,
            },
        );
        self.snapshots.insert(
            *depositor,
            Snapshots {
                p: self.p,
                g: self.g_at(self.current_epoch, self.current_scale),
                sums: self
                    .epoch_to_scale_to_sums
                    .get(&(self.current_epoch, self.current_scale))
                    .cloned()
                    .unwrap_or_default(),
                epoch: self.current_epoch,
                scale: self.current_scale,
            },
        );
    }

    /// Absorbs `debt` against the pool and books `collateral` as gains.
    /// Preconditions (checked by the caller): `0 < debt <= total_deposits`.
    pub(crate) fn absorb(&mut self, collateral_type: Principal, debt: KUSD, collateral: Collateral) {
        let total = U256::from(self.total_deposits.to_u128());

        // Collateral gain per unit floors, carrying the remainder forward.
        let coll_error = self
            .last_collateral_error_offset
            .entry(collateral_type)
            .or_insert_with(U256::zero);
        let coll_numerator = U256::from(collateral.to_u128()) * PRECISION + *coll_error;
        let coll_gain_per_unit = coll_numerator / total;
        *coll_error = coll_numerator - coll_gain_per_unit * total;

        // Debt loss per unit ceils so the pool always charges at least the
        // offset debt; the overshoot is refunded through the next offset's
        // numerator. An exact depletion is the one case with no rounding.
        let (debt_loss_per_unit, new_error) = if debt == self.total_deposits {
            (PRECISION, U256::zero())
        } else {
            let debt_numerator =
                U256::from(debt.to_u128()) * PRECISION - self.last_debt_loss_error_offset;
            let per_unit = debt_numerator / total + U256::one();
            (per_unit, per_unit * total - debt_numerator)
        };
        self.last_debt_loss_error_offset = new_error;

        let marginal_gain = coll_gain_per_unit * self.p;
        *self
            .epoch_to_scale_to_sums
            .entry((self.current_epoch, self.current_scale))
            .or_default()
            .entry(collateral_type)
            .or_insert_with(U256::zero) += marginal_gain;

        // The epoch turns over only when the depletion factor itself is
        // zero, i.e. the pool was emptied. A tiny surviving remainder keeps
        // the epoch and rescales P instead; multiplying by SCALE_FACTOR
        // before the division keeps the rescaled P nonzero.
        let factor = PRECISION - debt_loss_per_unit;
        if factor.is_zero() {
            self.current_epoch += 1;
            self.current_scale = 0;
            self.p = PRECISION;
        } else if self.p * factor / PRECISION < SCALE_FACTOR {
            self.p = self.p * factor * SCALE_FACTOR / PRECISION;
            self.current_scale += 1;
        } else {
            self.p = self.p * factor / PRECISION;
        }

        *self
            .collateral_balances
            .entry(collateral_type)
            .or_insert(Collateral::ZERO) += collateral;
        self.total_deposits -= debt;
    }

    /// Consistency check used by tests.
    pub fn validate_state(&self) -> Result<(), String> {
        if self.p.is_zero() || self.p > PRECISION {
            return Err(format!("P out of range: {}", self.p));
        }
        if self.deposits.len() != self.snapshots.len() {
            return Err("deposit and snapshot maps disagree on population".to_string());
        }
        for depositor in self.deposits.keys() {
            if !self.snapshots.contains_key(depositor) {
                return Err(format!("depositor {} has no snapshots", depositor));
            }
        }
        let compounded_sum: u128 = self
            .deposits
            .keys()
            .map(|d| self.compounded_deposit(d).to_u128())
            .sum();
        if compounded_sum > self.total_deposits.to_u128() {
            return Err(format!(
                "compounded deposits {} exceed pool total {}",
                compounded_sum, self.total_deposits
            ));
        }
        Ok(())
    }
}
