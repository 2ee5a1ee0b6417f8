//! Hint producers. Both are pure reads: callers run them off the hot path
//! and feed the results back into the mutating entry points.

use crate::ledger::VaultLedger;
use crate::numeric::{CollateralPrice, KUSD, Ratio};
use crate::redemption::{compute_lot, first_redeemable};
use crate::vault::VaultId;
use candid::CandidType;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Result of the approximate-hint search: the closest vault found, how far
/// off it was, and the final seed so a caller can resume the chain.
#[derive(CandidType, Clone, Debug, Deserialize)]
pub struct ApproxHint {
    pub hint: Option<VaultId>,
    pub diff: f64,
    pub latest_seed: u64,
}

fn next_seed(seed: u64) -> u64 {
    let digest = Sha256::digest(seed.to_be_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Samples `num_trials` random vaults from the dense id array and returns
/// the one whose nominal ratio is closest to `nicr`. With
/// `num_trials ~ sqrt(n)` the follow-up list walk is O(sqrt(n)) expected.
pub fn get_approx_hint(
    ledger: &VaultLedger,
    nicr: Ratio,
    num_trials: u64,
    seed: u64,
) -> ApproxHint {
    let Some(mut hint) = ledger.sorted.last() else {
        return ApproxHint {
            hint: None,
            diff: 0.0,
            latest_seed: seed,
        };
    };
    let mut diff = ledger.nominal_ratio(hint).abs_diff(nicr);
    let mut latest_seed = seed;
    for _ in 1..num_trials {
        latest_seed = next_seed(latest_seed);
        let index = (latest_seed as usize) % ledger.vault_ids.len();
        let candidate = ledger.vault_ids[index];
        let candidate_diff = ledger.nominal_ratio(candidate).abs_diff(nicr);
        if candidate_diff < diff {
            diff = candidate_diff;
            hint = candidate;
        }
    }
    ApproxHint {
        hint: Some(hint),
        diff: diff.to_f64(),
        latest_seed,
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RedemptionHints {
    /// Vault the redemption walk will start at.
    pub first_hint: Option<VaultId>,
    /// Nominal ratio of the partially redeemed vault after the walk, to be
    /// passed back verbatim as `partial_nicr`.
    pub partial_nicr: Option<Ratio>,
    /// The redeemable part of the requested amount once minimum-net-debt
    /// truncation is applied.
    pub truncated_amount: KUSD,
}

/// Simulates a redemption without mutating anything, using the same lot
/// computation as the live walk.
pub fn get_redemption_hints(
    ledger: &VaultLedger,
    mcr: Ratio,
    price: CollateralPrice,
    amount: KUSD,
    max_iterations: u64,
) -> RedemptionHints {
    let first_hint = first_redeemable(ledger, price, mcr, None);
    let mut remaining = amount;
    let mut partial_nicr = None;
    let mut iterations = if max_iterations == 0 {
        u64::MAX
    } else {
        max_iterations
    };
    let mut cursor = first_hint;
    while let Some(id) = cursor {
        if iterations == 0 || remaining.is_zero() {
            break;
        }
        iterations -= 1;
        let (entire_debt, entire_coll, _, _) = ledger.entire_debt_and_collateral(id);
        match compute_lot(entire_debt, entire_coll, remaining, price) {
            None => break,
            Some(lot) if lot.full => {
                remaining -= lot.debt_lot;
                cursor = ledger.sorted.prev(id);
            }
            Some(lot) => {
                partial_nicr = lot.new_nicr;
                remaining -= lot.debt_lot;
                break;
            }
        }
    }
    RedemptionHints {
        first_hint,
        partial_nicr,
        truncated_amount: amount - remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_chain_is_deterministic() {
        let a = next_seed(42);
        let b = next_seed(42);
        assert_eq!(a, b);
        assert_ne!(next_seed(a), a);
    }

    #[test]
    fn empty_ledger_yields_no_hint() {
        let ledger = VaultLedger::new();
        let result = get_approx_hint(&ledger, Ratio::default(), 10, 7);
        assert_eq!(result.hint, None);
        assert_eq!(result.latest_seed, 7);
    }
}
