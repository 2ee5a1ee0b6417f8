//! Re-entrancy protection for mutating entry points.
//!
//! One in-flight operation per caller, with a global cap and an expiry so a
//! crashed caller cannot wedge itself out forever.

use crate::numeric::SEC_NANOS;
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_CONCURRENT: usize = 100;

/// Guards older than this are presumed dead and evicted.
const GUARD_TIMEOUT_NANOS: u64 = 600 * SEC_NANOS;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum GuardError {
    AlreadyProcessing,
    TooManyConcurrentRequests,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct GuardEntry {
    started_at: u64,
    operation: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationGuards {
    active: BTreeMap<Principal, GuardEntry>,
}

impl OperationGuards {
    pub fn begin(
        &mut self,
        caller: Principal,
        operation: &str,
        now: u64,
    ) -> Result<(), GuardError> {
        self.active
            .retain(|_, entry| now.saturating_sub(entry.started_at) < GUARD_TIMEOUT_NANOS);
        if self.active.contains_key(&caller) {
            log::debug!("caller {} already has a {} in flight", caller, operation);
            return Err(GuardError::AlreadyProcessing);
        }
        if self.active.len() >= MAX_CONCURRENT {
            return Err(GuardError::TooManyConcurrentRequests);
        }
        self.active.insert(
            caller,
            GuardEntry {
                started_at: now,
                operation: operation.to_string(),
            },
        );
        Ok(())
    }

    pub fn end(&mut self, caller: &Principal) {
        self.active.remove(caller);
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn principal(n: u8) -> Principal {
        Principal::from_slice(&[n; 4])
    }

    #[test]
    fn second_begin_for_same_caller_is_rejected() {
        let mut guards = OperationGuards::default();
        guards.begin(principal(1), "open_vault", 0).unwrap();
        assert_matches!(
            guards.begin(principal(1), "repay", 1),
            Err(GuardError::AlreadyProcessing)
        );
        guards.end(&principal(1));
        guards.begin(principal(1), "repay", 2).unwrap();
    }

    #[test]
    fn stale_guards_expire() {
        let mut guards = OperationGuards::default();
        guards.begin(principal(1), "open_vault", 0).unwrap();
        let later = GUARD_TIMEOUT_NANOS + 1;
        guards.begin(principal(1), "open_vault", later).unwrap();
        assert_eq!(guards.in_flight(), 1);
    }

    #[test]
    fn concurrent_cap_is_enforced() {
        let mut guards = OperationGuards::default();
        for n in 0..MAX_CONCURRENT {
            guards
                .begin(Principal::from_slice(&[n as u8, 1, 2, 3]), "op", 0)
                .unwrap();
        }
        assert_matches!(
            guards.begin(Principal::from_slice(&[255, 255, 255, 255]), "op", 0),
            Err(GuardError::TooManyConcurrentRequests)
        );
    }
}
