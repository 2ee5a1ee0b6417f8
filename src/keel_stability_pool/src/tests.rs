use crate::deposits::{claim_gains, provide, withdraw};
use crate::liquidation::{offset, EnginePoolAdapter};
use crate::state::StabilityPoolState;
use crate::types::{StabilityPoolError, MINIMUM_DEPOSIT, PRECISION, SCALE_FACTOR};
use assert_matches::assert_matches;
use candid::Principal;
use keel_protocol_core::liquidation::StabilityAbsorber;
use keel_protocol_core::management::{CollateralLedger, DebtTokenLedger};
use keel_protocol_core::numeric::{Collateral, Keel, E18, KUSD, SEC_NANOS};
use keel_protocol_core::sim::{SimCollateralLedger, SimDebtToken, SimIncentiveLedger};
use primitive_types::U256;
use proptest::prelude::*;

fn principal(n: u8) -> Principal {
    Principal::from_slice(&[n; 8])
}

fn pool_account() -> Principal {
    principal(100)
}

fn engine() -> Principal {
    principal(101)
}

fn ckbtc() -> Principal {
    principal(200)
}

struct Setup {
    state: StabilityPoolState,
    debt_token: SimDebtToken,
    collateral: SimCollateralLedger,
    incentives: SimIncentiveLedger,
}

fn setup(emission_rate_per_sec: Keel) -> Setup {
    let state = StabilityPoolState::new(pool_account(), engine(), emission_rate_per_sec, 0);
    Setup {
        state,
        debt_token: SimDebtToken::new(),
        collateral: SimCollateralLedger::new(),
        incentives: SimIncentiveLedger::new(),
    }
}

fn fund_and_provide(s: &mut Setup, depositor: Principal, amount: KUSD, now: u64) {
    s.debt_token.mint(depositor, amount).unwrap();
    provide(
        &mut s.state,
        &mut s.debt_token,
        &mut s.incentives,
        depositor,
        amount,
        now,
    )
    .unwrap();
}

fn run_offset(s: &mut Setup, debt: KUSD, collateral: Collateral, now: u64) {
    // The engine hands the liquidated collateral into custody alongside the
    // offset.
    s.collateral.fund(ckbtc(), engine(), collateral.to_u128());
    s.collateral
        .transfer_in(ckbtc(), engine(), collateral.to_u128())
        .unwrap();
    offset(
        &mut s.state,
        &mut s.incentives,
        engine(),
        ckbtc(),
        debt,
        collateral,
        now,
    )
    .unwrap();
}

#[test]
fn deposit_below_minimum_is_rejected() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    s.debt_token.mint(d, KUSD::new(E18)).unwrap();
    assert_matches!(
        provide(
            &mut s.state,
            &mut s.debt_token,
            &mut s.incentives,
            d,
            KUSD::new(E18 - 1),
            0,
        ),
        Err(StabilityPoolError::AmountTooLow { .. })
    );
    assert!(s.state.deposits.is_empty());
}

#[test]
fn provide_moves_funds_into_pool_account() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(5_000 * E18), 0);
    assert_eq!(s.debt_token.balance_of(&pool_account()), KUSD::new(5_000 * E18));
    assert_eq!(s.debt_token.balance_of(&d), KUSD::ZERO);
    assert_eq!(s.state.total_deposits, KUSD::new(5_000 * E18));
    assert_eq!(s.state.compounded_deposit(&d), KUSD::new(5_000 * E18));
}

#[test]
fn half_pool_offset_halves_p_and_deposit() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);

    run_offset(&mut s, KUSD::new(5_000 * E18), Collateral::new(E18), SEC_NANOS);

    // The debt loss per unit rounds up by one, so P lands one below an
    // exact half.
    assert_eq!(s.state.p, U256::from(500_000_000_000_000_000u128 - 1));
    let compounded = s.state.compounded_deposit(&d);
    assert!(compounded <= KUSD::new(5_000 * E18));
    assert!(compounded >= KUSD::new(5_000 * E18 - 100_000));

    // The sole depositor is owed the full collateral.
    let gains = s.state.collateral_gains(&d);
    assert_eq!(gains.get(&ckbtc()), Some(&Collateral::new(E18)));
    s.state.validate_state().unwrap();
}

#[test]
fn whole_pool_offset_advances_epoch() {
    let mut s = setup(Keel::ZERO);
    let (d1, d2) = (principal(1), principal(2));
    fund_and_provide(&mut s, d1, KUSD::new(6_000 * E18), 0);
    fund_and_provide(&mut s, d2, KUSD::new(4_000 * E18), 0);

    run_offset(
        &mut s,
        KUSD::new(10_000 * E18),
        Collateral::new(50 * E18),
        SEC_NANOS,
    );

    assert_eq!(s.state.current_epoch, 1);
    assert_eq!(s.state.current_scale, 0);
    assert_eq!(s.state.p, PRECISION);
    assert_eq!(s.state.total_deposits, KUSD::ZERO);
    assert_eq!(s.state.compounded_deposit(&d1), KUSD::ZERO);
    assert_eq!(s.state.compounded_deposit(&d2), KUSD::ZERO);

    // Gains from the wiped epoch stay claimable, pro rata.
    assert_eq!(
        s.state.collateral_gains(&d1).get(&ckbtc()),
        Some(&Collateral::new(30 * E18))
    );
    assert_eq!(
        s.state.collateral_gains(&d2).get(&ckbtc()),
        Some(&Collateral::new(20 * E18))
    );
    s.state.validate_state().unwrap();
}

#[test]
fn claim_pays_out_and_is_idempotent() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);
    run_offset(&mut s, KUSD::new(4_000 * E18), Collateral::new(2 * E18), SEC_NANOS);

    let (gains, incentive) = claim_gains(
        &mut s.state,
        &mut s.collateral,
        &mut s.incentives,
        d,
        2 * SEC_NANOS,
    )
    .unwrap();
    assert_eq!(gains.get(&ckbtc()), Some(&Collateral::new(2 * E18)));
    assert_eq!(incentive, Keel::ZERO);
    assert_eq!(s.collateral.balance_of(ckbtc(), d), 2 * E18);

    // A second claim with no new offsets yields nothing and leaves the
    // compounded balance untouched.
    let before = s.state.compounded_deposit(&d);
    let (gains, incentive) = claim_gains(
        &mut s.state,
        &mut s.collateral,
        &mut s.incentives,
        d,
        3 * SEC_NANOS,
    )
    .unwrap();
    assert!(gains.is_empty());
    assert_eq!(incentive, Keel::ZERO);
    assert_eq!(s.state.compounded_deposit(&d), before);
}

#[test]
fn withdraw_in_same_tick_as_provide_is_rejected() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(2_000 * E18), SEC_NANOS);
    assert_matches!(
        withdraw(
            &mut s.state,
            &mut s.debt_token,
            &mut s.incentives,
            d,
            KUSD::new(E18),
            SEC_NANOS,
        ),
        Err(StabilityPoolError::DepositTooRecent)
    );
    withdraw(
        &mut s.state,
        &mut s.debt_token,
        &mut s.incentives,
        d,
        KUSD::new(E18),
        2 * SEC_NANOS,
    )
    .unwrap();
    assert_eq!(s.debt_token.balance_of(&d), KUSD::new(E18));
}

#[test]
fn overdraw_silently_withdraws_the_whole_compounded_balance() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);
    run_offset(&mut s, KUSD::new(6_000 * E18), Collateral::new(E18), SEC_NANOS);

    // The offset ate 6,000 of the deposit; asking for 9,000 drains what is
    // left instead of erroring.
    let compounded = s.state.compounded_deposit(&d);
    assert!(compounded < KUSD::new(9_000 * E18));
    let remaining = withdraw(
        &mut s.state,
        &mut s.debt_token,
        &mut s.incentives,
        d,
        KUSD::new(9_000 * E18),
        2 * SEC_NANOS,
    )
    .unwrap();
    assert_eq!(remaining, KUSD::ZERO);
    assert_eq!(s.debt_token.balance_of(&d), compounded);
    assert_eq!(s.state.compounded_deposit(&d), KUSD::ZERO);
    assert!(!s.state.deposits.contains_key(&d));
}

#[test]
fn unknown_depositor_cannot_withdraw() {
    let mut s = setup(Keel::ZERO);
    assert_matches!(
        withdraw(
            &mut s.state,
            &mut s.debt_token,
            &mut s.incentives,
            principal(9),
            KUSD::new(E18),
            SEC_NANOS,
        ),
        Err(StabilityPoolError::NoDepositorFound)
    );
}

#[test]
fn offset_requires_registered_engine() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(5_000 * E18), 0);
    assert_matches!(
        offset(
            &mut s.state,
            &mut s.incentives,
            principal(9),
            ckbtc(),
            KUSD::new(E18),
            Collateral::new(E18),
            SEC_NANOS,
        ),
        Err(StabilityPoolError::Unauthorized)
    );
}

#[test]
fn offset_cannot_exceed_pool_deposits() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(2_000 * E18), 0);
    assert_matches!(
        offset(
            &mut s.state,
            &mut s.incentives,
            engine(),
            ckbtc(),
            KUSD::new(3_000 * E18),
            Collateral::new(E18),
            SEC_NANOS,
        ),
        Err(StabilityPoolError::InsufficientPoolBalance { .. })
    );
}

#[test]
fn engine_adapter_burns_offset_debt_from_pool() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);
    let supply_before = s.debt_token.total_supply();

    let mut adapter = EnginePoolAdapter {
        pool: &mut s.state,
        caller: engine(),
        debt_token: &mut s.debt_token,
        incentives: &mut s.incentives,
        now: SEC_NANOS,
    };
    assert_eq!(adapter.remaining_deposits(), KUSD::new(10_000 * E18));
    adapter
        .offset(ckbtc(), KUSD::new(4_000 * E18), Collateral::new(E18))
        .unwrap();

    assert_eq!(
        s.debt_token.total_supply(),
        supply_before - KUSD::new(4_000 * E18)
    );
    assert_eq!(
        s.debt_token.balance_of(&pool_account()),
        KUSD::new(6_000 * E18)
    );
    assert_eq!(s.state.total_deposits, KUSD::new(6_000 * E18));
}

#[test]
fn compounded_deposit_shrinks_monotonically_across_offsets() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(100_000 * E18), 0);

    let mut previous = s.state.compounded_deposit(&d);
    for round in 1..=20u64 {
        let debt = KUSD::new(s.state.total_deposits.to_u128() / 7 + 1);
        run_offset(&mut s, debt, Collateral::new(E18 / 10), round * SEC_NANOS);
        let current = s.state.compounded_deposit(&d);
        assert!(current <= previous, "round {}: {} > {}", round, current, previous);
        previous = current;
        s.state.validate_state().unwrap();
    }
}

#[test]
fn deep_depletion_crosses_scale_boundary() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);

    // Leave one part in 1e10 of the pool. The depletion factor drops below
    // the rescale threshold, so the scale advances instead of the epoch.
    let total = s.state.total_deposits.to_u128();
    run_offset(
        &mut s,
        KUSD::new(total - total / 10_000_000_000),
        Collateral::new(E18),
        SEC_NANOS,
    );

    assert_eq!(s.state.current_epoch, 0);
    assert_eq!(s.state.current_scale, 1);
    assert!(s.state.p >= SCALE_FACTOR && s.state.p <= PRECISION);
    // What is left is below one billionth of the original deposit, so the
    // compounded balance reads zero by policy.
    assert_eq!(s.state.compounded_deposit(&d), KUSD::ZERO);
    s.state.validate_state().unwrap();
}

#[test]
fn dust_remainder_rescales_instead_of_starting_an_epoch() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);

    // With P already worn down by earlier rescales, a deep offset can push
    // the naive product to zero even though deposits survive. The epoch
    // must only turn over on a full depletion; here the scale advances.
    s.state.p = U256::from(10_000_000_000u128);
    let total = s.state.total_deposits.to_u128();
    s.state
        .absorb(ckbtc(), KUSD::new(total - total / 10_000_000_000), Collateral::new(E18));

    assert_eq!(s.state.current_epoch, 0);
    assert_eq!(s.state.current_scale, 1);
    assert_eq!(s.state.p, U256::from(999_999_990u128));
    assert_eq!(
        s.state.total_deposits.to_u128(),
        total / 10_000_000_000
    );
}

#[test]
fn compounded_floor_does_not_trigger_above_threshold() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);

    // Leave one part in 1e6: well above the one-billionth floor.
    let total = s.state.total_deposits.to_u128();
    run_offset(
        &mut s,
        KUSD::new(total - total / 1_000_000),
        Collateral::new(E18),
        SEC_NANOS,
    );

    let compounded = s.state.compounded_deposit(&d);
    assert!(!compounded.is_zero());
    assert!(compounded <= KUSD::new(10_000 * E18 / 1_000_000));
}

#[test]
fn depositor_after_scale_change_is_unaffected_by_it() {
    let mut s = setup(Keel::ZERO);
    let (d1, d2) = (principal(1), principal(2));
    fund_and_provide(&mut s, d1, KUSD::new(10_000 * E18), 0);
    let total = s.state.total_deposits.to_u128();
    run_offset(
        &mut s,
        KUSD::new(total - total / 10_000_000_000),
        Collateral::new(E18),
        SEC_NANOS,
    );
    assert_eq!(s.state.current_scale, 1);

    fund_and_provide(&mut s, d2, KUSD::new(5_000 * E18), 2 * SEC_NANOS);
    let half = KUSD::new(s.state.total_deposits.to_u128() / 2);
    run_offset(&mut s, half, Collateral::new(E18), 3 * SEC_NANOS);

    let compounded = s.state.compounded_deposit(&d2);
    assert!(compounded >= KUSD::new(2_500 * E18 - E18));
    assert!(compounded <= KUSD::new(2_500 * E18));
    assert!(s.state.collateral_gains(&d2).get(&ckbtc()).is_some());
}

#[test]
fn incentive_emission_is_capped_by_allocation() {
    let mut s = setup(Keel::new(E18));
    s.incentives.allocate(pool_account(), Keel::new(10 * E18));
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);

    // 100 seconds at 1 token/sec, but only 10 tokens were ever allocated.
    run_offset(
        &mut s,
        KUSD::new(E18),
        Collateral::new(E18 / 100),
        100 * SEC_NANOS,
    );
    assert_eq!(s.state.incentive_gain(&d), Keel::new(10 * E18));

    // The allowance is exhausted, further elapsed time adds nothing.
    let (_, incentive) = claim_gains(
        &mut s.state,
        &mut s.collateral,
        &mut s.incentives,
        d,
        200 * SEC_NANOS,
    )
    .unwrap();
    assert_eq!(incentive, Keel::new(10 * E18));
    assert_eq!(s.incentives.balance_of(d), Keel::new(10 * E18));
    assert_eq!(s.state.incentive_gain(&d), Keel::ZERO);
}

#[test]
fn incentives_split_pro_rata_between_depositors() {
    let mut s = setup(Keel::new(E18));
    s.incentives.allocate(pool_account(), Keel::new(1_000 * E18));
    let (d1, d2) = (principal(1), principal(2));
    fund_and_provide(&mut s, d1, KUSD::new(7_500 * E18), 0);
    fund_and_provide(&mut s, d2, KUSD::new(2_500 * E18), 0);

    run_offset(&mut s, KUSD::new(E18), Collateral::new(1), 40 * SEC_NANOS);

    let g1 = s.state.incentive_gain(&d1);
    let g2 = s.state.incentive_gain(&d2);
    assert!(g1.to_u128().abs_diff(30 * E18) < 1_000);
    assert!(g2.to_u128().abs_diff(10 * E18) < 1_000);
}

#[test]
fn gains_survive_full_withdrawal() {
    let mut s = setup(Keel::ZERO);
    let d = principal(1);
    fund_and_provide(&mut s, d, KUSD::new(10_000 * E18), 0);
    run_offset(&mut s, KUSD::new(5_000 * E18), Collateral::new(E18), SEC_NANOS);

    let compounded = s.state.compounded_deposit(&d);
    withdraw(
        &mut s.state,
        &mut s.debt_token,
        &mut s.incentives,
        d,
        compounded,
        2 * SEC_NANOS,
    )
    .unwrap();
    assert!(!s.state.deposits.contains_key(&d));

    let (gains, _) = claim_gains(
        &mut s.state,
        &mut s.collateral,
        &mut s.incentives,
        d,
        3 * SEC_NANOS,
    )
    .unwrap();
    assert_eq!(gains.get(&ckbtc()), Some(&Collateral::new(E18)));
}

proptest! {
    // The pool never promises more than it holds: across arbitrary provide
    // and offset interleavings the compounded balances stay within the
    // tracked total and the booked collateral gains stay within what the
    // offsets delivered.
    #[test]
    fn rounding_never_favors_depositors(
        deposits in proptest::collection::vec((1u8..=5u8, 1u128..=50_000u128), 1..6),
        offsets in proptest::collection::vec((1u128..=99u128, 1u128..=100u128), 1..8),
    ) {
        let mut s = setup(Keel::ZERO);
        let mut now = 0u64;
        let mut depositors: Vec<Principal> = Vec::new();
        for (who, amount) in deposits {
            now += SEC_NANOS;
            let depositor = principal(who);
            fund_and_provide(&mut s, depositor, KUSD::new(amount * E18), now);
            if !depositors.contains(&depositor) {
                depositors.push(depositor);
            }
        }
        let mut collateral_in = 0u128;
        for (debt_pct, coll_units) in offsets {
            now += SEC_NANOS;
            let total = s.state.total_deposits.to_u128();
            if total == 0 {
                break;
            }
            let debt = (total * debt_pct / 100).max(1);
            let coll = coll_units * E18 / 100;
            collateral_in += coll;
            run_offset(&mut s, KUSD::new(debt), Collateral::new(coll), now);
        }

        s.state.validate_state().unwrap();
        let promised: u128 = depositors
            .iter()
            .map(|d| {
                s.state
                    .collateral_gains(d)
                    .get(&ckbtc())
                    .copied()
                    .unwrap_or(Collateral::ZERO)
                    .to_u128()
            })
            .sum();
        prop_assert!(promised <= collateral_in);
        let compounded_sum: u128 = depositors
            .iter()
            .map(|d| s.state.compounded_deposit(d).to_u128())
            .sum();
        prop_assert!(compounded_sum <= s.state.total_deposits.to_u128());
    }
}
