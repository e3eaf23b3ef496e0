use crate::approval::{allowance_below, needs_approval};
use crate::cooldown::{CooldownPhase, CooldownRecord};
use crate::numeric::{parse_amount, CollateralPrice};
use crate::risk::compute_ltv;
use crate::test_helpers::test_config;
use crate::SpenderRole;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn arb_amount() -> impl Strategy<Value = Decimal> {
    // Up to 1e12 with 6 fractional digits.
    (0..1_000_000_000_000_000_000i64).prop_map(|units| Decimal::new(units, 6))
}

fn arb_spender() -> impl Strategy<Value = SpenderRole> {
    prop_oneof![Just(SpenderRole::LendingPool), Just(SpenderRole::StakingPool)]
}

proptest! {
    #[test]
    fn approval_needed_iff_allowance_below_amount(
        spender in arb_spender(),
        amount in arb_amount(),
        allowance in arb_amount(),
    ) {
        let needed = needs_approval(spender, Some(&amount.to_string()), Some(allowance));
        prop_assert_eq!(needed, allowance < amount);
    }

    #[test]
    fn raw_and_parsed_approval_checks_agree(
        spender in arb_spender(),
        amount in arb_amount(),
        allowance in proptest::option::of(arb_amount()),
    ) {
        let raw = amount.to_string();
        let parsed = parse_amount(Some(&raw), 6);
        let from_raw = needs_approval(spender, Some(&raw), allowance);
        match parsed {
            Ok(parsed) => {
                prop_assert_eq!(from_raw, allowance_below(parsed, allowance));
            }
            Err(_) => {
                prop_assert_eq!(from_raw, allowance_below(amount, allowance));
            }
        }
    }

    #[test]
    fn missing_allowance_needs_approval_for_positive_amounts(amount in arb_amount()) {
        let needed = needs_approval(SpenderRole::LendingPool, Some(&amount.to_string()), None);
        prop_assert_eq!(needed, amount > Decimal::ZERO);
    }

    #[test]
    fn unparseable_amount_forces_approval(
        garbage in "[a-zA-Z#]{1,12}",
        allowance in arb_amount(),
    ) {
        prop_assert!(needs_approval(SpenderRole::StakingPool, Some(&garbage), Some(allowance)));
    }

    #[test]
    fn ltv_is_zero_without_collateral(borrowed in arb_amount(), price in 1..10_000_000u64) {
        let price = CollateralPrice::new(Decimal::from(price));
        prop_assert_eq!(compute_ltv(Decimal::ZERO, borrowed, price), Decimal::ZERO);
    }

    #[test]
    fn ltv_is_zero_without_price(collateral in arb_amount(), borrowed in arb_amount()) {
        prop_assert_eq!(compute_ltv(collateral, borrowed, None), Decimal::ZERO);
    }

    #[test]
    fn ltv_grows_with_debt(
        collateral in 1..1_000u64,
        price in 1..100_000u64,
        debt in 0..1_000_000u64,
        extra in 1..1_000_000u64,
    ) {
        let price = CollateralPrice::new(Decimal::from(price));
        let collateral = Decimal::from(collateral);
        let lower = compute_ltv(collateral, Decimal::from(debt), price);
        let higher = compute_ltv(collateral, Decimal::from(debt + extra), price);
        prop_assert!(higher > lower);
    }

    #[test]
    fn parsed_amounts_are_positive_and_within_precision(amount in arb_amount()) {
        match parse_amount(Some(&amount.to_string()), 6) {
            Ok(parsed) => {
                prop_assert!(parsed > Decimal::ZERO);
                prop_assert_eq!(parsed, amount);
                prop_assert!(parsed.scale() <= 6);
            }
            Err(_) => {
                prop_assert_eq!(amount, Decimal::ZERO);
            }
        }
    }

    #[test]
    fn cooldown_phases_are_ordered(
        period in 1..(30 * crate::DAY_NANOS),
        window in 1..(30 * crate::DAY_NANOS),
        offset in 0..(90 * crate::DAY_NANOS),
    ) {
        let start = 1_700_000_000_000_000_000u64;
        let record = CooldownRecord {
            cooldown_start: Some(start),
            cooldown_period: period,
            unstake_window: window,
        };
        let expected = if offset < period {
            CooldownPhase::Cooldown
        } else if offset < period + window {
            CooldownPhase::UnstakeWindow
        } else {
            CooldownPhase::Expired
        };
        prop_assert_eq!(record.phase_at(start + offset), expected);
        prop_assert_eq!(record.check_unstake(start + offset).is_ok(), expected == CooldownPhase::UnstakeWindow);
    }
}

#[test]
fn reference_ltv() {
    let price = CollateralPrice::new(dec!(50000));
    assert_eq!(compute_ltv(dec!(2), dec!(1000), price), dec!(1.0));
}

#[test]
fn test_config_is_valid() {
    assert_eq!(test_config().validate(), Ok(()));
}
