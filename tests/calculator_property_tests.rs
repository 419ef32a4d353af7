//! Property-based tests for the fee and fine arithmetic.
//!
//! These use proptest to check the money invariants across randomly generated
//! amounts and percentages rather than hand-picked figures: fines and nets
//! must always sum back to the total, rounding must stay within one minor
//! unit, and a zero percentage must behave exactly like no fine at all.

use proptest::prelude::*;
use settlement_approval::calculator;
use settlement_approval::error::EngineError;
use settlement_approval::money::{Adjustment, Currency, Money, round_half_up};

fn currency_strategy() -> impl Strategy<Value = Currency> {
    (0u8..=2).prop_map(|i| match i {
        0 => Currency::USD,
        1 => Currency::GBP,
        _ => Currency::EUR,
    })
}

proptest! {
    /// For any fine strictly inside (0, 100) that the calculator accepts,
    /// the fine and the net partition the total exactly and the net stays
    /// strictly positive.
    #[test]
    fn fine_and_net_partition_the_total(
        total in 1i64..10_000_000,
        pct in 1u8..100,
        currency in currency_strategy(),
    ) {
        let total = Money::new(total, currency).unwrap();
        let fine = calculator::compute_fine(total, pct).unwrap();
        prop_assert_eq!(
            fine.minor_units(),
            round_half_up(total.minor_units() as i128 * pct as i128, 100)
        );

        match calculator::compute_net_refund(total, fine) {
            Ok(net) => {
                prop_assert!(net.minor_units() > 0);
                prop_assert_eq!(
                    fine.minor_units() + net.minor_units(),
                    total.minor_units()
                );
            }
            // rounding can consume a tiny total entirely; that must be refused
            Err(EngineError::FineExceedsTotal { fine: f, total: t }) => {
                prop_assert!(f >= t);
            }
            Err(other) => prop_assert!(false, "unexpected error: {other}"),
        }
    }

    /// A zero percentage is indistinguishable from having no fine.
    #[test]
    fn zero_percentage_is_a_no_op(
        total in 0i64..10_000_000,
        currency in currency_strategy(),
    ) {
        let total = Money::new(total, currency).unwrap();
        let fine = calculator::compute_fine(total, 0).unwrap();

        prop_assert!(fine.is_zero());
        prop_assert_eq!(
            calculator::compute_net_refund(total, fine).unwrap(),
            total
        );
    }

    /// Percentages of 100 and above are always refused, whatever the total.
    #[test]
    fn full_or_excess_percentages_are_refused(
        total in 0i64..10_000_000,
        pct in 100u8..=255,
        currency in currency_strategy(),
    ) {
        let total = Money::new(total, currency).unwrap();
        let err = calculator::compute_fine(total, pct).unwrap_err();
        prop_assert!(matches!(err, EngineError::InvalidFinePercentage(p) if p == pct));
    }

    /// The platform fee never exceeds the sales it is taken from.
    #[test]
    fn platform_fee_is_bounded_by_sales(
        total in 0i64..10_000_000,
        pct in 0u8..=100,
        currency in currency_strategy(),
    ) {
        let total = Money::new(total, currency).unwrap();
        let fee = calculator::platform_fee(total, pct).unwrap();

        prop_assert!(fee.minor_units() >= 0);
        prop_assert!(fee.minor_units() <= total.minor_units());
    }

    /// An admin adjustment is a plain arithmetic sum, whichever sign it has.
    #[test]
    fn adjustments_sum_arithmetically(
        amount in -10_000_000i64..10_000_000,
        adjustment in -10_000_000i64..10_000_000,
        currency in currency_strategy(),
    ) {
        let final_amount = calculator::apply_adjustment(
            Adjustment::new(amount, currency),
            Adjustment::new(adjustment, currency),
        )
        .unwrap();

        prop_assert_eq!(final_amount.minor_units(), amount + adjustment);
        prop_assert_eq!(final_amount.currency(), currency);
    }

    /// Mixed currencies are refused before any arithmetic happens.
    #[test]
    fn mixed_currency_adjustments_are_refused(
        amount in -10_000_000i64..10_000_000,
    ) {
        let err = calculator::apply_adjustment(
            Adjustment::new(amount, Currency::GBP),
            Adjustment::new(1, Currency::USD),
        )
        .unwrap_err();
        prop_assert!(
            matches!(err, EngineError::CurrencyMismatch { .. }),
            "expected CurrencyMismatch, got {:?}",
            err
        );
    }
}
