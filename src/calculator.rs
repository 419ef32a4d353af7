//! Pure fee and fine arithmetic for settlements and refunds.
//!
//! Every function here is side-effect free: inputs and outputs are
//! [`Money`]/[`Adjustment`] values in a single currency, and all rounding is
//! round-half-up on minor units. Mixed-currency calls fail with
//! `CurrencyMismatch`.

use crate::error::EngineError;
use crate::money::{Adjustment, Money, ensure_same_currency, round_half_up};

/// Who absorbs the organizer-side (parlomo) fee.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePaidBy {
    #[n(0)]
    Buyer,
    #[n(1)]
    Organizer,
}

/// Platform fee taken off the gross sales: `round_half_up(total * pct / 100)`.
pub fn platform_fee(total_sales: Money, platform_fee_percentage: u8) -> Result<Money, EngineError> {
    if platform_fee_percentage > 100 {
        return Err(EngineError::ValidationFailed {
            field: "platform_fee_percentage",
            message: format!("{platform_fee_percentage} exceeds 100"),
        });
    }
    let fee = round_half_up(
        total_sales.minor_units() as i128 * platform_fee_percentage as i128,
        100,
    );
    Money::new(fee, total_sales.currency())
}

/// Settlement base amount:
/// `total_sales - processing_fees - total_refunds - platform_fee`,
/// minus the parlomo fee when the organizer absorbs it.
///
/// Returns the computed platform fee together with the amount. The amount may
/// be negative (the organizer owes the platform); it is not clamped here.
/// Payout commands decide whether a negative settlement is payable.
pub fn compute_settlement_amount(
    total_sales: Money,
    processing_fees: Money,
    total_refunds: Money,
    platform_fee_percentage: u8,
    fee_paid_by: FeePaidBy,
    parlomo_fee: Money,
) -> Result<(Money, Adjustment), EngineError> {
    let currency = total_sales.currency();
    ensure_same_currency(currency, processing_fees.currency())?;
    ensure_same_currency(currency, total_refunds.currency())?;
    ensure_same_currency(currency, parlomo_fee.currency())?;

    let fee = platform_fee(total_sales, platform_fee_percentage)?;

    let mut amount = total_sales.minor_units() as i128
        - processing_fees.minor_units() as i128
        - total_refunds.minor_units() as i128
        - fee.minor_units() as i128;
    if fee_paid_by == FeePaidBy::Organizer {
        amount -= parlomo_fee.minor_units() as i128;
    }

    let amount = i64::try_from(amount).map_err(|_| EngineError::ValidationFailed {
        field: "amount",
        message: "settlement amount overflows minor units".to_string(),
    })?;

    Ok((fee, Adjustment::new(amount, currency)))
}

/// Arithmetic sum of the settlement amount and an admin adjustment. The
/// adjustment-reason requirement is checked by the caller, not here.
pub fn apply_adjustment(
    amount: Adjustment,
    adjustment: Adjustment,
) -> Result<Adjustment, EngineError> {
    ensure_same_currency(amount.currency(), adjustment.currency())?;

    let sum = amount.minor_units() as i128 + adjustment.minor_units() as i128;
    let sum = i64::try_from(sum).map_err(|_| EngineError::ValidationFailed {
        field: "final_amount",
        message: "adjusted amount overflows minor units".to_string(),
    })?;

    Ok(Adjustment::new(sum, amount.currency()))
}

/// Cancellation fine: `round_half_up(total * pct / 100)`.
///
/// A percentage of 100 is rejected: it would leave a zero net refund, which
/// the refund invariant disallows.
pub fn compute_fine(
    total_refund_amount: Money,
    fine_percentage: u8,
) -> Result<Money, EngineError> {
    if fine_percentage >= 100 {
        return Err(EngineError::InvalidFinePercentage(fine_percentage));
    }
    let fine = round_half_up(
        total_refund_amount.minor_units() as i128 * fine_percentage as i128,
        100,
    );
    Money::new(fine, total_refund_amount.currency())
}

/// Net refund after the fine. A fine can never consume the entire refund.
pub fn compute_net_refund(
    total_refund_amount: Money,
    fine_amount: Money,
) -> Result<Money, EngineError> {
    ensure_same_currency(total_refund_amount.currency(), fine_amount.currency())?;

    if !fine_amount.is_zero() && fine_amount.minor_units() >= total_refund_amount.minor_units() {
        return Err(EngineError::FineExceedsTotal {
            fine: fine_amount.minor_units(),
            total: total_refund_amount.minor_units(),
        });
    }

    Money::new(
        total_refund_amount.minor_units() - fine_amount.minor_units(),
        total_refund_amount.currency(),
    )
}

/// Preview-only helper: floor division of the net amount across the selected
/// orders. Never persisted.
pub fn average_per_order(net: Money, order_count: usize) -> Result<Money, EngineError> {
    if order_count == 0 {
        return Err(EngineError::ValidationFailed {
            field: "order_ids",
            message: "cannot average across zero orders".to_string(),
        });
    }
    Money::new(net.minor_units() / order_count as i64, net.currency())
}
