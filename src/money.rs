//! Integer-cents money types. All arithmetic stays in minor units;
//! display conversion divides by the minor-unit exponent only at the boundary.

use std::fmt;

use crate::error::EngineError;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Currency {
    #[n(0)]
    USD,
    #[n(1)]
    GBP,
    #[n(2)]
    EUR,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::GBP => "GBP",
            Currency::EUR => "EUR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Non-negative amount in minor units (cents).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Money {
    #[n(0)]
    minor_units: i64,
    #[n(1)]
    currency: Currency,
}

impl Money {
    pub fn new(minor_units: i64, currency: Currency) -> Result<Self, EngineError> {
        if minor_units < 0 {
            return Err(EngineError::ValidationFailed {
                field: "minor_units",
                message: format!("money amounts cannot be negative, got {minor_units}"),
            });
        }
        Ok(Self {
            minor_units,
            currency,
        })
    }
    pub fn zero(currency: Currency) -> Self {
        Self {
            minor_units: 0,
            currency,
        }
    }
    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }
    pub fn currency(&self) -> Currency {
        self.currency
    }
    pub fn is_zero(&self) -> bool {
        self.minor_units == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_minor_units(f, self.minor_units, self.currency)
    }
}

/// Signed amount in minor units. Used for admin adjustments and for
/// settlement amounts, which may legally go negative (organizer owes
/// the platform).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    #[n(0)]
    minor_units: i64,
    #[n(1)]
    currency: Currency,
}

impl Adjustment {
    pub fn new(minor_units: i64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }
    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }
    pub fn currency(&self) -> Currency {
        self.currency
    }
    pub fn is_zero(&self) -> bool {
        self.minor_units == 0
    }
}

impl From<Money> for Adjustment {
    fn from(value: Money) -> Self {
        Adjustment::new(value.minor_units, value.currency)
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_minor_units(f, self.minor_units, self.currency)
    }
}

fn format_minor_units(f: &mut fmt::Formatter<'_>, minor: i64, currency: Currency) -> fmt::Result {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    write!(f, "{sign}{}.{:02} {currency}", abs / 100, abs % 100)
}

/// The single rounding primitive: nearest minor unit, with ties rounding
/// toward positive infinity. `denominator` must be positive; all callers
/// in this crate pass constants.
pub fn round_half_up(numerator: i128, denominator: i128) -> i64 {
    debug_assert!(denominator > 0);
    let q = numerator.div_euclid(denominator);
    let r = numerator.rem_euclid(denominator);
    let rounded = if r * 2 >= denominator { q + 1 } else { q };
    rounded as i64
}

pub(crate) fn ensure_same_currency(left: Currency, right: Currency) -> Result<(), EngineError> {
    if left != right {
        return Err(EngineError::CurrencyMismatch { left, right });
    }
    Ok(())
}
