use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ValidationError;

/// A dimensionless decimal, used for health factors and thresholds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ratio(Decimal);

impl Ratio {
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl From<Decimal> for Ratio {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Price of one whole collateral unit, expressed in borrow-asset units.
/// Only positive prices are representable; anything else is "unavailable".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CollateralPrice(Decimal);

impl CollateralPrice {
    pub fn new(value: Decimal) -> Option<Self> {
        (value > Decimal::ZERO).then_some(Self(value))
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    /// Value of `collateral_amount` in borrow-asset units.
    pub fn value_of(self, collateral_amount: Decimal) -> Option<Decimal> {
        collateral_amount.checked_mul(self.0)
    }
}

impl fmt::Display for CollateralPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses a user-entered amount once, at the boundary. The result is
/// normalized, strictly positive and no finer than `max_decimals`.
pub fn parse_amount(input: Option<&str>, max_decimals: u8) -> Result<Decimal, ValidationError> {
    let raw = input
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or(ValidationError::MissingAmount)?;

    let amount = Decimal::from_str(raw)
        .map_err(|_| ValidationError::InvalidAmount(raw.to_string()))?
        .normalize();

    if amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount);
    }
    if amount.scale() > u32::from(max_decimals) {
        return Err(ValidationError::TooManyDecimals { max_decimals });
    }
    Ok(amount)
}

pub(crate) fn saturating_sub(lhs: Decimal, rhs: Decimal) -> Decimal {
    if rhs >= lhs {
        Decimal::ZERO
    } else {
        lhs - rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_plain_and_padded_amounts() {
        assert_eq!(parse_amount(Some("100"), 6), Ok(dec!(100)));
        assert_eq!(parse_amount(Some(" 0.5 "), 8), Ok(dec!(0.5)));
        assert_eq!(parse_amount(Some("1.2500"), 2), Ok(dec!(1.25)));
    }

    #[test]
    fn rejects_missing_and_garbage() {
        assert_eq!(parse_amount(None, 8), Err(ValidationError::MissingAmount));
        assert_eq!(parse_amount(Some("   "), 8), Err(ValidationError::MissingAmount));
        assert_eq!(
            parse_amount(Some("1.2.3"), 8),
            Err(ValidationError::InvalidAmount("1.2.3".to_string()))
        );
        assert_eq!(
            parse_amount(Some("ten"), 8),
            Err(ValidationError::InvalidAmount("ten".to_string()))
        );
    }

    #[test]
    fn rejects_zero_and_negative() {
        assert_eq!(parse_amount(Some("0"), 8), Err(ValidationError::NonPositiveAmount));
        assert_eq!(parse_amount(Some("0.000"), 8), Err(ValidationError::NonPositiveAmount));
        assert_eq!(parse_amount(Some("-3"), 8), Err(ValidationError::NonPositiveAmount));
    }

    #[test]
    fn rejects_precision_finer_than_token() {
        assert_eq!(
            parse_amount(Some("0.0000001"), 6),
            Err(ValidationError::TooManyDecimals { max_decimals: 6 })
        );
        assert_eq!(parse_amount(Some("0.000001"), 6), Ok(dec!(0.000001)));
    }

    #[test]
    fn price_must_be_positive() {
        assert!(CollateralPrice::new(dec!(0)).is_none());
        assert!(CollateralPrice::new(dec!(-1)).is_none());
        let price = CollateralPrice::new(dec!(50000)).unwrap();
        assert_eq!(price.value_of(dec!(2)), Some(dec!(100000)));
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        assert_eq!(saturating_sub(dec!(5), dec!(7)), Decimal::ZERO);
        assert_eq!(saturating_sub(dec!(7), dec!(5)), dec!(2));
    }
}
