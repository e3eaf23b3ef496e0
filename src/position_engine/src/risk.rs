use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::numeric::{CollateralPrice, Ratio};
use crate::state::Position;
use crate::ValidationError;

/// Loan-to-value of a position, in percent.
///
/// Zero collateral or a missing price yields `0` rather than an error.
/// Overflow saturates at `Decimal::MAX`.
pub fn compute_ltv(
    collateral_amount: Decimal,
    borrowed_amount: Decimal,
    price: Option<CollateralPrice>,
) -> Decimal {
    let price = match price {
        Some(price) => price,
        None => return Decimal::ZERO,
    };
    if collateral_amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let collateral_value = match price.value_of(collateral_amount) {
        Some(value) if value > Decimal::ZERO => value,
        Some(_) => return Decimal::ZERO,
        None => return Decimal::MAX,
    };
    borrowed_amount
        .checked_div(collateral_value)
        .and_then(|ratio| ratio.checked_mul(dec!(100)))
        .unwrap_or(Decimal::MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RiskParameters {
    pub liquidation_threshold: Ratio,
    pub warning_health_factor: Ratio,
}

impl From<&EngineConfig> for RiskParameters {
    fn from(config: &EngineConfig) -> Self {
        Self {
            liquidation_threshold: config.liquidation_threshold,
            warning_health_factor: config.warning_health_factor,
        }
    }
}

/// Advisory classification for display. Never a gate on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    NoDebt,
    Healthy,
    Warning,
    AtRisk,
}

pub fn classify_health(health_factor: Option<Ratio>, params: &RiskParameters) -> HealthStatus {
    match health_factor {
        None => HealthStatus::NoDebt,
        Some(hf) if hf < params.liquidation_threshold => HealthStatus::AtRisk,
        Some(hf) if hf < params.warning_health_factor => HealthStatus::Warning,
        Some(_) => HealthStatus::Healthy,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DerivedMetrics {
    pub ltv: Decimal,
    /// `None` when nothing is borrowed.
    pub health_factor: Option<Ratio>,
    pub max_borrow_amount: Decimal,
    pub status: HealthStatus,
    pub price_available: bool,
}

pub fn derive_metrics(
    position: &Position,
    price: Option<CollateralPrice>,
    params: &RiskParameters,
) -> DerivedMetrics {
    DerivedMetrics {
        ltv: compute_ltv(position.collateral_balance, position.borrowed_balance, price),
        health_factor: position.health_factor,
        max_borrow_amount: position.max_borrow_amount,
        status: classify_health(position.health_factor, params),
        price_available: price.is_some(),
    }
}

/// Early-exit borrow check against the ledger-supplied limit.
pub fn check_borrow_limit(requested: Decimal, position: &Position) -> Result<(), ValidationError> {
    if position.collateral_balance <= Decimal::ZERO {
        return Err(ValidationError::NoCollateral);
    }
    if requested > position.max_borrow_amount {
        return Err(ValidationError::ExceedsBorrowLimit {
            requested,
            max_borrow: position.max_borrow_amount,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(value: Decimal) -> Option<CollateralPrice> {
        CollateralPrice::new(value)
    }

    fn params() -> RiskParameters {
        RiskParameters {
            liquidation_threshold: Ratio::new(dec!(1.0)),
            warning_health_factor: Ratio::new(dec!(1.2)),
        }
    }

    #[test]
    fn ltv_of_reference_position() {
        assert_eq!(compute_ltv(dec!(2), dec!(1000), price(dec!(50000))), dec!(1.0));
    }

    #[test]
    fn ltv_floors_at_zero_without_collateral_or_price() {
        assert_eq!(compute_ltv(dec!(0), dec!(1000), price(dec!(50000))), Decimal::ZERO);
        assert_eq!(compute_ltv(dec!(2), dec!(1000), None), Decimal::ZERO);
        assert_eq!(compute_ltv(dec!(2), dec!(1000), price(dec!(0))), Decimal::ZERO);
    }

    #[test]
    fn ltv_saturates_on_overflow() {
        let huge = Decimal::MAX / dec!(2);
        assert_eq!(compute_ltv(huge, dec!(1), price(dec!(10))), Decimal::MAX);
    }

    #[test]
    fn classifies_health_tiers() {
        let p = params();
        assert_eq!(classify_health(None, &p), HealthStatus::NoDebt);
        assert_eq!(classify_health(Some(Ratio::new(dec!(0.95))), &p), HealthStatus::AtRisk);
        assert_eq!(classify_health(Some(Ratio::new(dec!(1.0))), &p), HealthStatus::Warning);
        assert_eq!(classify_health(Some(Ratio::new(dec!(1.19))), &p), HealthStatus::Warning);
        assert_eq!(classify_health(Some(Ratio::new(dec!(1.2))), &p), HealthStatus::Healthy);
    }

    #[test]
    fn borrow_limit_is_inclusive() {
        let position = Position {
            collateral_balance: dec!(1),
            max_borrow_amount: dec!(500),
            ..Position::default()
        };
        assert_eq!(check_borrow_limit(dec!(500), &position), Ok(()));
        assert_eq!(
            check_borrow_limit(dec!(500.01), &position),
            Err(ValidationError::ExceedsBorrowLimit {
                requested: dec!(500.01),
                max_borrow: dec!(500)
            })
        );
        assert_eq!(
            check_borrow_limit(dec!(1), &Position::default()),
            Err(ValidationError::NoCollateral)
        );
    }
}
