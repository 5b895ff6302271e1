//! Deterministic rounding for money amounts.
//!
//! Every conversion from a position size to a money amount goes through
//! [`calculate_quote_amount`] before it is sent to the exchange or written as
//! settlement data. Amounts are rounded half away from zero, so `0.125` becomes
//! `0.13` and `-0.125` becomes `-0.13`.

use crate::enums::PositionDirection;
use crate::error::CoreError;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Number of decimals of the settlement currency's smallest common unit.
pub const CENT_DECIMALS: u32 = 2;

/// Rounds a float to `decimals` places: scale by 10^n, round half away from
/// zero, scale back. Removes binary residue such as `0.1 + 0.2`.
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

pub fn round_to_cents(amount: f64) -> f64 {
    round_to_decimals(amount, CENT_DECIMALS)
}

/// Decimal counterpart of [`round_to_decimals`].
pub fn round_decimal(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_cents(amount: Decimal) -> Decimal {
    round_decimal(amount, CENT_DECIMALS)
}

/// Money value of `size` at `price`, rounded to cents.
///
/// The sign of `size` is ignored; direction is tracked on the position.
pub fn calculate_quote_amount(size: Decimal, price: Decimal) -> Result<Decimal, CoreError> {
    size.abs()
        .checked_mul(price)
        .map(round_cents)
        .ok_or_else(|| CoreError::Calculation(format!("quote amount overflow: {size} x {price}")))
}

/// Same as [`calculate_quote_amount`] for inputs that arrive as floats.
pub fn quote_amount_from_f64(size: f64, price: f64) -> Result<Decimal, CoreError> {
    let size = decimal_from_f64("size", size)?;
    let price = decimal_from_f64("price", price)?;
    calculate_quote_amount(size, price)
}

fn decimal_from_f64(field: &str, value: f64) -> Result<Decimal, CoreError> {
    if !value.is_finite() {
        return Err(CoreError::InvalidInput(field.to_string(), value.to_string()));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| CoreError::InvalidInput(field.to_string(), value.to_string()))
}

/// Base-asset size bought by `amount_in` of margin at `leverage` and `entry_price`.
pub fn position_size(
    amount_in: Decimal,
    leverage: u32,
    entry_price: Decimal,
) -> Result<Decimal, CoreError> {
    if entry_price <= Decimal::ZERO {
        return Err(CoreError::InvalidInput(
            "entry_price".to_string(),
            entry_price.to_string(),
        ));
    }
    if leverage == 0 {
        return Err(CoreError::InvalidInput("leverage".to_string(), "0".to_string()));
    }
    amount_in
        .checked_mul(Decimal::from(leverage))
        .and_then(|notional| notional.checked_div(entry_price))
        .ok_or_else(|| CoreError::Calculation("position size overflow".to_string()))
}

/// Margin committed for a position of `size` at `price` with `leverage`.
pub fn margin_for(size: Decimal, price: Decimal, leverage: u32) -> Result<Decimal, CoreError> {
    if leverage == 0 {
        return Err(CoreError::InvalidInput("leverage".to_string(), "0".to_string()));
    }
    Ok(round_cents(calculate_quote_amount(size, price)? / Decimal::from(leverage)))
}

/// Realized PnL of closing `size` opened at `entry` and closed at `exit`.
///
/// Both legs are converted through [`calculate_quote_amount`], so the result
/// is always a whole number of cents.
pub fn realized_pnl(
    direction: PositionDirection,
    size: Decimal,
    entry: Decimal,
    exit: Decimal,
) -> Result<Decimal, CoreError> {
    let opened = calculate_quote_amount(size, entry)?;
    let closed = calculate_quote_amount(size, exit)?;
    Ok(match direction {
        PositionDirection::Long => closed - opened,
        PositionDirection::Short => opened - closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_float_residue_is_removed() {
        assert_eq!(round_to_decimals(0.1 + 0.2, 2), 0.30);
        assert_eq!(round_to_cents(0.7 * 3.0), 2.1);
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        assert_eq!(round_to_decimals(2.5, 0), 3.0);
        assert_eq!(round_to_decimals(-2.5, 0), -3.0);
        assert_eq!(round_decimal(dec!(0.125), 2), dec!(0.13));
        assert_eq!(round_decimal(dec!(-0.125), 2), dec!(-0.13));
    }

    #[test]
    fn test_quote_amount_examples() {
        assert_eq!(calculate_quote_amount(dec!(0.00001), dec!(50000)).unwrap(), dec!(0.50));
        assert_eq!(calculate_quote_amount(dec!(-0.01), dec!(50000)).unwrap(), dec!(500.00));
    }

    #[test]
    fn test_quote_amount_overflow_is_an_error() {
        let result = calculate_quote_amount(Decimal::MAX, dec!(2));
        assert!(matches!(result, Err(CoreError::Calculation(_))));
        assert!(margin_for(Decimal::MAX, dec!(2), 5).is_err());
        assert!(realized_pnl(PositionDirection::Long, Decimal::MAX, dec!(1), dec!(2)).is_err());
    }

    #[test]
    fn test_quote_amounts_sum_exactly() {
        let total = calculate_quote_amount(dec!(0.00001), dec!(50000)).unwrap()
            + calculate_quote_amount(dec!(0.00002), dec!(50000)).unwrap()
            + calculate_quote_amount(dec!(0.00003), dec!(50000)).unwrap();
        assert_eq!(total, dec!(3.00));
    }

    #[test]
    fn test_quote_amount_from_floats() {
        let total = quote_amount_from_f64(0.00001, 50000.0).unwrap()
            + quote_amount_from_f64(0.00002, 50000.0).unwrap()
            + quote_amount_from_f64(0.00003, 50000.0).unwrap();
        assert_eq!(total, dec!(3.00));
        assert!(quote_amount_from_f64(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_pnl_uses_direction() {
        let size = dec!(0.01);
        assert_eq!(realized_pnl(PositionDirection::Long, size, dec!(50000), dec!(51000)).unwrap(), dec!(10.00));
        assert_eq!(realized_pnl(PositionDirection::Short, size, dec!(50000), dec!(51000)).unwrap(), dec!(-10.00));
    }

    #[test]
    fn test_position_size_and_margin() {
        let size = position_size(dec!(100), 5, dec!(50000)).unwrap();
        assert_eq!(size, dec!(0.01));
        assert_eq!(margin_for(size, dec!(50000), 5).unwrap(), dec!(100.00));
        assert!(position_size(dec!(100), 0, dec!(50000)).is_err());
        assert!(position_size(dec!(100), 5, Decimal::ZERO).is_err());
    }
}
