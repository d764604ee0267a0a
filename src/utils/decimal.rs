//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Quantity sums are rounded to 8 decimal places to absorb accumulated
/// rounding drift across many grid entries.
pub const QTY_SUM_DECIMALS: u32 = 8;

/// Round a value to a multiple of `step` via integer steps.
///
/// Never rounds through string truncation; `step == 0` passes the value
/// through unchanged.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step == Decimal::ZERO {
        return value;
    }
    ((value / step).round() * step).normalize()
}

/// Round to a multiple of `step` and clamp into `[min, max]`.
pub fn round_and_clamp(value: Decimal, step: Decimal, min: Decimal, max: Decimal) -> Decimal {
    let rounded = round_to_step(value, step);
    if rounded < min {
        min
    } else if rounded > max {
        max
    } else {
        rounded
    }
}

/// Number of decimal places implied by a quantity step (0.001 -> 3).
pub fn decimals_from_step(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Round a quantity sum to the shared 8-dp precision.
pub fn round_qty_sum(value: Decimal) -> Decimal {
    value.round_dp(QTY_SUM_DECIMALS)
}

/// Volume-weighted average price over `(price, qty)` pairs.
///
/// Returns zero when total quantity is zero.
pub fn weighted_average_price(entries: &[(Decimal, Decimal)]) -> Decimal {
    let mut notional = Decimal::ZERO;
    let mut qty = Decimal::ZERO;
    for (price, q) in entries {
        notional += price * q;
        qty += q;
    }
    let qty = round_qty_sum(qty);
    if qty == Decimal::ZERO {
        Decimal::ZERO
    } else {
        notional / qty
    }
}

/// Percentage drop from `reference` down to `price` (positive when price fell).
pub fn percent_drop(reference: Decimal, price: Decimal) -> Decimal {
    if reference == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (reference - price) / reference * dec!(100)
}

/// Percentage rise from `reference` up to `price` (positive when price rose).
pub fn percent_rise(reference: Decimal, price: Decimal) -> Decimal {
    if reference == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (price - reference) / reference * dec!(100)
}

/// Geometric ladder term: `initial * multiplier^level`.
pub fn ladder_margin(initial: Decimal, multiplier: Decimal, level: u32) -> Decimal {
    let mut term = initial;
    for _ in 0..level {
        term *= multiplier;
    }
    term
}

/// Sum of the geometric ladder for levels `0..=max_level`.
pub fn ladder_margin_sum(initial: Decimal, multiplier: Decimal, max_level: u32) -> Decimal {
    let mut sum = Decimal::ZERO;
    let mut term = initial;
    for _ in 0..=max_level {
        sum += term;
        term *= multiplier;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(1.234), dec!(0.1)), dec!(1.2));
        assert_eq!(round_to_step(dec!(1.26), dec!(0.1)), dec!(1.3));
        assert_eq!(round_to_step(dec!(0.9999), dec!(0.001)), dec!(1));
        assert_eq!(round_to_step(dec!(5), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn test_round_and_clamp() {
        assert_eq!(
            round_and_clamp(dec!(0.04), dec!(0.1), dec!(0.1), dec!(100)),
            dec!(0.1)
        );
        assert_eq!(
            round_and_clamp(dec!(150), dec!(0.1), dec!(0.1), dec!(100)),
            dec!(100)
        );
        assert_eq!(
            round_and_clamp(dec!(1.23), dec!(0.1), dec!(0.1), dec!(100)),
            dec!(1.2)
        );
    }

    #[test]
    fn test_decimals_from_step() {
        assert_eq!(decimals_from_step(dec!(0.001)), 3);
        assert_eq!(decimals_from_step(dec!(0.1)), 1);
        assert_eq!(decimals_from_step(dec!(1)), 0);
        // Trailing zeros must not inflate precision
        assert_eq!(decimals_from_step(dec!(0.100)), 1);
    }

    #[test]
    fn test_weighted_average_price() {
        // (1*100 + 2*99) / 3 = 99.333...
        let avg = weighted_average_price(&[(dec!(100), dec!(1)), (dec!(99), dec!(2))]);
        assert!(avg > dec!(99.33) && avg < dec!(99.34));
        assert_eq!(weighted_average_price(&[]), Decimal::ZERO);
    }

    #[test]
    fn test_percent_moves() {
        assert_eq!(percent_drop(dec!(100), dec!(99)), dec!(1));
        assert_eq!(percent_rise(dec!(100), dec!(101)), dec!(1));
        assert_eq!(percent_drop(Decimal::ZERO, dec!(99)), Decimal::ZERO);
    }

    #[test]
    fn test_ladder_sums() {
        assert_eq!(ladder_margin(dec!(1), dec!(2), 0), dec!(1));
        assert_eq!(ladder_margin(dec!(1), dec!(2), 3), dec!(8));
        // 1 + 2 + 4 = 7
        assert_eq!(ladder_margin_sum(dec!(1), dec!(2), 2), dec!(7));
    }
}
