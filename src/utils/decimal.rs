//! Basis-point arithmetic on base-unit amounts.

use crate::adapter::Amount;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// 10000 bps = 100%.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// `amount * bps / 10000`, truncated toward zero.
///
/// Split into quotient and remainder so the multiplication cannot overflow.
pub fn bps_of(amount: Amount, bps: u32) -> Amount {
    let denominator = Amount::from(BPS_DENOMINATOR);
    let bps = Amount::from(bps);
    (amount / denominator) * bps + (amount % denominator) * bps / denominator
}

/// `part` as a share of `total` in bps, truncated. Zero when `total` is zero.
pub fn ratio_bps(part: Amount, total: Amount) -> Amount {
    if total == 0 {
        return 0;
    }
    let denominator = Amount::from(BPS_DENOMINATOR);
    match part.checked_mul(denominator) {
        Some(scaled) => scaled / total,
        None => part / (total / denominator).max(1),
    }
}

/// Convert basis points to a percentage (e.g. 250 bps -> 2.5).
pub fn bps_to_percent(bps: Amount) -> Decimal {
    amount_to_decimal(bps) / dec!(100)
}

/// Amount as a decimal for reporting. Saturates above the 96-bit mantissa.
pub fn amount_to_decimal(amount: Amount) -> Decimal {
    Decimal::from_u128(amount).unwrap_or(Decimal::MAX)
}

/// Percentage change from `from` to `to`, rounded to 4 dp. Zero when `from` is zero.
pub fn percent_change(from: Amount, to: Amount) -> Decimal {
    if from == 0 {
        return Decimal::ZERO;
    }
    let from = amount_to_decimal(from);
    ((amount_to_decimal(to) - from) / from * dec!(100)).round_dp(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bps_of_truncates() {
        assert_eq!(bps_of(100_000, 6_000), 60_000);
        assert_eq!(bps_of(100_001, 3_333), 33_330);
        assert_eq!(bps_of(9_999, 1), 0);
        assert_eq!(bps_of(Amount::MAX, 10_000), Amount::MAX);
    }

    #[test]
    fn test_ratio_bps() {
        assert_eq!(ratio_bps(25, 100), 2_500);
        assert_eq!(ratio_bps(1, 3), 3_333);
        assert_eq!(ratio_bps(50, 0), 0);
        assert_eq!(ratio_bps(Amount::MAX, Amount::MAX), 10_000);
    }

    #[test]
    fn test_bps_to_percent() {
        assert_eq!(bps_to_percent(250), dec!(2.5));
        assert_eq!(bps_to_percent(10_000), dec!(100));
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(1_000, 1_050), dec!(5));
        assert_eq!(percent_change(1_000, 900), dec!(-10));
        assert_eq!(percent_change(0, 900), Decimal::ZERO);
        assert_eq!(amount_to_decimal(Amount::MAX), Decimal::MAX);
    }
}
