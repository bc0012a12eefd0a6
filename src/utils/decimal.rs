//! Decimal arithmetic utilities for yield and amount display.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Convert basis points to percentage points (50 bps = 0.5).
pub fn bps_to_percent(bps: u32) -> Decimal {
    Decimal::from(bps) / dec!(100)
}

/// Apply a basis-point haircut to an integer amount, rounding down.
pub fn apply_slippage(amount: U256, slippage_bps: u32) -> U256 {
    let keep = 10_000u32.saturating_sub(slippage_bps);
    amount.saturating_mul(U256::from(keep)) / U256::from(10_000u32)
}

/// Render a raw token amount in whole units, e.g. `1_500_000` with 6 decimals is `1.5`.
///
/// Amounts too large for `Decimal` fall back to `None`.
pub fn to_display_units(amount: U256, decimals: u32) -> Option<Decimal> {
    let raw: u128 = amount.try_into().ok()?;
    let raw = i128::try_from(raw).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .ok()
        .map(|d| d.normalize())
}

/// Lossy `U256` to `Decimal` for aggregate statistics.
pub fn u256_to_decimal(amount: U256) -> Decimal {
    to_display_units(amount, 0).unwrap_or(Decimal::MAX)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}
