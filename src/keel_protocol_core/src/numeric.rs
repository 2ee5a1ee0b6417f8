//! Fixed-point numeric types shared by the ledger, the liquidation engine
//! and the stability pool.
//!
//! Token amounts are `u128` values at a canonical 18-decimal scale,
//! independent of the collateral token's native decimals. Ratios and prices
//! are `rust_decimal` newtypes so collateral-ratio math keeps its fractional
//! precision. The reward accumulators need products of two 18-decimal
//! quantities and therefore run on `U256`.

use candid::CandidType;
use primitive_types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

/// One whole token at the canonical scale.
pub const E18: u128 = 1_000_000_000_000_000_000;

/// Nanoseconds per second, the timestamp unit used throughout.
pub const SEC_NANOS: u64 = 1_000_000_000;

macro_rules! amount_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            CandidType,
            Clone,
            Copy,
            Debug,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u128);

        impl $name {
            pub const ZERO: Self = Self(0);

            pub const fn new(value: u128) -> Self {
                Self(value)
            }

            pub const fn to_u128(self) -> u128 {
                self.0
            }

            pub fn is_zero(self) -> bool {
                self.0 == 0
            }

            pub fn checked_sub(self, other: Self) -> Option<Self> {
                self.0.checked_sub(other.0).map(Self)
            }

            pub fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0))
            }

            pub fn min(self, other: Self) -> Self {
                Self(self.0.min(other.0))
            }

            /// Amounts above `Decimal`'s 96-bit mantissa (~7.9e10 whole
            /// tokens) are not representable and saturate.
            pub fn to_decimal(self) -> Decimal {
                match i128::try_from(self.0) {
                    Ok(v) if Decimal::try_from_i128_with_scale(v, 18).is_ok() => {
                        Decimal::from_i128_with_scale(v, 18)
                    }
                    _ => Decimal::MAX,
                }
            }

            /// Truncates toward zero; negative inputs clamp to zero.
            pub fn from_decimal(value: Decimal) -> Self {
                if value.is_sign_negative() {
                    return Self::ZERO;
                }
                let scaled = value * Decimal::from(E18);
                Self(scaled.trunc().to_u128().unwrap_or(u128::MAX))
            }
        }

        impl From<u128> for $name {
            fn from(value: u128) -> Self {
                Self(value)
            }
        }

        impl Add for $name {
            type Output = Self;
            fn add(self, other: Self) -> Self {
                Self(self.0 + other.0)
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, other: Self) {
                self.0 += other.0;
            }
        }

        impl Sub for $name {
            type Output = Self;
            fn sub(self, other: Self) -> Self {
                Self(self.0 - other.0)
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, other: Self) {
                self.0 -= other.0;
            }
        }

        impl Div<u128> for $name {
            type Output = Self;
            fn div(self, divisor: u128) -> Self {
                Self(self.0 / divisor)
            }
        }

        impl Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                iter.fold(Self::ZERO, |acc, x| acc + x)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_decimal().normalize())
            }
        }
    };
}

amount_type!(KUSD, "An amount of the kUSD debt token, 18 decimals.");
amount_type!(Collateral, "A canonical 18-decimal collateral amount.");
amount_type!(Keel, "An amount of the KEEL incentive token, 18 decimals.");

/// A dimensionless ratio, e.g. a collateral ratio or a fee rate.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ratio(Decimal);

impl Ratio {
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    pub fn abs_diff(self, other: Self) -> Self {
        Self((self.0 - other.0).abs())
    }

    /// Integer power by squaring. Underflows to zero for large exponents,
    /// which is what the fee decay wants.
    pub fn pow(self, mut exp: u64) -> Self {
        let mut base = self.0;
        let mut acc = Decimal::ONE;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc.checked_mul(base).unwrap_or(Decimal::ZERO);
            }
            exp >>= 1;
            if exp > 0 {
                base = base.checked_mul(base).unwrap_or(Decimal::ZERO);
            }
        }
        Self(acc)
    }
}

impl From<Decimal> for Ratio {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl Add for Ratio {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sub for Ratio {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl Mul for Ratio {
    type Output = Self;
    fn mul(self, other: Self) -> Self {
        Self(self.0 * other.0)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

/// USD value of one whole collateral token.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CollateralPrice(Decimal);

impl CollateralPrice {
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }
}

impl From<Decimal> for CollateralPrice {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl fmt::Display for CollateralPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Mul<Ratio> for KUSD {
    type Output = KUSD;
    fn mul(self, ratio: Ratio) -> KUSD {
        KUSD::from_decimal(self.to_decimal() * ratio.to_decimal())
    }
}

impl Div<KUSD> for KUSD {
    type Output = Ratio;
    fn div(self, other: KUSD) -> Ratio {
        Ratio(self.to_decimal() / other.to_decimal())
    }
}

impl Mul<Ratio> for Collateral {
    type Output = Collateral;
    fn mul(self, ratio: Ratio) -> Collateral {
        Collateral::from_decimal(self.to_decimal() * ratio.to_decimal())
    }
}

impl Mul<CollateralPrice> for Collateral {
    type Output = KUSD;
    fn mul(self, price: CollateralPrice) -> KUSD {
        KUSD::from_decimal(self.to_decimal() * price.to_decimal())
    }
}

impl Div<CollateralPrice> for KUSD {
    type Output = Collateral;
    fn div(self, price: CollateralPrice) -> Collateral {
        Collateral::from_decimal(self.to_decimal() / price.to_decimal())
    }
}

/// Nominal collateral ratio: collateral over debt, price left out. The
/// sorted list orders on this so entries only move when their own
/// collateral or debt changes.
impl Div<KUSD> for Collateral {
    type Output = Ratio;
    fn div(self, debt: KUSD) -> Ratio {
        Ratio(self.to_decimal() / debt.to_decimal())
    }
}

/// `a * b / denominator` with a 256-bit intermediate, truncating.
pub fn mul_div(a: u128, b: u128, denominator: u128) -> u128 {
    debug_assert!(denominator != 0);
    let wide = U256::from(a) * U256::from(b) / U256::from(denominator);
    u128::try_from(wide).unwrap_or(u128::MAX)
}

/// Converts a native-decimals token amount to the canonical 18-decimal
/// scale.
pub fn to_canonical(amount: u128, decimals: u8) -> Collateral {
    let value = if decimals <= 18 {
        amount.saturating_mul(10u128.pow(18 - decimals as u32))
    } else {
        amount / 10u128.pow(decimals as u32 - 18)
    };
    Collateral::new(value)
}

/// Converts a canonical amount back to native decimals, truncating any dust
/// below the native resolution.
pub fn from_canonical(amount: Collateral, decimals: u8) -> u128 {
    if decimals <= 18 {
        amount.to_u128() / 10u128.pow(18 - decimals as u32)
    } else {
        amount.to_u128().saturating_mul(10u128.pow(decimals as u32 - 18))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amount_decimal_round_trip() {
        let amount = KUSD::new(1_234 * E18 + 567);
        assert_eq!(KUSD::from_decimal(amount.to_decimal()), amount);
    }

    #[test]
    fn collateral_value_uses_price() {
        let coll = Collateral::new(2 * E18);
        let price = CollateralPrice::new(dec!(1500));
        assert_eq!(coll * price, KUSD::new(3_000 * E18));
    }

    #[test]
    fn nominal_ratio_ignores_decimals_difference() {
        let coll = Collateral::new(3 * E18);
        let debt = KUSD::new(2 * E18);
        assert_eq!(coll / debt, Ratio::new(dec!(1.5)));
    }

    #[test]
    fn ratio_pow_matches_repeated_multiplication() {
        let decay = Ratio::new(dec!(0.94));
        let mut expected = Decimal::ONE;
        for _ in 0..13 {
            expected *= dec!(0.94);
        }
        assert_eq!(decay.pow(13).to_decimal(), expected);
    }

    #[test]
    fn ratio_pow_underflows_to_zero() {
        assert_eq!(Ratio::new(dec!(0.94)).pow(50_000), Ratio::new(Decimal::ZERO));
    }

    #[test]
    fn mul_div_survives_u128_overflowing_products() {
        // 1e27 * 1e18 overflows u128 but the quotient fits.
        let result = mul_div(10u128.pow(27), E18, 10u128.pow(27));
        assert_eq!(result, E18);
    }

    #[test]
    fn canonical_scaling_for_8_decimal_token() {
        let canonical = to_canonical(150_000_000, 8);
        assert_eq!(canonical, Collateral::new(15 * E18 / 10));
        assert_eq!(from_canonical(canonical, 8), 150_000_000);
    }

    #[test]
    fn from_canonical_truncates_dust() {
        let canonical = Collateral::new(E18 + 1);
        assert_eq!(from_canonical(canonical, 8), 100_000_000);
    }
}
