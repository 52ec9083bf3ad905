//! Precision-safe price type for trading.
//!
//! Uses `rust_decimal` for exact decimal arithmetic. Broker reports carry
//! prices either as fixed-point strings or as integers in a broker-native
//! scale, and stop levels are derived from fractional pullback ratios, so
//! floating point is never used for price math.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Largest number of implied decimal places `Decimal` can hold.
pub const MAX_PRICE_SCALE: u32 = 28;

/// Price with exact decimal precision.
///
/// Wraps `Decimal` to keep prices apart from point distances and ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Build a price from an integer in broker-native scale.
    ///
    /// `scale` is the number of implied decimal places, so `2257300` with
    /// scale 2 is `22573.00`. Fails when `scale` exceeds [`MAX_PRICE_SCALE`].
    #[inline]
    pub fn from_scaled(raw: i64, scale: u32) -> Result<Self, rust_decimal::Error> {
        Decimal::try_new(raw, scale).map(Self)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Signed distance `self - other` in points.
    #[inline]
    pub fn points_from(&self, other: Price) -> Decimal {
        self.0 - other.0
    }

    /// Shift the price by a signed number of points.
    #[inline]
    pub fn shifted(&self, points: Decimal) -> Self {
        Self(self.0 + points)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Price {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}
