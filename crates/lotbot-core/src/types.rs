//! Trading enums and identifiers.
//!
//! Provides position direction, product codes, and the logical identifiers
//! used to key groups and positions independently of any storage key.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::Price;

/// Maximum number of lots a strategy group may hold.
pub const MAX_LOTS_PER_GROUP: u8 = 3;

/// Maximum number of re-submissions for a failed lot.
pub const MAX_RETRY_COUNT: u8 = 5;

/// Current wall-clock time in Unix milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Returns the opposite direction (the side an exit order trades on).
    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Returns 1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Points gained in this direction when moving from `entry` to `price`.
    ///
    /// Positive means the market moved in the position's favor.
    pub fn excursion(&self, entry: Price, price: Price) -> Decimal {
        price.points_from(entry) * self.sign()
    }

    /// Move `price` by `points` in the favorable direction (negative points
    /// move it against the position).
    pub fn favorable_offset(&self, price: Price, points: Decimal) -> Price {
        price.shifted(points * self.sign())
    }

    /// Whether `candidate` is a tighter stop than `current`.
    ///
    /// Long stops tighten upwards, short stops tighten downwards.
    pub fn is_tighter_stop(&self, candidate: Price, current: Price) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// Whether `price` breaches `stop` for this direction.
    pub fn is_stop_hit(&self, price: Price, stop: Price) -> bool {
        match self {
            Self::Long => price <= stop,
            Self::Short => price >= stop,
        }
    }

    /// Whether `price` is further in the favorable direction than `reference`.
    pub fn is_more_favorable(&self, price: Price, reference: Price) -> bool {
        match self {
            Self::Long => price > reference,
            Self::Short => price < reference,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Direction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" | "B" => Ok(Self::Long),
            "SHORT" | "SELL" | "S" => Ok(Self::Short),
            other => Err(CoreError::InvalidDirection(other.to_string())),
        }
    }
}

/// Futures product code as the broker reports it (e.g. `MTX00`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductCode(String);

impl ProductCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Logical strategy group identifier.
///
/// Assigned in creation order, so a smaller id always means an older group.
/// Distinct from any storage primary key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Position (lot record) identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_direction_excursion() {
        let entry = Price::new(dec!(22500));
        let up = Price::new(dec!(22520));
        assert_eq!(Direction::Long.excursion(entry, up), dec!(20));
        assert_eq!(Direction::Short.excursion(entry, up), dec!(-20));
    }

    #[test]
    fn test_favorable_offset() {
        let p = Price::new(dec!(100));
        assert_eq!(Direction::Long.favorable_offset(p, dec!(-5)).inner(), dec!(95));
        assert_eq!(Direction::Short.favorable_offset(p, dec!(-5)).inner(), dec!(105));
    }

    #[test]
    fn test_stop_hit() {
        let stop = Price::new(dec!(100));
        assert!(Direction::Long.is_stop_hit(Price::new(dec!(100)), stop));
        assert!(!Direction::Long.is_stop_hit(Price::new(dec!(100.5)), stop));
        assert!(Direction::Short.is_stop_hit(Price::new(dec!(100)), stop));
        assert!(!Direction::Short.is_stop_hit(Price::new(dec!(99.5)), stop));
    }

    #[test]
    fn test_tighter_stop() {
        let a = Price::new(dec!(100));
        let b = Price::new(dec!(101));
        assert!(Direction::Long.is_tighter_stop(b, a));
        assert!(Direction::Short.is_tighter_stop(a, b));
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("buy".parse::<Direction>().unwrap(), Direction::Long);
        assert_eq!("S".parse::<Direction>().unwrap(), Direction::Short);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_group_id_ordering() {
        assert!(GroupId(1) < GroupId(2));
        assert_eq!(GroupId(7).to_string(), "G7");
    }
}
