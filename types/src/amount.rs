use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

const CENTS_PER_UNIT: i64 = 100;
const SUB_CENT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum AmountError {
    #[error("amount must be a finite number")]
    NonFinite,
    #[error("amount must not be negative (got {0})")]
    Negative(f64),
    #[error("amount has more than two decimal places (got {0})")]
    SubCent(f64),
    #[error("amount is too large (got {0})")]
    TooLarge(f64),
}

/// Money in whole cents.
///
/// Amounts travel as decimal JSON numbers (`20.01`) but are stored and
/// summed as integers so that the prize pool never drifts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn from_decimal(value: f64) -> Result<Self, AmountError> {
        if !value.is_finite() {
            return Err(AmountError::NonFinite);
        }
        if value < 0.0 {
            return Err(AmountError::Negative(value));
        }
        let scaled = value * CENTS_PER_UNIT as f64;
        let rounded = scaled.round();
        let tolerance = SUB_CENT_TOLERANCE.max(scaled.abs() * f64::EPSILON * 4.0);
        if (scaled - rounded).abs() > tolerance {
            return Err(AmountError::SubCent(value));
        }
        if rounded >= i64::MAX as f64 {
            return Err(AmountError::TooLarge(value));
        }
        Ok(Self(rounded as i64))
    }

    pub fn as_decimal(self) -> f64 {
        self.0 as f64 / CENTS_PER_UNIT as f64
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let unit = CENTS_PER_UNIT as u64;
        write!(f, "{sign}{}.{:02}", abs / unit, abs % unit)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_decimal())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Amount::from_decimal(value).map_err(de::Error::custom)
    }
}
