//! Fixed-point monetary amounts.
//!
//! Value is carried as an integer count of base units with 6 decimal
//! places, so equality is exact and block-sized sums cannot lose
//! precision. The canonical text form (minimal decimal, no exponent,
//! no trailing fractional zeros) is what gets signed, so rendering and
//! parsing must stay byte-stable.

use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base units per whole coin.
pub const AMOUNT_SCALE: u64 = 1_000_000;

/// Fractional digits carried by an [`Amount`].
pub const AMOUNT_DECIMALS: u32 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount literal: {0:?}")]
    Invalid(String),
    #[error("amount {0:?} has more than {AMOUNT_DECIMALS} decimal places")]
    TooPrecise(String),
    #[error("amount overflow")]
    Overflow,
}

/// A non-negative fixed-point amount with exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Construct from raw base units (1 unit = 10^-6).
    pub const fn from_units(units: u64) -> Self {
        Amount(units)
    }

    /// Construct from a whole-coin count.
    pub const fn from_whole(coins: u64) -> Self {
        Amount(coins * AMOUNT_SCALE)
    }

    pub const fn units(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Exact sum over an iterator, failing on overflow instead of wrapping.
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(iter: I) -> Option<Amount> {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / AMOUNT_SCALE;
        let frac = self.0 % AMOUNT_SCALE;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let mut digits = format!("{frac:06}");
        while digits.ends_with('0') {
            digits.pop();
        }
        write!(f, "{whole}.{digits}")
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AmountError::Invalid(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > AMOUNT_DECIMALS as usize {
            // Trailing zeros beyond the carried precision are harmless.
            let (kept, dropped) = frac.split_at(AMOUNT_DECIMALS as usize);
            if dropped.bytes().any(|b| b != b'0') {
                return Err(AmountError::TooPrecise(s.to_string()));
            }
            return format!("{whole}.{kept}").parse();
        }
        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let frac_units = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<6}");
            padded.parse::<u64>().map_err(|_| invalid())?
        };
        whole
            .checked_mul(AMOUNT_SCALE)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }
}

impl Sum<Amount> for Option<Amount> {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount::checked_sum(iter)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Wire and storage rows carry the canonical string; genesis files
        // may use bare JSON numbers.
        let value = serde_json::Value::deserialize(deserializer)?;
        let text = match &value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(de::Error::custom(format!(
                    "expected amount string or number, got {other}"
                )))
            }
        };
        text.parse().map_err(de::Error::custom)
    }
}
