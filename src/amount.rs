//! Arbitrary-precision decimal amounts.
//!
//! Amounts travel through the system as decimal strings and are only ever
//! combined with integer arithmetic over an unscaled value and a scale.
//! There is no floating point anywhere on this path.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::types::BigDecimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::error::AmountError;

/// Exact decimal amount
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(BigDecimal);

impl Amount {
    pub fn zero() -> Self {
        Self(BigDecimal::from(0_i64))
    }

    /// Parse a decimal string, rejecting anything that is not
    /// `-?digits[.digits]` with at least one digit.
    pub fn parse(raw: &str) -> Result<Self, AmountError> {
        let invalid = || AmountError::InvalidAmount(raw.to_string());

        let (negative, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let mut parts = body.split('.');
        let integer = parts.next().unwrap_or_default();
        let fraction = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(invalid());
        }
        if integer.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !integer.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let integer = if integer.is_empty() { "0" } else { integer };
        let normalized = if fraction.is_empty() {
            format!("{}{}", if negative { "-" } else { "" }, integer)
        } else {
            format!("{}{}.{}", if negative { "-" } else { "" }, integer, fraction)
        };

        BigDecimal::from_str(&normalized)
            .map(Self)
            .map_err(|_| invalid())
    }

    /// Parse and require a value strictly greater than zero.
    pub fn assert_positive_amount(raw: &str) -> Result<Self, AmountError> {
        let amount = Self::parse(raw)?;
        amount.assert_positive()?;
        Ok(amount)
    }

    pub fn assert_positive(&self) -> Result<(), AmountError> {
        if self.is_positive() {
            Ok(())
        } else {
            Err(AmountError::NotPositive(self.to_string()))
        }
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigDecimal::from(0_i64)
    }

    pub fn compare(&self, other: &Amount) -> Ordering {
        self.cmp(other)
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<BigDecimal> for Amount {
    fn from(value: BigDecimal) -> Self {
        Self(value)
    }
}

impl From<Amount> for BigDecimal {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Add for &Amount {
    type Output = Amount;

    fn add(self, rhs: &Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl Sub for &Amount {
    type Output = Amount;

    fn sub(self, rhs: &Amount) -> Amount {
        Amount(&self.0 - &rhs.0)
    }
}

impl fmt::Display for Amount {
    /// Canonical form: no trailing fractional zeros, at least one integer
    /// digit, sign only for non-zero negatives.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (unscaled, scale) = self.0.as_bigint_and_exponent();
        let mut digits = unscaled.to_string();
        let negative = digits.starts_with('-');
        if negative {
            digits.remove(0);
        }

        let scale = if scale < 0 {
            digits.push_str(&"0".repeat(scale.unsigned_abs() as usize));
            0
        } else {
            scale as usize
        };

        if digits.len() <= scale {
            digits = format!("{}{}", "0".repeat(scale - digits.len() + 1), digits);
        }

        let (integer, fraction) = digits.split_at(digits.len() - scale);
        let integer = integer.trim_start_matches('0');
        let integer = if integer.is_empty() { "0" } else { integer };
        let fraction = fraction.trim_end_matches('0');

        if negative && !(integer == "0" && fraction.is_empty()) {
            f.write_str("-")?;
        }
        f.write_str(integer)?;
        if !fraction.is_empty() {
            write!(f, ".{}", fraction)?;
        }
        Ok(())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Amount::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for raw in [
            "", "   ", "-", ".", "1.2.3", "12a", "1e5", "+1", "1,000", "--1", " 5", "5 ", "\t5\n",
            "- 5",
        ] {
            assert_eq!(
                Amount::parse(raw),
                Err(AmountError::InvalidAmount(raw.to_string())),
                "expected {:?} to be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_canonical_formatting() {
        assert_eq!(amount("10.500").to_string(), "10.5");
        assert_eq!(amount("10.000").to_string(), "10");
        assert_eq!(amount(".5").to_string(), "0.5");
        assert_eq!(amount("007").to_string(), "7");
        assert_eq!(amount("-0.00").to_string(), "0");
        assert_eq!(amount("-1.230").to_string(), "-1.23");
        assert_eq!(amount("0.000000000000000000000000000001").to_string(), "0.000000000000000000000000000001");
    }

    #[test]
    fn test_exact_arithmetic() {
        let balance = &amount("10.50") - &amount("3.25");
        assert_eq!(balance.to_string(), "7.25");

        let sum = &amount("0.1") + &amount("0.2");
        assert_eq!(sum.to_string(), "0.3");

        let big = &amount("99999999999999999999999999999999.99") + &amount("0.01");
        assert_eq!(big.to_string(), "100000000000000000000000000000000");

        let negative = &amount("1") - &amount("2.5");
        assert_eq!(negative.to_string(), "-1.5");
    }

    #[test]
    fn test_compare_aligns_scales() {
        assert_eq!(amount("1.0").compare(&amount("1")), Ordering::Equal);
        assert_eq!(amount("1.01").compare(&amount("1.1")), Ordering::Less);
        assert_eq!(amount("-2").compare(&amount("1")), Ordering::Less);
    }

    #[test]
    fn test_assert_positive_amount() {
        assert!(Amount::assert_positive_amount("0.01").is_ok());
        assert_eq!(
            Amount::assert_positive_amount("0"),
            Err(AmountError::NotPositive("0".into()))
        );
        assert_eq!(
            Amount::assert_positive_amount("-3"),
            Err(AmountError::NotPositive("-3".into()))
        );
        assert!(matches!(
            Amount::assert_positive_amount("abc"),
            Err(AmountError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let json = serde_json::to_string(&amount("12.3400")).unwrap();
        assert_eq!(json, "\"12.34\"");

        let parsed: Amount = serde_json::from_str("\"5.50\"").unwrap();
        assert_eq!(parsed, amount("5.5"));
        assert!(serde_json::from_str::<Amount>("\"5..5\"").is_err());
    }
}
