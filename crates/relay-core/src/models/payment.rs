use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::CoreError;

/// Non-negative amount in the smallest payment unit.
///
/// Serialized as a decimal string so values above 2^53 survive JSON clients;
/// plain JSON integers are accepted on input.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Payment(pub u128);

impl Payment {
    pub const ZERO: Payment = Payment(0);

    pub fn new(amount: u128) -> Self {
        Self(amount)
    }

    pub fn amount(self) -> u128 {
        self.0
    }
}

impl fmt::Display for Payment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Payment {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(CoreError::invalid_input(format!(
                "payment amount '{raw}' must be a non-negative integer"
            )));
        }
        trimmed.parse::<u128>().map(Self).map_err(|error| {
            CoreError::invalid_input(format!("payment amount '{raw}' is out of range: {error}"))
        })
    }
}

impl Serialize for Payment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Payment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PaymentVisitor)
    }
}

struct PaymentVisitor;

impl Visitor<'_> for PaymentVisitor {
    type Value = Payment;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a non-negative integer or decimal string")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Payment, E> {
        Ok(Payment(u128::from(value)))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Payment, E> {
        u128::try_from(value)
            .map(Payment)
            .map_err(|_| E::custom(format!("payment amount {value} must not be negative")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Payment, E> {
        value.parse().map_err(|error: CoreError| E::custom(error.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_strings_and_integers() {
        assert_eq!("5".parse::<Payment>().unwrap(), Payment(5));
        assert_eq!(serde_json::from_str::<Payment>("7").unwrap(), Payment(7));
        assert_eq!(
            serde_json::from_str::<Payment>("\"1000000000000000000000\"").unwrap(),
            Payment(1_000_000_000_000_000_000_000)
        );
    }

    #[test]
    fn rejects_negative_and_fractional_amounts() {
        assert!("-1".parse::<Payment>().is_err());
        assert!("1.5".parse::<Payment>().is_err());
        assert!(serde_json::from_str::<Payment>("-3").is_err());
        assert!(serde_json::from_str::<Payment>("2.5").is_err());
    }

    #[test]
    fn serializes_as_decimal_string() {
        assert_eq!(serde_json::to_string(&Payment(42)).unwrap(), "\"42\"");
    }
}
