use std::{fmt, str::FromStr};

use crate::EngineError;

/// Amount expressed in integer **minor units** (e.g. cents).
///
/// Every amount stored by the engine is an `i64` of minor units; this type is
/// the boundary helper for human input and log output. It assumes two
/// fraction digits.
///
/// ```rust
/// use engine::MinorAmount;
///
/// let amount: MinorAmount = "700,00".parse().unwrap();
/// assert_eq!(amount.minor(), 70_000);
/// assert_eq!(MinorAmount::new(-7_000).to_string(), "-70.00");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MinorAmount(i64);

impl MinorAmount {
    #[must_use]
    pub const fn new(minor: i64) -> Self {
        Self(minor)
    }

    #[must_use]
    pub const fn minor(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Parses a strictly positive amount, as required for ledger postings.
    pub fn parse_positive(input: &str) -> Result<Self, EngineError> {
        let amount: MinorAmount = input.parse()?;
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(
                "amount_minor must be > 0".to_string(),
            ));
        }
        Ok(amount)
    }
}

impl fmt::Display for MinorAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl From<i64> for MinorAmount {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<MinorAmount> for i64 {
    fn from(value: MinorAmount) -> Self {
        value.0
    }
}

impl FromStr for MinorAmount {
    type Err = EngineError;

    /// Accepts `.` or `,` as decimal separator, an optional sign and at most
    /// two fraction digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: &str| EngineError::InvalidAmount(msg.to_string());

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            Some(_) => (false, trimmed),
            None => return Err(invalid("empty amount")),
        };

        let normalized = digits.trim().replace(',', ".");
        let (whole, fraction) = match normalized.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (normalized.as_str(), ""),
        };

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if whole.is_empty() || !all_digits(whole) || !all_digits(fraction) {
            return Err(invalid("invalid amount"));
        }
        if fraction.len() > 2 {
            return Err(invalid("too many decimals"));
        }

        let whole: i64 = whole.parse().map_err(|_| invalid("amount too large"))?;
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid("invalid amount"))? * 10,
            _ => fraction.parse::<i64>().map_err(|_| invalid("invalid amount"))?,
        };

        let total = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(fraction))
            .ok_or_else(|| invalid("amount too large"))?;

        Ok(MinorAmount(if negative { -total } else { total }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_currency_neutral() {
        assert_eq!(MinorAmount::new(0).to_string(), "0.00");
        assert_eq!(MinorAmount::new(5).to_string(), "0.05");
        assert_eq!(MinorAmount::new(160_000).to_string(), "1600.00");
        assert_eq!(MinorAmount::new(-7_000).to_string(), "-70.00");
    }

    #[test]
    fn parse_accepts_dot_or_comma() {
        assert_eq!("150".parse::<MinorAmount>().unwrap().minor(), 15_000);
        assert_eq!("80.5".parse::<MinorAmount>().unwrap().minor(), 8_050);
        assert_eq!("80,05".parse::<MinorAmount>().unwrap().minor(), 8_005);
        assert_eq!("-0.01".parse::<MinorAmount>().unwrap().minor(), -1);
        assert_eq!(" +12.30 ".parse::<MinorAmount>().unwrap().minor(), 1_230);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<MinorAmount>().is_err());
        assert!("12.345".parse::<MinorAmount>().is_err());
        assert!("1.2.3".parse::<MinorAmount>().is_err());
        assert!("abc".parse::<MinorAmount>().is_err());
        assert!(".50".parse::<MinorAmount>().is_err());
    }

    #[test]
    fn parse_positive_rejects_zero_and_negative() {
        assert!(MinorAmount::parse_positive("0").is_err());
        assert!(MinorAmount::parse_positive("-1").is_err());
        assert_eq!(MinorAmount::parse_positive("0.01").unwrap().minor(), 1);
    }
}
