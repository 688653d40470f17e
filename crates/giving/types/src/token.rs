//! Tokens and amounts.
//!
//! Amounts are always held in the token's smallest unit. Decimal strings only
//! exist at the edges (CLI input, display).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::ids::Address;

/// Largest decimals value whose scale factor still fits in a `u128`.
const MAX_DECIMALS: u8 = 38;

/// Amount in the token's smallest unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn new(minor: u128) -> Self {
        Self(minor)
    }

    pub fn minor(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Sum of `amounts`, or `None` if it does not fit.
    pub fn checked_sum(amounts: impl IntoIterator<Item = Amount>) -> Option<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Parse a decimal string such as `"1.5"` into minor units.
    pub fn parse_units(input: &str, decimals: u8) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidAmount(input.to_string());
        if decimals > MAX_DECIMALS {
            return Err(ParseError::UnsupportedDecimals(decimals));
        }
        let input = input.trim();
        let (whole, fraction) = match input.split_once('.') {
            Some((w, f)) => (w, f),
            None => (input, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if fraction.len() > decimals as usize {
            return Err(ParseError::TooManyDecimals {
                input: input.to_string(),
                decimals,
            });
        }

        let scale = 10u128.pow(decimals as u32);
        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u128>().map_err(|_| invalid())?
        };
        let padded = format!("{fraction:0<width$}", width = decimals as usize);
        let fraction_units = if padded.is_empty() {
            0
        } else {
            padded.parse::<u128>().map_err(|_| invalid())?
        };

        whole_units
            .checked_mul(scale)
            .and_then(|w| w.checked_add(fraction_units))
            .map(Amount)
            .ok_or_else(invalid)
    }

    /// Render as a decimal string, trimming trailing fractional zeros.
    pub fn format_units(self, decimals: u8) -> String {
        if decimals == 0 || decimals > MAX_DECIMALS {
            return self.0.to_string();
        }
        let scale = 10u128.pow(decimals as u32);
        let whole = self.0 / scale;
        let fraction = self.0 % scale;
        if fraction == 0 {
            return whole.to_string();
        }
        let digits = format!("{fraction:0>width$}", width = decimals as usize);
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token a donation is denominated in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    /// Ticker, e.g. "ETH"
    pub symbol: String,
    /// Number of decimals of the smallest unit
    pub decimals: u8,
    /// Token contract address
    pub address: Address,
}

impl Token {
    pub fn new(symbol: impl Into<String>, decimals: u8, address: Address) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
            address,
        }
    }

    pub fn parse_amount(&self, input: &str) -> Result<Amount, ParseError> {
        Amount::parse_units(input, self.decimals)
    }

    /// Human readable amount with symbol, e.g. `"1.5 ETH"`.
    pub fn display_amount(&self, amount: Amount) -> String {
        format!("{} {}", amount.format_units(self.decimals), self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_whole_and_fractional() {
        assert_eq!(Amount::parse_units("1", 18).unwrap(), Amount(1_000_000_000_000_000_000));
        assert_eq!(Amount::parse_units("1.5", 18).unwrap(), Amount(1_500_000_000_000_000_000));
        assert_eq!(Amount::parse_units(".25", 2).unwrap(), Amount(25));
        assert_eq!(Amount::parse_units("42", 0).unwrap(), Amount(42));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Amount::parse_units("", 18).is_err());
        assert!(Amount::parse_units(".", 18).is_err());
        assert!(Amount::parse_units("1.2.3", 18).is_err());
        assert!(Amount::parse_units("-1", 18).is_err());
        assert!(matches!(
            Amount::parse_units("0.001", 2),
            Err(ParseError::TooManyDecimals { decimals: 2, .. })
        ));
        assert!(matches!(Amount::parse_units("1", 40), Err(ParseError::UnsupportedDecimals(40))));
    }

    #[test]
    fn format_trims_zeros() {
        assert_eq!(Amount(1_500_000_000_000_000_000).format_units(18), "1.5");
        assert_eq!(Amount(2_000).format_units(3), "2");
        assert_eq!(Amount(5).format_units(3), "0.005");
        assert_eq!(Amount(5).format_units(0), "5");
    }

    #[test]
    fn sum_of_amounts() {
        assert_eq!(Amount::checked_sum([Amount(100), Amount(50), Amount(30)]), Some(Amount(180)));
        assert_eq!(Amount::checked_sum([]), Some(Amount::ZERO));
        assert_eq!(Amount::checked_sum([Amount(u128::MAX), Amount(1)]), None);
    }

    #[test]
    fn token_display() {
        let token = Token::new("ETH", 18, Address::from_bytes([0u8; 20]));
        assert_eq!(token.display_amount(Amount(250_000_000_000_000_000)), "0.25 ETH");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn format_then_parse_is_identity(minor in 0u128..=u64::MAX as u128, decimals in 0u8..=18) {
                let amount = Amount(minor);
                let text = amount.format_units(decimals);
                prop_assert_eq!(Amount::parse_units(&text, decimals).unwrap(), amount);
            }
        }
    }
}
