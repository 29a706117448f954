//! Currency codes, currency pairs, and the pair validator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{QuoteError, Result};

/// Currencies accepted when no explicit allow-list is configured.
pub const DEFAULT_SUPPORTED_CURRENCIES: [&str; 15] = [
    "USD", "EUR", "GBP", "JPY", "CHF", "CAD", "AUD", "NZD", "CNY", "HKD", "SGD", "SEK", "NOK",
    "INR", "MXN",
];

/// A three-letter currency code, always stored upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse a currency code. Exactly three ASCII letters, any case.
    pub fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(QuoteError::InvalidFormat(format!(
                "currency code must be 3 letters, got {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn eur() -> Self {
        Self("EUR".to_string())
    }

    pub fn gbp() -> Self {
        Self("GBP".to_string())
    }

    pub fn jpy() -> Self {
        Self("JPY".to_string())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Currency {
    type Err = QuoteError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = QuoteError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

/// An ordered (base, quote) currency pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    /// Base currency.
    pub base: Currency,
    /// Quote (pricing) currency.
    pub quote: Currency,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// Parse two separate codes into a pair, checking shape only.
    pub fn from_codes(base: &str, quote: &str) -> Result<Self> {
        Ok(Self::new(Currency::parse(base)?, Currency::parse(quote)?))
    }

    /// Key fragment shared by cache namespaces, e.g. `{USD:EUR}`.
    pub fn cache_tag(&self) -> String {
        format!("{{{}:{}}}", self.base, self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = QuoteError;

    /// Parse a combined `BASE/QUOTE` token, checking shape only.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) => Self::from_codes(base, quote)
                .map_err(|_| QuoteError::InvalidFormat(format!("invalid currency pair {s:?}"))),
            _ => Err(QuoteError::InvalidFormat(format!(
                "currency pair must look like BASE/QUOTE, got {s:?}"
            ))),
        }
    }
}

/// Caller-supplied pair, either combined or as separate codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairInput {
    /// A `BASE/QUOTE` token.
    Combined(String),
    /// Separate base and quote codes.
    Codes { base: String, quote: String },
}

impl From<&str> for PairInput {
    fn from(s: &str) -> Self {
        PairInput::Combined(s.to_string())
    }
}

impl From<String> for PairInput {
    fn from(s: String) -> Self {
        PairInput::Combined(s)
    }
}

impl<B: Into<String>, Q: Into<String>> From<(B, Q)> for PairInput {
    fn from((base, quote): (B, Q)) -> Self {
        PairInput::Codes {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl From<&CurrencyPair> for PairInput {
    fn from(pair: &CurrencyPair) -> Self {
        PairInput::Codes {
            base: pair.base.to_string(),
            quote: pair.quote.to_string(),
        }
    }
}

/// Normalizes currency pairs and checks them against an allow-list.
#[derive(Debug, Clone)]
pub struct PairValidator {
    supported: BTreeSet<Currency>,
}

impl PairValidator {
    /// Create a validator for the given currencies.
    pub fn new(supported: impl IntoIterator<Item = Currency>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }

    /// Create a validator from raw codes, rejecting malformed ones.
    pub fn from_codes<S: AsRef<str>>(codes: impl IntoIterator<Item = S>) -> Result<Self> {
        let supported = codes
            .into_iter()
            .map(|c| Currency::parse(c.as_ref()))
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self { supported })
    }

    /// Check a single currency against the allow-list.
    pub fn is_supported(&self, currency: &Currency) -> bool {
        self.supported.contains(currency)
    }

    /// All supported currencies, sorted.
    pub fn supported(&self) -> impl Iterator<Item = &Currency> {
        self.supported.iter()
    }

    /// Validate and normalize a pair. Shape errors win over allow-list errors.
    pub fn validate(&self, input: impl Into<PairInput>) -> Result<CurrencyPair> {
        let pair = match input.into() {
            PairInput::Combined(token) => token.parse::<CurrencyPair>()?,
            PairInput::Codes { base, quote } => CurrencyPair::from_codes(&base, &quote)?,
        };

        for currency in [&pair.base, &pair.quote] {
            if !self.is_supported(currency) {
                return Err(QuoteError::UnsupportedCurrency(currency.to_string()));
            }
        }

        Ok(pair)
    }
}

impl Default for PairValidator {
    fn default() -> Self {
        Self::new(
            DEFAULT_SUPPORTED_CURRENCIES
                .iter()
                .map(|c| Currency(c.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_currency_parse() {
        assert_eq!(Currency::parse("USD").unwrap(), Currency::usd());
        assert_eq!(Currency::parse("usd").unwrap(), Currency::usd());
        assert_eq!(Currency::parse("MXN").unwrap().code(), "MXN");

        for bad in ["US", "USDA", "US1", "US$", "", "ÜSD"] {
            assert!(
                matches!(Currency::parse(bad), Err(QuoteError::InvalidFormat(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_pair_display_and_parse() {
        let pair: CurrencyPair = "usd/eur".parse().unwrap();
        assert_eq!(pair.to_string(), "USD/EUR");
        assert_eq!(pair.cache_tag(), "{USD:EUR}");
    }

    #[test]
    fn test_validate_combined_rejects_bad_shapes() {
        let validator = PairValidator::default();
        for bad in [
            "INVALID", "EU/MXN", "EURO/MXN", "EUR/MX", "EUR/MXNA", "123/MXN", "EUR/12N",
            "EUR-MXN", "", "USD/EUR/GBP",
        ] {
            assert!(
                matches!(validator.validate(bad), Err(QuoteError::InvalidFormat(_))),
                "{bad:?} should be InvalidFormat"
            );
        }
    }

    #[test]
    fn test_validate_unsupported_currency() {
        let validator = PairValidator::default();
        assert!(matches!(
            validator.validate("ABC/USD"),
            Err(QuoteError::UnsupportedCurrency(ref c)) if c == "ABC"
        ));
        assert!(matches!(
            validator.validate(("USD", "XYZ")),
            Err(QuoteError::UnsupportedCurrency(ref c)) if c == "XYZ"
        ));
        assert!(matches!(
            validator.validate("ZZZ/EUR"),
            Err(QuoteError::UnsupportedCurrency(_))
        ));
    }

    #[test]
    fn test_validate_separate_codes() {
        let validator = PairValidator::default();
        let pair = validator.validate(("eur", "mxn")).unwrap();
        assert_eq!(pair, CurrencyPair::new(Currency::eur(), Currency::parse("MXN").unwrap()));

        assert!(matches!(
            validator.validate(("", "MXN")),
            Err(QuoteError::InvalidFormat(_))
        ));
        assert!(matches!(
            validator.validate(("EUR", "")),
            Err(QuoteError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_custom_allow_list() {
        let validator = PairValidator::from_codes(["usd", "gbp"]).unwrap();
        assert!(validator.validate("USD/GBP").is_ok());
        assert!(validator.validate("USD/EUR").is_err());
        assert!(PairValidator::from_codes(["usd", "nope"]).is_err());
    }

    proptest! {
        #[test]
        fn prop_any_three_letters_normalize_to_upper(code in "[a-zA-Z]{3}") {
            let currency = Currency::parse(&code).unwrap();
            prop_assert_eq!(currency.code(), code.to_ascii_uppercase());
        }

        #[test]
        fn prop_wrong_length_is_invalid_format(code in "[a-zA-Z]{0,2}|[a-zA-Z]{4,8}") {
            prop_assert!(matches!(Currency::parse(&code), Err(QuoteError::InvalidFormat(_))));
        }
    }
}
