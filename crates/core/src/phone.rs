//! Phone number normalization.
//!
//! The loyalty backend keys customers by phone, so every phone that reaches
//! a job or a remote call goes through [`Phone::parse`] first.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const COUNTRY_PREFIX: &str = "998";
const LOCAL_DIGITS: usize = 9;

/// A normalized E.164 phone number (`+998XXXXXXXXX`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Phone(String);

impl Phone {
    /// Normalize a user-supplied phone.
    ///
    /// Accepts `+998XXXXXXXXX`, `998XXXXXXXXX` or the 9-digit local form,
    /// ignoring any separators.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(DomainError::invalid_phone("no digits"));
        }

        if digits.starts_with(COUNTRY_PREFIX) {
            if digits.len() != COUNTRY_PREFIX.len() + LOCAL_DIGITS {
                return Err(DomainError::invalid_phone(
                    "expected +998XXXXXXXXX",
                ));
            }
            return Ok(Self(format!("+{digits}")));
        }

        if digits.len() == LOCAL_DIGITS {
            return Ok(Self(format!("+{COUNTRY_PREFIX}{digits}")));
        }

        Err(DomainError::invalid_phone("expected +998XXXXXXXXX"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Phone {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Phone {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Phone {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Phone> for String {
    fn from(value: Phone) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_prefixed_and_local_forms() {
        assert_eq!(Phone::parse("+998 90 123-45-67").unwrap().as_str(), "+998901234567");
        assert_eq!(Phone::parse("998901234567").unwrap().as_str(), "+998901234567");
        assert_eq!(Phone::parse("901234567").unwrap().as_str(), "+998901234567");
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert!(Phone::parse("").is_err());
        assert!(Phone::parse("99890123456").is_err());
        assert!(Phone::parse("12345").is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let phone: Phone = serde_json::from_str("\"901234567\"").unwrap();
        assert_eq!(phone.as_str(), "+998901234567");
        assert!(serde_json::from_str::<Phone>("\"nope\"").is_err());
    }
}
