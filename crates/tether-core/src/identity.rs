//! Phone-number identities.
//!
//! Both the device identity being paired and dispatch recipients are phone
//! numbers. Input is free-form ("+62 812-3456-789", "0812 3456 789") and is
//! normalized to country-code-prefixed digits:
//!
//! ```text
//! 08123456789   -> 628123456789   (trunk prefix replaced)
//! 8123456789    -> 628123456789   (country code added)
//! 628123456789  -> 628123456789   (already canonical)
//! ```

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Country code prepended to numbers written without one
pub const DEFAULT_COUNTRY_CODE: &str = "62";

/// Minimum canonical length (digits, country code included)
pub const MIN_DIGITS: usize = 10;

/// Maximum canonical length (E.164 limit)
pub const MAX_DIGITS: usize = 15;

/// Address suffix for individual users on the network
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Phone number validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneNumberError {
    /// No digits in the input
    #[error("phone number is required")]
    Empty,

    /// Canonical form has the wrong number of digits
    #[error("expected {MIN_DIGITS}-{MAX_DIGITS} digits after normalization, got {0}")]
    Length(usize),
}

/// A canonical, country-code-prefixed phone number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize and validate free-form input.
    ///
    /// # Errors
    ///
    /// Returns `PhoneNumberError` if the input has no digits or the canonical
    /// form is not 10-15 digits long.
    pub fn parse(input: &str) -> Result<Self, PhoneNumberError> {
        let digits: String = input.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(PhoneNumberError::Empty);
        }

        let canonical = if digits.starts_with(DEFAULT_COUNTRY_CODE) {
            digits
        } else if let Some(local) = digits.strip_prefix('0') {
            format!("{DEFAULT_COUNTRY_CODE}{local}")
        } else {
            format!("{DEFAULT_COUNTRY_CODE}{digits}")
        };

        if !(MIN_DIGITS..=MAX_DIGITS).contains(&canonical.len()) {
            return Err(PhoneNumberError::Length(canonical.len()));
        }

        Ok(Self(canonical))
    }

    /// Canonical digits
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Network address for this number (`<digits>@s.whatsapp.net`)
    #[must_use]
    pub fn jid(&self) -> String {
        format!("{}@{USER_SERVER}", self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = PhoneNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for PhoneNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_forms_share_canonical_form() {
        for input in ["08123456789", "628123456789", "8123456789"] {
            assert_eq!(PhoneNumber::parse(input).unwrap().as_str(), "628123456789");
        }
    }

    #[test]
    fn test_formatting_is_stripped() {
        let number = PhoneNumber::parse("+62 812-3456-789").unwrap();
        assert_eq!(number.as_str(), "628123456789");
        assert_eq!(number.jid(), "628123456789@s.whatsapp.net");
    }

    #[test]
    fn test_empty_and_length_bounds() {
        assert_eq!(PhoneNumber::parse(""), Err(PhoneNumberError::Empty));
        assert_eq!(PhoneNumber::parse("abc-"), Err(PhoneNumberError::Empty));
        assert_eq!(PhoneNumber::parse("0812"), Err(PhoneNumberError::Length(5)));
        assert_eq!(
            PhoneNumber::parse("6212345678901234"),
            Err(PhoneNumberError::Length(16))
        );
        assert!(PhoneNumber::parse("6212345678").is_ok());
        assert!(PhoneNumber::parse("621234567890123").is_ok());
    }

    #[test]
    fn test_serializes_as_digits() {
        let number = PhoneNumber::parse("0812 3456 789").unwrap();
        assert_eq!(
            serde_json::to_string(&number).unwrap(),
            "\"628123456789\""
        );
    }
}
