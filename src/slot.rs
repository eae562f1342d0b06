//! Slot key codec.
//!
//! A slot key is `YYYY-MM-DD-HH:MM`: a calendar date, a `-` separator and a
//! time of day. Two bookings compete for the same capacity iff their keys are
//! equal, and the leading date is what blocked-date checks look at.

use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

const DATE_LEN: usize = 10;
const TIME_LEN: usize = 5;
const KEY_LEN: usize = DATE_LEN + 1 + TIME_LEN;
const SEPARATOR: char = '-';

/// Malformed date, time, or slot key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError(pub String);

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FormatError {}

/// Canonical identifier of one bookable date + time unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    /// Build a key from a `YYYY-MM-DD` date and an `HH:MM` time.
    pub fn new(date: &str, time: &str) -> Result<Self, FormatError> {
        validate_date(date)?;
        validate_time(time)?;
        Ok(Self(format!("{date}{SEPARATOR}{time}")))
    }

    /// Validate an already concatenated key.
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        if text.len() != KEY_LEN || !text.is_char_boundary(DATE_LEN) {
            return Err(FormatError(format!(
                "slot key must be YYYY-MM-DD-HH:MM, got {text:?}"
            )));
        }
        let (date, rest) = text.split_at(DATE_LEN);
        let time = rest.strip_prefix(SEPARATOR).ok_or_else(|| {
            FormatError(format!("slot key must be YYYY-MM-DD-HH:MM, got {text:?}"))
        })?;
        Self::new(date, time)
    }

    /// The `YYYY-MM-DD` prefix.
    pub fn date(&self) -> &str {
        &self.0[..DATE_LEN]
    }

    /// The `HH:MM` suffix.
    pub fn time(&self) -> &str {
        &self.0[DATE_LEN + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-function form of [`SlotKey::new`].
pub fn make_slot_key(date: &str, time: &str) -> Result<SlotKey, FormatError> {
    SlotKey::new(date, time)
}

/// Date portion of a key. Never fails for a key built through this module.
pub fn date_of(key: &SlotKey) -> &str {
    key.date()
}

/// Accepts zero-padded `YYYY-MM-DD` naming a real calendar day.
pub fn validate_date(text: &str) -> Result<(), FormatError> {
    if !has_shape(text, DATE_LEN, &[4, 7], b'-') {
        return Err(FormatError(format!("date must be YYYY-MM-DD, got {text:?}")));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| FormatError(format!("not a calendar date: {text:?}")))
}

/// Accepts zero-padded `HH:MM` between 00:00 and 23:59.
pub fn validate_time(text: &str) -> Result<(), FormatError> {
    if !has_shape(text, TIME_LEN, &[2], b':') {
        return Err(FormatError(format!("time must be HH:MM, got {text:?}")));
    }
    NaiveTime::parse_from_str(text, "%H:%M")
        .map(|_| ())
        .map_err(|_| FormatError(format!("not a time of day: {text:?}")))
}

/// Fixed-width digits with `sep` at the given byte positions.
fn has_shape(text: &str, len: usize, sep_at: &[usize], sep: u8) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == len
        && bytes.iter().enumerate().all(|(i, b)| {
            if sep_at.contains(&i) {
                *b == sep
            } else {
                b.is_ascii_digit()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_canonical_key() {
        let key = make_slot_key("2025-06-01", "10:00").unwrap();
        assert_eq!(key.as_str(), "2025-06-01-10:00");
        assert_eq!(date_of(&key), "2025-06-01");
        assert_eq!(key.time(), "10:00");
    }

    #[test]
    fn parse_accepts_what_new_produces() {
        let key = SlotKey::new("2024-02-29", "23:59").unwrap();
        assert_eq!(SlotKey::parse(key.as_str()).unwrap(), key);
    }

    #[test]
    fn rejects_unpadded_date() {
        assert!(SlotKey::new("2025-6-01", "10:00").is_err());
        assert!(SlotKey::new("2025-06-1", "10:00").is_err());
    }

    #[test]
    fn rejects_impossible_calendar_dates() {
        assert!(validate_date("2025-02-29").is_err()); // not a leap year
        assert!(validate_date("2025-13-01").is_err());
        assert!(validate_date("2025-04-31").is_err());
        assert!(validate_date("2024-02-29").is_ok());
    }

    #[test]
    fn rejects_bad_times() {
        assert!(validate_time("24:00").is_err());
        assert!(validate_time("12:60").is_err());
        assert!(validate_time("9:00").is_err());
        assert!(validate_time("09:00:00").is_err());
        assert!(validate_time("00:00").is_ok());
    }

    #[test]
    fn parse_rejects_wrong_separator_and_length() {
        assert!(SlotKey::parse("2025-06-01T10:00").is_err());
        assert!(SlotKey::parse("2025-06-01 10:00").is_err());
        assert!(SlotKey::parse("2025-06-01-10:0").is_err());
        assert!(SlotKey::parse("").is_err());
    }

    #[test]
    fn parse_rejects_multibyte_input_without_panicking() {
        assert!(SlotKey::parse("2025-06-0é10:00").is_err());
        assert!(SlotKey::parse("ééééééééé-10:00").is_err());
    }

    #[test]
    fn keys_order_chronologically() {
        let a = SlotKey::new("2025-06-01", "09:00").unwrap();
        let b = SlotKey::new("2025-06-01", "10:00").unwrap();
        let c = SlotKey::new("2025-06-02", "08:00").unwrap();
        assert!(a < b && b < c);
    }
}
