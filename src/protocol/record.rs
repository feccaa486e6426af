//! # Record Parser
//!
//! Splits a framed text line into positionally addressed fields.

use chrono::{DateTime, Local};
use std::time::Instant;
use thiserror::Error;

/// Field separator on the wire (no quoting or escaping)
pub const FIELD_DELIMITER: char = ',';

/// Reasons a framed line is not turned into a [`Record`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Line was empty or contained only whitespace
    #[error("empty line")]
    Empty,
}

/// One parsed telemetry line.
///
/// Fields are addressed by zero-based position in CSV order. Empty fields,
/// including trailing ones, are kept so positions stay aligned with the
/// field configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    raw: String,
    fields: Vec<String>,
    timestamp: Instant,
    received_at: DateTime<Local>,
    sequence: u64,
}

impl Record {
    /// Original line, trimmed
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Raw field value at `position`, or `None` if the line was shorter
    pub fn get(&self, position: usize) -> Option<&str> {
        self.fields.get(position).map(String::as_str)
    }

    /// All fields in CSV order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Always false for parsed records; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Monotonic capture time
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Wall-clock capture time
    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    /// Per-port sequence number, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Parse a framed line into a [`Record`].
///
/// # Errors
///
/// Returns [`ParseError::Empty`] for blank lines. Callers drop such lines
/// and keep reading.
///
/// # Examples
///
/// ```
/// use chrono::Local;
/// use std::time::Instant;
/// use telemon::protocol::parse;
///
/// let record = parse(" 1, 2 ,3,", Instant::now(), Local::now(), 0).unwrap();
/// assert_eq!(record.get(1), Some("2"));
/// assert_eq!(record.get(3), Some(""));
/// assert_eq!(record.get(4), None);
/// ```
pub fn parse(
    text: &str,
    timestamp: Instant,
    received_at: DateTime<Local>,
    sequence: u64,
) -> Result<Record, ParseError> {
    let raw = text.trim();
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }

    let fields = raw
        .split(FIELD_DELIMITER)
        .map(|field| field.trim().to_string())
        .collect();

    Ok(Record {
        raw: raw.to_string(),
        fields,
        timestamp,
        received_at,
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_now(text: &str) -> Result<Record, ParseError> {
        parse(text, Instant::now(), Local::now(), 7)
    }

    #[test]
    fn test_positions_follow_csv_order() {
        let record = parse_now("1,2,3").unwrap();
        assert_eq!(record.get(0), Some("1"));
        assert_eq!(record.get(1), Some("2"));
        assert_eq!(record.get(2), Some("3"));
        assert_eq!(record.len(), 3);
    }

    #[test]
    fn test_missing_position_is_none() {
        let record = parse_now("1,2").unwrap();
        assert_eq!(record.get(2), None);
    }

    #[test]
    fn test_fields_are_trimmed() {
        let record = parse_now("  10 ,\t20,30  ").unwrap();
        assert_eq!(record.fields(), &["10", "20", "30"]);
        assert_eq!(record.raw(), "10 ,\t20,30");
    }

    #[test]
    fn test_empty_fields_are_preserved() {
        let record = parse_now("1,,3,,").unwrap();
        assert_eq!(record.len(), 5);
        assert_eq!(record.get(1), Some(""));
        assert_eq!(record.get(4), Some(""));
    }

    #[test]
    fn test_single_field() {
        let record = parse_now("42").unwrap();
        assert_eq!(record.fields(), &["42"]);
    }

    #[test]
    fn test_blank_lines_are_rejected() {
        assert_eq!(parse_now(""), Err(ParseError::Empty));
        assert_eq!(parse_now("  \t "), Err(ParseError::Empty));
    }

    #[test]
    fn test_metadata_is_kept() {
        let record = parse_now("x").unwrap();
        assert_eq!(record.sequence(), 7);
        assert!(record.timestamp() <= Instant::now());
    }
}
