//! Register payload parsing
//!
//! A payload carries one raw register value, either as a bare number (`2500`)
//! or as a JSON object (`{"value": 2500}`). The object form may also carry a
//! `timestamp` (unix seconds or RFC 3339) for the observation time.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload is not valid UTF-8")]
    NotUtf8,
    #[error("Payload is not numeric: {0}")]
    NotNumeric(String),
    #[error("JSON payload has no \"value\" field")]
    MissingValue,
    #[error("Value {0} does not fit a 16-bit register")]
    OutOfRange(i64),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A single register value extracted from a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPayload {
    /// Raw 16-bit register content (negative inputs stored as two's complement)
    pub value: u16,
    /// Observation time carried by the payload, if any
    pub observed_at: Option<DateTime<Utc>>,
}

/// Parse a transport payload into a register value
pub fn parse_payload(payload: &[u8]) -> Result<RegisterPayload, PayloadError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| PayloadError::NotUtf8)?
        .trim();

    if text.starts_with('{') {
        let object: serde_json::Map<String, Value> =
            serde_json::from_str(text).map_err(|e| PayloadError::NotNumeric(e.to_string()))?;
        let value = object.get("value").ok_or(PayloadError::MissingValue)?;
        let raw = json_integer(value).ok_or_else(|| PayloadError::NotNumeric(value.to_string()))?;
        let observed_at = match object.get("timestamp") {
            None | Some(Value::Null) => None,
            Some(ts) => Some(parse_timestamp(ts)?),
        };
        return Ok(RegisterPayload {
            value: to_register(raw)?,
            observed_at,
        });
    }

    let raw: i64 = text
        .parse()
        .map_err(|_| PayloadError::NotNumeric(excerpt(text)))?;
    Ok(RegisterPayload {
        value: to_register(raw)?,
        observed_at: None,
    })
}

/// Integers, integral floats and numeric strings
fn json_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_register(raw: i64) -> Result<u16, PayloadError> {
    if (0..=i64::from(u16::MAX)).contains(&raw) {
        Ok(raw as u16)
    } else if (i64::from(i16::MIN)..0).contains(&raw) {
        Ok(raw as i16 as u16)
    } else {
        Err(PayloadError::OutOfRange(raw))
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, PayloadError> {
    let invalid = || PayloadError::InvalidTimestamp(value.to_string());
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(invalid),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bare_number() {
        let p = parse_payload(b" 2500\n").unwrap();
        assert_eq!(p.value, 2500);
        assert_eq!(p.observed_at, None);
    }

    #[test]
    fn test_json_value() {
        assert_eq!(parse_payload(br#"{"value": 17}"#).unwrap().value, 17);
        assert_eq!(parse_payload(br#"{"value": "17"}"#).unwrap().value, 17);
        assert_eq!(parse_payload(br#"{"value": 17.0}"#).unwrap().value, 17);
    }

    #[test]
    fn test_negative_values_are_twos_complement() {
        assert_eq!(parse_payload(b"-1").unwrap().value, 0xFFFF);
        assert_eq!(parse_payload(b"-32768").unwrap().value, 0x8000);
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(parse_payload(b"65536"), Err(PayloadError::OutOfRange(65536)));
        assert_eq!(parse_payload(b"-32769"), Err(PayloadError::OutOfRange(-32769)));
    }

    #[test]
    fn test_timestamp() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();

        let p = parse_payload(br#"{"value": 1, "timestamp": 1768046400}"#).unwrap();
        assert_eq!(p.observed_at, Some(expected));

        let p = parse_payload(br#"{"value": 1, "timestamp": "2026-01-10T12:00:00Z"}"#).unwrap();
        assert_eq!(p.observed_at, Some(expected));

        assert!(matches!(
            parse_payload(br#"{"value": 1, "timestamp": "yesterday"}"#),
            Err(PayloadError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        assert_eq!(parse_payload(&[0xff, 0xfe]), Err(PayloadError::NotUtf8));
        assert!(matches!(parse_payload(b"on"), Err(PayloadError::NotNumeric(_))));
        assert!(matches!(parse_payload(b"12.5"), Err(PayloadError::NotNumeric(_))));
        assert!(matches!(parse_payload(b"{broken"), Err(PayloadError::NotNumeric(_))));
        assert_eq!(parse_payload(br#"{"val": 1}"#), Err(PayloadError::MissingValue));
        assert!(matches!(
            parse_payload(br#"{"value": [1]}"#),
            Err(PayloadError::NotNumeric(_))
        ));
        assert!(matches!(
            parse_payload(br#"{"value": 1.5}"#),
            Err(PayloadError::NotNumeric(_))
        ));
    }
}
