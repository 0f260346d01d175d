//! Lenient field decoders for scraped payloads.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::Value as JsonValue;

/// Trimmed string.
pub fn trimmed<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    let value = String::deserialize(de)?;
    Ok(value.trim().to_string())
}

/// Trimmed optional string; blank reads as `None`.
pub fn blank_as_none<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(de)?;
    Ok(value.and_then(|s| crate::text_or_none(&s)))
}

/// Integer given either as a JSON number or as numeric text. Blank text reads as 0.
pub fn int_or_text<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    match JsonValue::deserialize(de)? {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| D::Error::custom(format!("number out of range: {n}"))),
        JsonValue::String(s) if s.trim().is_empty() => Ok(0),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("not a number: `{s}`"))),
        other => Err(D::Error::custom(format!("expected a number, got {other}"))),
    }
}

/// Unsigned id given either as a JSON number or as numeric text.
pub fn id_or_text<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    match JsonValue::deserialize(de)? {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("invalid id: {n}"))),
        JsonValue::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("invalid id: `{s}`"))),
        other => Err(D::Error::custom(format!("expected an id, got {other}"))),
    }
}

/// Read a timestamp in any of the shapes the catalogue sites emit.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y", "%d %b %Y"] {
        if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
            return parsed.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

pub fn timestamp<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(de)?;
    parse_timestamp(&text).ok_or_else(|| D::Error::custom(format!("unrecognised date `{text}`")))
}
