//! Value types declared on bindings.
//!
//! Calculated values are coerced to the declared type before they are
//! written; user values are only checked, never rewritten.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::expr::ast::format_number;
use crate::expr::evaluator::parse_number;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum DataType {
    #[default]
    String,
    Int,
    Decimal,
    Date,
    Time,
    DateTime,
    Boolean,
    Select,
    Select1,
    Geopoint,
    /// Anything unrecognised; treated as a string.
    Other,
}

impl DataType {
    /// Maps XForms type names such as `xsd:int` or `dateTime`.
    pub fn from_xform(raw: &str) -> Self {
        let local = raw.rsplit(':').next().unwrap_or(raw);
        match local {
            "integer" | "int" | "long" | "short" => DataType::Int,
            "decimal" | "double" | "float" => DataType::Decimal,
            other => other.parse().unwrap_or(DataType::Other),
        }
    }

    /// Coerces a calculated value. Returns an empty string when the value
    /// cannot be represented.
    pub fn coerce(&self, value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        match self {
            DataType::Int => {
                let n = parse_number(trimmed);
                if n.is_finite() {
                    format_number(n.trunc())
                } else {
                    String::new()
                }
            }
            DataType::Decimal => {
                let n = parse_number(trimmed);
                if n.is_finite() {
                    format_number(n)
                } else {
                    String::new()
                }
            }
            DataType::Boolean => match trimmed {
                "true" | "1" => "true".to_string(),
                "false" | "0" => "false".to_string(),
                _ => String::new(),
            },
            DataType::Date => match parse_date(trimmed) {
                Some(date) => date.format("%Y-%m-%d").to_string(),
                None => String::new(),
            },
            _ => value.to_string(),
        }
    }

    /// Whether a non-empty `value` is well-formed for this type.
    pub fn is_valid(&self, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return true;
        }
        match self {
            DataType::Int => integer_pattern().is_match(value),
            DataType::Decimal => parse_number(value).is_finite(),
            DataType::Date => parse_date(value).is_some(),
            DataType::Time => parse_time(value).is_some(),
            DataType::DateTime => parse_date_time(value).is_some(),
            DataType::Boolean => matches!(value, "true" | "false" | "1" | "0"),
            DataType::Geopoint => is_geopoint(value),
            DataType::String | DataType::Select | DataType::Select1 | DataType::Other => true,
        }
    }
}

fn integer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[-+]?\d+$").expect("valid integer pattern"))
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_date_time(value).map(|dt| dt.date()))
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    let bare = strip_offset(value);
    NaiveTime::parse_from_str(bare, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(bare, "%H:%M"))
        .ok()
}

fn parse_date_time(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .ok()
}

/// Drops a trailing `Z` or `±hh:mm` zone designator.
fn strip_offset(value: &str) -> &str {
    if let Some(stripped) = value.strip_suffix('Z') {
        return stripped;
    }
    match value.rfind(['+', '-']) {
        Some(pos) if pos >= 5 => &value[..pos],
        _ => value,
    }
}

/// `lat lon [altitude [accuracy]]`
fn is_geopoint(value: &str) -> bool {
    let parts: Vec<f64> = value.split_whitespace().map(parse_number).collect();
    if !(2..=4).contains(&parts.len()) || parts.iter().any(|p| !p.is_finite()) {
        return false;
    }
    (-90.0..=90.0).contains(&parts[0]) && (-180.0..=180.0).contains(&parts[1])
}
