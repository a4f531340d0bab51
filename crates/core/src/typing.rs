//! Type coercion cascade shared by table cells and key-value facts.
//!
//! First match wins: empty -> text, numeric (after stripping `,`, `$`, `%`),
//! date (`YYYY-MM-DD`, `MM/DD/YYYY`, `MM-DD-YYYY`), boolean, and finally text.
//! The original string is always kept alongside the typed value.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Integer,
    Decimal,
    Date,
    Boolean,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Integer => "integer",
            DataType::Decimal => "decimal",
            DataType::Date => "date",
            DataType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "data_type", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Boolean(bool),
}

impl TypedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TypedValue::Text(_) => DataType::Text,
            TypedValue::Integer(_) => DataType::Integer,
            TypedValue::Decimal(_) => DataType::Decimal,
            TypedValue::Date(_) => DataType::Date,
            TypedValue::Boolean(_) => DataType::Boolean,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Integer(value) => Some(*value as f64),
            TypedValue::Decimal(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypedCell {
    pub text_value: String,
    pub value: TypedValue,
}

impl TypedCell {
    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

const DATE_FORMATS: [(&str, &str); 3] = [
    ("dddd-dd-dd", "%Y-%m-%d"),
    ("dd/dd/dddd", "%m/%d/%Y"),
    ("dd-dd-dddd", "%m-%d-%Y"),
];

const BOOLEAN_WORDS: [(&str, bool); 6] = [
    ("true", true),
    ("false", false),
    ("yes", true),
    ("no", false),
    ("1", true),
    ("0", false),
];

pub fn coerce(raw: &str) -> TypedCell {
    let trimmed = raw.trim();
    TypedCell {
        text_value: trimmed.to_string(),
        value: coerce_value(trimmed),
    }
}

fn coerce_value(value: &str) -> TypedValue {
    if value.is_empty() {
        return TypedValue::Text(String::new());
    }

    if let Some(number) = parse_number(value) {
        return number;
    }

    if let Some(date) = parse_date(value) {
        return TypedValue::Date(date);
    }

    let lowered = value.to_lowercase();
    if let Some((_, flag)) = BOOLEAN_WORDS.iter().find(|(word, _)| *word == lowered) {
        return TypedValue::Boolean(*flag);
    }

    TypedValue::Text(value.to_string())
}

fn parse_number(value: &str) -> Option<TypedValue> {
    let cleaned: String = value
        .chars()
        .filter(|ch| !matches!(ch, ',' | '$' | '%'))
        .collect();

    if cleaned.contains('.') {
        cleaned
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .map(TypedValue::Decimal)
    } else {
        cleaned.parse::<i64>().ok().map(TypedValue::Integer)
    }
}

/// Patterns are anchored at the start only, so `2024-03-01T09:00` still types as a date.
fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS.iter().find_map(|(shape, format)| {
        let candidate = value.get(..shape.len())?;
        if !matches_shape(candidate, shape) {
            return None;
        }
        NaiveDate::parse_from_str(candidate, format).ok()
    })
}

fn matches_shape(candidate: &str, shape: &str) -> bool {
    candidate.len() == shape.len()
        && candidate
            .chars()
            .zip(shape.chars())
            .all(|(ch, expected)| match expected {
                'd' => ch.is_ascii_digit(),
                other => ch == other,
            })
}
