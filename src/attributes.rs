// 🏛️ Attribute Model - typed values carried by dimension rows
//
// An attribute is either TRACKED (participates in the fingerprint, a change
// creates a new version) or PASS-THROUGH (copied onto the row, never versioned).
// Values are typed so that "the same value" means the same thing everywhere:
// a date and the same date as a midnight timestamp are one value.

use crate::error::{MergeError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute name → value. BTreeMap keeps iteration order canonical.
pub type Attributes = BTreeMap<String, AttributeValue>;

// ============================================================================
// ENTITY IDENTIFIER
// ============================================================================

/// Business identifier of an entity (customer_id, product_id, ...).
///
/// Stable across runs. Not unique in the dimension table on its own, only
/// together with a validity window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId(id.to_string())
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// ATTRIBUTE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Text => "text",
            AttributeType::Integer => "integer",
            AttributeType::Decimal => "decimal",
            AttributeType::Boolean => "boolean",
            AttributeType::Date => "date",
            AttributeType::Timestamp => "timestamp",
        }
    }

    /// SQLite column type used for this attribute.
    pub fn sql_type(&self) -> &'static str {
        match self {
            AttributeType::Text | AttributeType::Date | AttributeType::Timestamp => "TEXT",
            AttributeType::Integer | AttributeType::Boolean => "INTEGER",
            AttributeType::Decimal => "REAL",
        }
    }

    /// Parse a raw extract cell. Empty cells are NULL.
    pub fn parse_text(&self, attribute: &str, raw: &str) -> Result<AttributeValue> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(AttributeValue::Null);
        }

        let mismatch = || {
            MergeError::type_mismatch(
                attribute,
                format!("cannot parse {:?} as {}", raw, self.as_str()),
            )
        };

        match self {
            AttributeType::Text => Ok(AttributeValue::Text(raw.to_string())),
            AttributeType::Integer => raw
                .parse::<i64>()
                .map(AttributeValue::Integer)
                .map_err(|_| mismatch()),
            AttributeType::Decimal => {
                let value = raw.parse::<f64>().map_err(|_| mismatch())?;
                if !value.is_finite() {
                    return Err(mismatch());
                }
                Ok(AttributeValue::Decimal(value))
            }
            AttributeType::Boolean => match raw.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(AttributeValue::Boolean(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(AttributeValue::Boolean(false)),
                _ => Err(mismatch()),
            },
            AttributeType::Date => parse_date(raw)
                .map(AttributeValue::Date)
                .or_else(|| parse_timestamp(raw).map(AttributeValue::Timestamp))
                .ok_or_else(mismatch),
            AttributeType::Timestamp => parse_timestamp(raw)
                .map(AttributeValue::Timestamp)
                .or_else(|| parse_date(raw).map(AttributeValue::Date))
                .ok_or_else(mismatch),
        }
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}

// ============================================================================
// ATTRIBUTE VALUES
// ============================================================================

/// A single attribute value as read from an extract or the dimension table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttributeValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Decimal(_) => "decimal",
            AttributeValue::Text(_) => "text",
            AttributeValue::Date(_) => "date",
            AttributeValue::Timestamp(_) => "timestamp",
        }
    }

    /// Normalize this value to the declared type of `def`.
    ///
    /// Accepted coercions:
    /// - timestamp at midnight → date (date attributes)
    /// - date → timestamp at midnight (timestamp attributes)
    /// - integral decimal → integer, integer → decimal
    /// - `-0.0` → `0.0`
    ///
    /// Anything else that does not match the declared type is a `TypeMismatch`.
    pub fn canonicalize(&self, def: &AttributeDefinition) -> Result<AttributeValue> {
        let mismatch = |reason: String| MergeError::type_mismatch(&def.name, reason);

        match (def.type_, self) {
            (_, AttributeValue::Null) => Ok(AttributeValue::Null),

            (AttributeType::Text, AttributeValue::Text(s)) => Ok(AttributeValue::Text(s.clone())),

            (AttributeType::Boolean, AttributeValue::Boolean(b)) => Ok(AttributeValue::Boolean(*b)),

            (AttributeType::Integer, AttributeValue::Integer(i)) => Ok(AttributeValue::Integer(*i)),
            (AttributeType::Integer, AttributeValue::Decimal(f)) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Ok(AttributeValue::Integer(*f as i64))
                } else {
                    Err(mismatch(format!("decimal {} is not an integer", f)))
                }
            }

            (AttributeType::Decimal, AttributeValue::Decimal(f)) => {
                if !f.is_finite() {
                    return Err(mismatch(format!("non-finite decimal {}", f)));
                }
                Ok(AttributeValue::Decimal(if *f == 0.0 { 0.0 } else { *f }))
            }
            (AttributeType::Decimal, AttributeValue::Integer(i)) => {
                Ok(AttributeValue::Decimal(*i as f64))
            }

            (AttributeType::Date, AttributeValue::Date(d)) => Ok(AttributeValue::Date(*d)),
            (AttributeType::Date, AttributeValue::Timestamp(ts)) => {
                if ts.time() == NaiveTime::MIN {
                    Ok(AttributeValue::Date(ts.date()))
                } else {
                    Err(mismatch(format!("timestamp {} has a time part", ts)))
                }
            }

            (AttributeType::Timestamp, AttributeValue::Timestamp(ts)) => {
                Ok(AttributeValue::Timestamp(*ts))
            }
            (AttributeType::Timestamp, AttributeValue::Date(d)) => {
                Ok(AttributeValue::Timestamp(d.and_time(NaiveTime::MIN)))
            }

            (expected, other) => Err(mismatch(format!(
                "expected {}, got {}",
                expected.as_str(),
                other.type_name()
            ))),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Boolean(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Decimal(value)
    }
}

impl From<NaiveDate> for AttributeValue {
    fn from(value: NaiveDate) -> Self {
        AttributeValue::Date(value)
    }
}

impl From<NaiveDateTime> for AttributeValue {
    fn from(value: NaiveDateTime) -> Self {
        AttributeValue::Timestamp(value)
    }
}

// ============================================================================
// ATTRIBUTE DEFINITION
// ============================================================================

/// Declared attribute of a dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Column name in the dimension table (e.g., "email")
    pub name: String,

    /// Declared value type
    #[serde(rename = "type")]
    pub type_: AttributeType,

    /// Column name in the raw extract when it differs (e.g., "emailAddress")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Extract columns joined into this attribute (e.g., firstName + lastName)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concat: Option<ConcatSource>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, type_: AttributeType) -> Self {
        AttributeDefinition {
            name: name.into(),
            type_,
            source: None,
            concat: None,
            description: String::new(),
        }
    }

    /// Builder: read this attribute from a differently named extract column
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Builder: derive this attribute by joining several extract columns
    pub fn with_concat<I, C>(mut self, columns: I, separator: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.concat = Some(ConcatSource {
            columns: columns.into_iter().map(Into::into).collect(),
            separator: separator.into(),
        });
        self
    }

    /// Builder: add description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Extract column holding this attribute.
    pub fn source_column(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    /// Every extract column this attribute is read from.
    pub fn source_columns(&self) -> Vec<&str> {
        match &self.concat {
            Some(concat) => concat.columns.iter().map(String::as_str).collect(),
            None => vec![self.source_column()],
        }
    }
}

/// An attribute built from several extract columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSource {
    pub columns: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    " ".to_string()
}

impl ConcatSource {
    /// Join the non-empty parts. All parts empty is an empty cell (NULL).
    pub fn join<'a>(&self, parts: impl IntoIterator<Item = &'a str>) -> String {
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(&self.separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_midnight_timestamp_canonicalizes_to_date() {
        let def = AttributeDefinition::new("dob", AttributeType::Date);
        let ts = AttributeValue::Timestamp(date(1980, 5, 17).and_time(NaiveTime::MIN));

        assert_eq!(ts.canonicalize(&def).unwrap(), AttributeValue::Date(date(1980, 5, 17)));
    }

    #[test]
    fn test_timestamp_with_time_is_not_a_date() {
        let def = AttributeDefinition::new("dob", AttributeType::Date);
        let ts = AttributeValue::Timestamp(date(1980, 5, 17).and_hms_opt(9, 30, 0).unwrap());

        let err = ts.canonicalize(&def).unwrap_err();
        assert!(matches!(err, MergeError::TypeMismatch { ref attribute, .. } if attribute == "dob"));
    }

    #[test]
    fn test_numeric_coercions() {
        let int_def = AttributeDefinition::new("qty", AttributeType::Integer);
        let dec_def = AttributeDefinition::new("price", AttributeType::Decimal);

        assert_eq!(
            AttributeValue::Decimal(3.0).canonicalize(&int_def).unwrap(),
            AttributeValue::Integer(3)
        );
        assert!(AttributeValue::Decimal(3.5).canonicalize(&int_def).is_err());
        assert_eq!(
            AttributeValue::Integer(120).canonicalize(&dec_def).unwrap(),
            AttributeValue::Decimal(120.0)
        );
        assert!(AttributeValue::Decimal(f64::NAN).canonicalize(&dec_def).is_err());
        assert!(AttributeValue::Decimal(f64::INFINITY).canonicalize(&dec_def).is_err());
    }

    #[test]
    fn test_concat_source_skips_empty_parts() {
        let def = AttributeDefinition::new("name", AttributeType::Text)
            .with_concat(["firstName", "lastName"], " ");
        let concat = def.concat.as_ref().unwrap();

        assert_eq!(def.source_columns(), vec!["firstName", "lastName"]);
        assert_eq!(concat.join(["Ada", "Lovelace"]), "Ada Lovelace");
        assert_eq!(concat.join([" Ada ", ""]), "Ada");
        assert_eq!(concat.join(["", ""]), "");
    }

    #[test]
    fn test_text_is_not_silently_coerced() {
        let def = AttributeDefinition::new("rewards_programme_member", AttributeType::Boolean);
        let err = AttributeValue::text("true").canonicalize(&def).unwrap_err();

        assert!(err.to_string().contains("expected boolean, got text"));
    }

    #[test]
    fn test_parse_text_cells() {
        assert_eq!(
            AttributeType::Boolean.parse_text("flag", "True").unwrap(),
            AttributeValue::Boolean(true)
        );
        assert_eq!(
            AttributeType::Date.parse_text("dob", "1991-02-03").unwrap(),
            AttributeValue::Date(date(1991, 2, 3))
        );
        assert_eq!(
            AttributeType::Timestamp
                .parse_text("joined", "2019-07-01 08:15:00")
                .unwrap(),
            AttributeValue::Timestamp(date(2019, 7, 1).and_hms_opt(8, 15, 0).unwrap())
        );
        assert_eq!(AttributeType::Integer.parse_text("n", "  ").unwrap(), AttributeValue::Null);
        assert!(AttributeType::Integer.parse_text("n", "12x").is_err());
        assert!(AttributeType::Decimal.parse_text("price", "inf").is_err());
    }

    #[test]
    fn test_source_column_alias() {
        let plain = AttributeDefinition::new("email", AttributeType::Text);
        let aliased = plain.clone().with_source("emailAddress");

        assert_eq!(plain.source_column(), "email");
        assert_eq!(aliased.source_column(), "emailAddress");
    }
}
