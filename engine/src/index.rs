//! Index specs and their physical materialization.
//!
//! An index spec declares a JSON path and a comparison type. Each spec
//! becomes a column on the soup table (or an expression index for
//! [`IndexType::Json1`]), and full-text specs are mirrored into an FTS5
//! virtual table.

use crate::{error::Result, json_path, Error};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Reserved path for the whole document.
pub const SOUP: &str = "_soup";
/// Reserved path for the soup entry id.
pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
/// Reserved path for the last write time (millis since epoch).
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";
/// Reserved path for the creation time (millis since epoch).
pub const SOUP_CREATED_DATE: &str = "_soupCreatedDate";

const RESERVED_PATHS: [&str; 4] = [SOUP, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE, SOUP_CREATED_DATE];

/// Index types supported by soups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    String,
    Integer,
    Floating,
    FullText,
    /// No column; queried through `json_extract` with an expression index.
    Json1,
}

impl IndexType {
    /// SQLite column affinity, or `None` when no column is materialized.
    pub fn column_affinity(&self) -> Option<&'static str> {
        match self {
            IndexType::String | IndexType::FullText => Some("TEXT"),
            IndexType::Integer => Some("INTEGER"),
            IndexType::Floating => Some("REAL"),
            IndexType::Json1 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::String => "string",
            IndexType::Integer => "integer",
            IndexType::Floating => "floating",
            IndexType::FullText => "full_text",
            IndexType::Json1 => "json1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(IndexType::String),
            "integer" => Some(IndexType::Integer),
            "floating" => Some(IndexType::Floating),
            "full_text" => Some(IndexType::FullText),
            "json1" => Some(IndexType::Json1),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of an indexed path in a soup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Dot-delimited JSON path, e.g. `Account.Name`
    pub path: String,
    /// Comparison type
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

impl IndexSpec {
    pub fn new(path: impl Into<String>, index_type: IndexType) -> Self {
        Self {
            path: path.into(),
            index_type,
        }
    }

    pub fn string(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::String)
    }

    pub fn integer(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Integer)
    }

    pub fn floating(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Floating)
    }

    pub fn full_text(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::FullText)
    }

    pub fn json1(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Json1)
    }

    /// Check that the path is a well-formed dot-delimited path.
    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path)?;
        if RESERVED_PATHS.contains(&self.path.as_str()) {
            return Err(Error::invalid_path(&self.path, "reserved path"));
        }
        Ok(())
    }
}

/// Validate a set of index specs for registration.
pub fn validate_specs(specs: &[IndexSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.path.as_str()) {
            return Err(Error::invalid_path(&spec.path, "duplicate index path"));
        }
    }
    Ok(())
}

/// Validate a dot-delimited JSON path.
///
/// Segments may contain ASCII alphanumerics, `_`, `-` and `$`.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_path(path, "empty path"));
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(Error::invalid_path(path, "empty path segment"));
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$')))
        {
            return Err(Error::invalid_path(
                path,
                format!("illegal character '{}'", c),
            ));
        }
    }
    Ok(())
}

/// An index spec bound to its physical column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoupIndex {
    pub path: String,
    pub index_type: IndexType,
    /// Column on the soup table; `None` for json1 indexes
    pub column_name: Option<String>,
}

impl SoupIndex {
    pub fn spec(&self) -> IndexSpec {
        IndexSpec::new(self.path.clone(), self.index_type)
    }

    /// Value to store in the index column for `doc`.
    pub fn materialize(&self, doc: &Value) -> SqlValue {
        match json_path::project(doc, &self.path) {
            Some(value) => to_sql_value(&value, self.index_type),
            None => SqlValue::Null,
        }
    }
}

/// Convert a projected JSON value into the SQL value for an index column.
pub fn to_sql_value(value: &Value, index_type: IndexType) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match index_type {
            IndexType::String | IndexType::FullText => SqlValue::Text(n.to_string()),
            // Fractional values keep their fraction so 3.7 never equals 3
            IndexType::Integer => n
                .as_i64()
                .map(SqlValue::Integer)
                .or_else(|| n.as_f64().map(integral_or_real))
                .unwrap_or(SqlValue::Null),
            IndexType::Floating | IndexType::Json1 => n
                .as_f64()
                .map(SqlValue::Real)
                .unwrap_or(SqlValue::Null),
        },
        Value::String(s) => match index_type {
            IndexType::Integer => s
                .parse::<i64>()
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(s.clone())),
            IndexType::Floating => s
                .parse::<f64>()
                .map(SqlValue::Real)
                .unwrap_or_else(|_| SqlValue::Text(s.clone())),
            _ => SqlValue::Text(s.clone()),
        },
        other => SqlValue::Text(other.to_string()),
    }
}

fn integral_or_real(f: f64) -> SqlValue {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        SqlValue::Integer(f as i64)
    } else {
        SqlValue::Real(f)
    }
}

/// Convert a query bind into a SQL value without any index coercion.
pub fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Convert a SQL value read back from a query into JSON.
pub fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_good_paths() {
        assert!(validate_path("Id").is_ok());
        assert!(validate_path("Account.Name").is_ok());
        assert!(validate_path("__local__").is_ok());
        assert!(validate_path("attributes.type").is_ok());
    }

    #[test]
    fn validate_bad_paths() {
        assert!(matches!(
            validate_path(""),
            Err(Error::InvalidIndexPath { .. })
        ));
        assert!(validate_path("Account..Name").is_err());
        assert!(validate_path(".Name").is_err());
        assert!(validate_path("Name.").is_err());
        assert!(validate_path("Name'; DROP TABLE x").is_err());
    }

    #[test]
    fn reserved_and_duplicate_specs() {
        assert!(IndexSpec::string(SOUP_ENTRY_ID).validate().is_err());
        let specs = vec![IndexSpec::string("Id"), IndexSpec::integer("Id")];
        assert!(matches!(
            validate_specs(&specs),
            Err(Error::InvalidIndexPath { reason, .. }) if reason == "duplicate index path"
        ));
    }

    #[test]
    fn materialize_by_type() {
        let doc = json!({"Name": "Acme", "Employees": 12, "Rating": "4.5", "__local__": true});

        let string_idx = SoupIndex {
            path: "Employees".into(),
            index_type: IndexType::String,
            column_name: Some("TABLE_1_0".into()),
        };
        assert_eq!(string_idx.materialize(&doc), SqlValue::Text("12".into()));

        let float_idx = SoupIndex {
            path: "Rating".into(),
            index_type: IndexType::Floating,
            column_name: Some("TABLE_1_1".into()),
        };
        assert_eq!(float_idx.materialize(&doc), SqlValue::Real(4.5));

        let flag_idx = SoupIndex {
            path: "__local__".into(),
            index_type: IndexType::String,
            column_name: Some("TABLE_1_2".into()),
        };
        assert_eq!(flag_idx.materialize(&doc), SqlValue::Integer(1));

        let missing = SoupIndex {
            path: "Missing".into(),
            index_type: IndexType::Integer,
            column_name: Some("TABLE_1_3".into()),
        };
        assert_eq!(missing.materialize(&doc), SqlValue::Null);
    }

    #[test]
    fn integer_index_keeps_fractions() {
        assert_eq!(
            to_sql_value(&json!(3.7), IndexType::Integer),
            SqlValue::Real(3.7)
        );
        assert_eq!(
            to_sql_value(&json!(3.0), IndexType::Integer),
            SqlValue::Integer(3)
        );
        assert_eq!(to_sql_value(&json!(3), IndexType::Integer), SqlValue::Integer(3));
    }

    #[test]
    fn index_type_serialization() {
        let spec = IndexSpec::full_text("Description");
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"path":"Description","type":"full_text"}"#);
        assert_eq!(IndexType::parse("json1"), Some(IndexType::Json1));
        assert_eq!(IndexType::Floating.to_string(), "floating");
    }
}
