//! Field mapping rules and data-type coercion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entity::{parse_bool, EntityError, FieldValue};
use crate::extraction::as_text;

/// Error type for mapping rules
#[derive(Debug)]
pub enum MappingError {
    UnknownDataType(String),
    Io { path: String, source: std::io::Error },
    Parse { path: String, reason: String },
    InvalidRule { rule: String, reason: String },
    Store(String),
    Entity(EntityError),
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::UnknownDataType(name) => write!(f, "Unknown data type: {}", name),
            MappingError::Io { path, source } => {
                write!(f, "Failed to read mapping file {}: {}", path, source)
            }
            MappingError::Parse { path, reason } => {
                write!(f, "Failed to parse mapping file {}: {}", path, reason)
            }
            MappingError::InvalidRule { rule, reason } => {
                write!(f, "Invalid mapping rule {}: {}", rule, reason)
            }
            MappingError::Store(msg) => write!(f, "Mapping store error: {}", msg),
            MappingError::Entity(e) => write!(f, "Entity assembly failed: {}", e),
        }
    }
}

impl std::error::Error for MappingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MappingError::Io { source, .. } => Some(source),
            MappingError::Entity(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EntityError> for MappingError {
    fn from(err: EntityError) -> Self {
        MappingError::Entity(err)
    }
}

/// Target type of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    Array,
    Json,
    Jsonb,
    Object,
}

/// Whole number inside the i64 range. `i64::MAX as f64` rounds up to 2^63,
/// so the upper bound is exclusive.
fn is_exact_i64(f: f64) -> bool {
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "STRING",
            DataType::Integer => "INTEGER",
            DataType::Long => "LONG",
            DataType::Double => "DOUBLE",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Uuid => "UUID",
            DataType::Array => "ARRAY",
            DataType::Json => "JSON",
            DataType::Jsonb => "JSONB",
            DataType::Object => "OBJECT",
        }
    }

    /// Coerce a JSON value to this type. Null and unconvertible values give `None`.
    pub fn coerce(&self, value: &Value) -> Option<FieldValue> {
        if value.is_null() {
            return None;
        }
        match self {
            DataType::String => as_text(value).map(FieldValue::Text),
            DataType::Integer | DataType::Long => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| is_exact_i64(*f)).map(|f| f as i64))
                    .map(FieldValue::Integer),
                Value::String(s) => s.trim().parse::<i64>().ok().map(FieldValue::Integer),
                _ => None,
            },
            DataType::Double => match value {
                Value::Number(n) => n.as_f64().map(FieldValue::Double),
                Value::String(s) => s.trim().parse::<f64>().ok().map(FieldValue::Double),
                _ => None,
            },
            DataType::Boolean => match value {
                Value::Bool(b) => Some(FieldValue::Bool(*b)),
                Value::Number(n) => n.as_i64().map(|i| FieldValue::Bool(i != 0)),
                Value::String(s) => parse_bool(s).map(FieldValue::Bool),
                _ => None,
            },
            DataType::Uuid => match value {
                Value::String(s) => Uuid::parse_str(s.trim()).ok().map(FieldValue::Uuid),
                _ => None,
            },
            DataType::Timestamp => value.as_str().and_then(parse_timestamp).map(FieldValue::Timestamp),
            DataType::Date => value.as_str().and_then(parse_date).map(FieldValue::Date),
            DataType::Array => match value {
                Value::Array(items) => Some(FieldValue::List(
                    items.iter().filter_map(as_text).collect(),
                )),
                _ => None,
            },
            DataType::Json | DataType::Jsonb | DataType::Object => Some(FieldValue::Json(value.clone())),
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::String
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataType {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STRING" | "TEXT" => Ok(DataType::String),
            "INTEGER" | "INT" => Ok(DataType::Integer),
            "LONG" | "BIGINT" => Ok(DataType::Long),
            "DOUBLE" | "FLOAT" => Ok(DataType::Double),
            "BOOLEAN" | "BOOL" => Ok(DataType::Boolean),
            "DATE" => Ok(DataType::Date),
            "TIMESTAMP" => Ok(DataType::Timestamp),
            "UUID" => Ok(DataType::Uuid),
            "ARRAY" => Ok(DataType::Array),
            "JSON" => Ok(DataType::Json),
            "JSONB" => Ok(DataType::Jsonb),
            "OBJECT" => Ok(DataType::Object),
            _ => Err(MappingError::UnknownDataType(s.to_string())),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = MappingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.as_str().to_string()
    }
}

/// Full timestamp first, then a date-only prefix at midnight UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    parse_date(s)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// Date from the first ten characters (`YYYY-MM-DD`).
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    s.trim()
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// One externally stored instruction for filling a single target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub vendor: String,
    /// Source entity type (`users`, `apps`)
    pub entity_type: String,
    /// Target entity name (`user`, `group`, `office_location`, ...)
    pub target_entity: String,
    /// Target field, camelCase (`displayName`)
    pub target_field: String,
    pub source_path: String,
    #[serde(default)]
    pub fallback_paths: Vec<String>,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub transform_args: Option<Value>,
    /// Literal default, coerced to `data_type` when used
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub priority: i32,
}

impl FieldMapping {
    /// Coerce the literal default to the rule's data type.
    ///
    /// Structured types parse the literal as JSON; everything else coerces
    /// the literal string.
    pub fn default_field_value(&self) -> Option<FieldValue> {
        let literal = self.default_value.as_deref()?;
        match self.data_type {
            DataType::Json | DataType::Jsonb | DataType::Object | DataType::Array => {
                let parsed = serde_json::from_str::<Value>(literal)
                    .unwrap_or_else(|_| Value::String(literal.to_string()));
                self.data_type.coerce(&parsed)
            }
            _ => self.data_type.coerce(&Value::String(literal.to_string())),
        }
    }

    /// Arguments for the transform, `Value::Null` when absent.
    pub fn args(&self) -> &Value {
        self.transform_args.as_ref().unwrap_or(&Value::Null)
    }

    /// Check the parts of a rule that would otherwise fail silently at runtime.
    pub fn validate(&self) -> Result<(), MappingError> {
        let invalid = |reason: &str| MappingError::InvalidRule {
            rule: self.describe(),
            reason: reason.to_string(),
        };
        if self.target_field.trim().is_empty() {
            return Err(invalid("empty target_field"));
        }
        let injected = matches!(self.target_field.as_str(), "tenantId" | "instanceId");
        if self.source_path.trim().is_empty()
            && self.transform.is_none()
            && self.default_value.is_none()
            && !injected
        {
            return Err(invalid("no source_path, transform or default_value"));
        }
        if let Some(args) = &self.transform_args {
            if !args.is_object() && !args.is_null() {
                return Err(invalid("transform_args must be an object"));
            }
        }
        Ok(())
    }

    /// `vendor/entity_type/target_entity.target_field`
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}.{}",
            self.vendor, self.entity_type, self.target_entity, self.target_field
        )
    }
}
