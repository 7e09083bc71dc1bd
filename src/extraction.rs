//! Path-based value extraction from JSON documents.
//!
//! Paths are dot separated field names with an optional `$` root prefix and
//! bracket segments: `[2]` (index), `[*]` (wildcard, first element for scalar
//! extraction) and `['odd.key']` (quoted field name). A path that does not
//! parse, or that hits a type mismatch while being evaluated, is retried with
//! plain segment-by-segment navigation before the extractor gives up.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::mapping::rule::DataType;

/// Error raised while parsing or evaluating a path expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    Empty,
    Malformed { path: String, reason: String },
    TypeMismatch { segment: String, found: &'static str },
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Empty => write!(f, "Empty path"),
            PathError::Malformed { path, reason } => {
                write!(f, "Malformed path '{}': {}", path, reason)
            }
            PathError::TypeMismatch { segment, found } => {
                write!(f, "Cannot apply segment '{}' to a {}", segment, found)
            }
        }
    }
}

impl std::error::Error for PathError {}

/// Represents a parsed path into a JSON document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// The raw path string
    pub raw: String,
    /// Parsed path segments
    pub segments: Vec<PathSegment>,
}

/// A segment in a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A named field (e.g., "user", "name")
    Field(String),
    /// An array index (e.g., [0], [5])
    Index(usize),
    /// `[*]`; the first element when a single value is wanted
    Wildcard,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, "{}", name),
            PathSegment::Index(i) => write!(f, "[{}]", i),
            PathSegment::Wildcard => write!(f, "[*]"),
        }
    }
}

fn bracket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\[(?:(\d+)|(\*)|'([^']*)'|"([^"]*)")\]"#).expect("valid bracket regex")
    })
}

impl FieldPath {
    /// Parse a path expression
    ///
    /// # Example
    ///
    /// ```
    /// use entity_fabric::extraction::{FieldPath, PathSegment};
    ///
    /// let path = FieldPath::parse("$.data.groups[*].id").unwrap();
    /// assert_eq!(path.segments.len(), 4);
    /// assert_eq!(path.segments[2], PathSegment::Wildcard);
    /// ```
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let trimmed = path.trim();
        let body = trimmed
            .strip_prefix("$.")
            .or_else(|| trimmed.strip_prefix('$'))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err(PathError::Empty);
        }

        let malformed = |reason: &str| PathError::Malformed {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut rest = body;
        let mut expect_name = true;

        while !rest.is_empty() {
            if rest.starts_with('[') {
                let caps = bracket_regex()
                    .captures(rest)
                    .ok_or_else(|| malformed("unterminated or invalid bracket segment"))?;
                let segment = if let Some(index) = caps.get(1) {
                    let index = index
                        .as_str()
                        .parse::<usize>()
                        .map_err(|_| malformed("index out of range"))?;
                    PathSegment::Index(index)
                } else if caps.get(2).is_some() {
                    PathSegment::Wildcard
                } else {
                    let name = caps.get(3).or_else(|| caps.get(4)).map(|m| m.as_str()).unwrap_or("");
                    PathSegment::Field(name.to_string())
                };
                segments.push(segment);
                rest = &rest[caps.get(0).map(|m| m.end()).unwrap_or(rest.len())..];
                expect_name = false;
            } else if let Some(after_dot) = rest.strip_prefix('.') {
                if expect_name {
                    return Err(malformed("empty segment"));
                }
                rest = after_dot;
                expect_name = true;
                if rest.is_empty() {
                    return Err(malformed("trailing dot"));
                }
            } else {
                if !expect_name {
                    return Err(malformed("missing '.' between segments"));
                }
                let end = rest.find(['.', '[']).unwrap_or(rest.len());
                let name = &rest[..end];
                if name.contains(']') {
                    return Err(malformed("stray ']'"));
                }
                segments.push(PathSegment::Field(name.to_string()));
                rest = &rest[end..];
                expect_name = false;
            }
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    /// Whether the path contains a `[*]` segment
    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, PathSegment::Wildcard))
    }

    /// Evaluate the path against a document.
    ///
    /// Missing keys and out-of-range indices are `Ok(None)`; applying a
    /// segment to a value of the wrong shape is an error so that callers can
    /// retry with direct navigation.
    pub fn evaluate<'a>(&self, document: &'a Value) -> Result<Option<&'a Value>, PathError> {
        let mut current = document;
        for segment in &self.segments {
            let next = match (segment, current) {
                (PathSegment::Field(name), Value::Object(map)) => map.get(name),
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
                (PathSegment::Wildcard, Value::Array(items)) => items.first(),
                (_, Value::Null) => None,
                (segment, other) => {
                    return Err(PathError::TypeMismatch {
                        segment: segment.to_string(),
                        found: value_kind(other),
                    })
                }
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Trait for documents that can be addressed by [`FieldPath`]
pub trait Extractor {
    /// Value at the given path, `None` if absent or null
    fn extract(&self, path: &FieldPath) -> Option<&Value>;

    /// Value at the path, deserialized into `T`
    fn extract_as<T>(&self, path: &FieldPath) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.extract(path).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl Extractor for Value {
    fn extract(&self, path: &FieldPath) -> Option<&Value> {
        path.evaluate(self).ok().flatten().filter(|v| !v.is_null())
    }
}

/// Plain navigation: strip the root prefix, split on dots, follow object keys.
pub fn navigate_direct<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let clean = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    let mut current = document;
    for part in clean.split('.') {
        current = current.as_object()?.get(part)?;
    }
    (!current.is_null()).then_some(current)
}

/// Resolve a path against a document, never failing.
///
/// Evaluates the path expression first and falls back to
/// [`navigate_direct`] when the expression is malformed or mismatched.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let evaluated = FieldPath::parse(path).and_then(|p| p.evaluate(document));
    match evaluated {
        Ok(found) => found.filter(|v| !v.is_null()),
        Err(PathError::Empty) => None,
        Err(e) => {
            tracing::debug!("Path evaluation failed ({}); using direct navigation", e);
            navigate_direct(document, path)
        }
    }
}

/// Extract a single value and coerce it to `data_type`.
///
/// Absence, null and coercion failure all yield `None`.
pub fn extract(document: &Value, path: &str, data_type: DataType) -> Option<Value> {
    coerce_found(lookup(document, path)?, path, data_type)
}

/// Coerce a value already found at `path`.
pub fn coerce_found(raw: &Value, path: &str, data_type: DataType) -> Option<Value> {
    let coerced = data_type.coerce(raw);
    if coerced.is_none() {
        tracing::debug!("Value at '{}' could not be coerced to {}", path, data_type);
    }
    coerced.map(|v| v.to_json())
}

/// Extract the array at `path`, or an empty vector when the path does not
/// resolve to an array.
pub fn extract_array(document: &Value, path: &str) -> Vec<Value> {
    let resolved = FieldPath::parse(path)
        .and_then(|p| {
            // a trailing [*] addresses the array itself
            let mut p = p;
            if matches!(p.segments.last(), Some(PathSegment::Wildcard)) {
                p.segments.pop();
            }
            p.evaluate(document)
        })
        .ok()
        .flatten()
        .or_else(|| navigate_direct(document, path.trim_end_matches("[*]")));

    match resolved {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            tracing::warn!("Value at path {} is a {}, not an array", path, value_kind(other));
            Vec::new()
        }
        None => Vec::new(),
    }
}

/// Textual form of a scalar: strings as-is, numbers and booleans printed,
/// containers as compact JSON. `None` for null.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "tenant": "T1",
            "data": {
                "id": "U1",
                "mail": "A@X.com",
                "accountEnabled": true,
                "otherMails": ["b@x.com", "c@y.org"],
                "groups": [{"id": "G1"}, {"id": "G2"}],
                "@odata.type": "#microsoft.graph.user",
                "signInActivity": {"lastSignInDateTime": "2024-03-01T10:00:00Z"}
            }
        })
    }

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("user.address.city").unwrap();

        assert_eq!(path.segments.len(), 3);
        assert_eq!(path.segments[0], PathSegment::Field("user".to_string()));
        assert_eq!(path.segments[2], PathSegment::Field("city".to_string()));
    }

    #[test]
    fn test_field_path_with_brackets() {
        let path = FieldPath::parse("$.items[0]['odd.key'][*]").unwrap();

        assert_eq!(
            path.segments,
            vec![
                PathSegment::Field("items".to_string()),
                PathSegment::Index(0),
                PathSegment::Field("odd.key".to_string()),
                PathSegment::Wildcard,
            ]
        );
        assert!(path.has_wildcard());
    }

    #[test]
    fn test_malformed_paths() {
        assert!(matches!(FieldPath::parse("a..b"), Err(PathError::Malformed { .. })));
        assert!(matches!(FieldPath::parse("a[0"), Err(PathError::Malformed { .. })));
        assert!(matches!(FieldPath::parse("a.b."), Err(PathError::Malformed { .. })));
        assert_eq!(FieldPath::parse("$"), Err(PathError::Empty));
    }

    #[test]
    fn test_lookup_with_and_without_root_prefix() {
        let d = doc();
        assert_eq!(lookup(&d, "data.id"), Some(&json!("U1")));
        assert_eq!(lookup(&d, "$.data.id"), Some(&json!("U1")));
        assert_eq!(lookup(&d, "data.missing"), None);
    }

    #[test]
    fn test_wildcard_means_first_element() {
        let d = doc();
        assert_eq!(lookup(&d, "data.groups[*].id"), Some(&json!("G1")));
        assert_eq!(lookup(&d, "data.groups[1].id"), Some(&json!("G2")));
        assert_eq!(lookup(&d, "data.groups[5].id"), None);
    }

    #[test]
    fn test_type_mismatch_falls_back_to_direct_navigation() {
        let d = json!({"data": {"name[x]": "odd", "mail": "a@x.com"}});
        // "name[x]" is not a valid bracket segment; direct navigation finds the key
        assert_eq!(lookup(&d, "data.name[x]"), Some(&json!("odd")));
        // indexing into a string is a mismatch, and direct navigation finds nothing
        assert_eq!(lookup(&d, "data.mail[0]"), None);
    }

    #[test]
    fn test_extract_coerces() {
        let d = doc();
        assert_eq!(extract(&d, "data.accountEnabled", DataType::String), Some(json!("true")));
        assert_eq!(
            extract(&d, "data.signInActivity.lastSignInDateTime", DataType::Timestamp),
            Some(json!("2024-03-01T10:00:00Z"))
        );
        assert_eq!(extract(&d, "data.mail", DataType::Integer), None);
    }

    #[test]
    fn test_extract_array_never_none() {
        let d = doc();
        assert_eq!(extract_array(&d, "data.groups").len(), 2);
        assert_eq!(extract_array(&d, "data.groups[*]").len(), 2);
        assert!(extract_array(&d, "data.mail").is_empty());
        assert!(extract_array(&d, "data.nothing").is_empty());
    }

    #[test]
    fn test_extractor_trait_on_value() {
        let d = doc();
        let path = FieldPath::parse("data.otherMails").unwrap();
        let mails: Option<Vec<String>> = d.extract_as(&path);
        assert_eq!(mails.unwrap().len(), 2);
    }
}
