//! Transform registry for named value transformations.
//!
//! Transforms are looked up by a [`TransformKind`] parsed from the rule's
//! transform name. Every built-in kind is backed by a closure registered at
//! construction; custom closures can be registered under any other name.
//! Dispatch never fails: an unknown name, an `Err` or a panic inside a
//! transform all yield the untransformed input value.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use convert_case::{Case, Casing};
use serde_json::Value;

use crate::runtime::ExtractionContext;
use crate::transforms;

/// Error type for transform operations
#[derive(Debug, Clone)]
pub enum TransformError {
    InvalidArgs(String),
    InvalidInput(String),
    ExecutionError(String),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            TransformError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            TransformError::ExecutionError(msg) => write!(f, "Execution error: {}", msg),
        }
    }
}

impl std::error::Error for TransformError {}

/// Name of a transform, resolved once from the rule text.
///
/// Names match case-insensitively and camelCase spellings are accepted
/// (`parseIsoDate` resolves to [`TransformKind::ParseIsoDate`]). Anything that
/// is not a built-in becomes [`TransformKind::Named`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Lowercase,
    Uppercase,
    Trim,
    ExtractDomain,
    Coalesce,
    DefaultIfNull,
    Concat,
    Split,
    ParseIsoDate,
    BooleanFromString,
    ArrayFirst,
    ArrayJoin,
    Conditional,
    NestedLookup,
    UuidFromBytes,
    UuidFromString,
    ExtractSecondaryMail,
    ExtractEmailSecondary,
    PreferredBusinessPhone,
    BuildAccountId,
    ExtensionDeploymentStatus,
    BuildExtraInfo,
    BuildGroupExtraInfo,
    BuildRoleExtraInfo,
    /// Any other name; resolves only if a custom closure was registered for it.
    Named(String),
}

impl TransformKind {
    /// All built-in kinds, in registration order.
    pub const BUILTIN: [TransformKind; 24] = [
        TransformKind::Lowercase,
        TransformKind::Uppercase,
        TransformKind::Trim,
        TransformKind::ExtractDomain,
        TransformKind::Coalesce,
        TransformKind::DefaultIfNull,
        TransformKind::Concat,
        TransformKind::Split,
        TransformKind::ParseIsoDate,
        TransformKind::BooleanFromString,
        TransformKind::ArrayFirst,
        TransformKind::ArrayJoin,
        TransformKind::Conditional,
        TransformKind::NestedLookup,
        TransformKind::UuidFromBytes,
        TransformKind::UuidFromString,
        TransformKind::ExtractSecondaryMail,
        TransformKind::ExtractEmailSecondary,
        TransformKind::PreferredBusinessPhone,
        TransformKind::BuildAccountId,
        TransformKind::ExtensionDeploymentStatus,
        TransformKind::BuildExtraInfo,
        TransformKind::BuildGroupExtraInfo,
        TransformKind::BuildRoleExtraInfo,
    ];

    /// Resolve a transform name.
    pub fn from_name(name: &str) -> Self {
        let lowered = name.trim().to_lowercase();
        if let Some(kind) = Self::builtin_named(&lowered) {
            return kind;
        }
        let snake = name.trim().to_case(Case::Snake);
        Self::builtin_named(&snake).unwrap_or(TransformKind::Named(snake))
    }

    fn builtin_named(normalized: &str) -> Option<Self> {
        let kind = match normalized {
            "lowercase" => TransformKind::Lowercase,
            "uppercase" => TransformKind::Uppercase,
            "trim" => TransformKind::Trim,
            "extract_domain" => TransformKind::ExtractDomain,
            "coalesce" => TransformKind::Coalesce,
            "default_if_null" => TransformKind::DefaultIfNull,
            "concat" => TransformKind::Concat,
            "split" => TransformKind::Split,
            "parse_iso_date" => TransformKind::ParseIsoDate,
            "boolean_from_string" => TransformKind::BooleanFromString,
            "array_first" => TransformKind::ArrayFirst,
            "array_join" => TransformKind::ArrayJoin,
            "conditional" => TransformKind::Conditional,
            "nested_lookup" => TransformKind::NestedLookup,
            "uuid_from_bytes" => TransformKind::UuidFromBytes,
            "uuid_from_string" => TransformKind::UuidFromString,
            "extract_secondary_mail" => TransformKind::ExtractSecondaryMail,
            "extract_email_secondary" => TransformKind::ExtractEmailSecondary,
            "preferred_business_phone" => TransformKind::PreferredBusinessPhone,
            "build_account_id" => TransformKind::BuildAccountId,
            "extension_deployment_status" => TransformKind::ExtensionDeploymentStatus,
            "build_extra_info" => TransformKind::BuildExtraInfo,
            "build_group_extra_info" => TransformKind::BuildGroupExtraInfo,
            "build_role_extra_info" => TransformKind::BuildRoleExtraInfo,
            _ => return None,
        };
        Some(kind)
    }

    /// Canonical snake_case name.
    pub fn name(&self) -> &str {
        match self {
            TransformKind::Lowercase => "lowercase",
            TransformKind::Uppercase => "uppercase",
            TransformKind::Trim => "trim",
            TransformKind::ExtractDomain => "extract_domain",
            TransformKind::Coalesce => "coalesce",
            TransformKind::DefaultIfNull => "default_if_null",
            TransformKind::Concat => "concat",
            TransformKind::Split => "split",
            TransformKind::ParseIsoDate => "parse_iso_date",
            TransformKind::BooleanFromString => "boolean_from_string",
            TransformKind::ArrayFirst => "array_first",
            TransformKind::ArrayJoin => "array_join",
            TransformKind::Conditional => "conditional",
            TransformKind::NestedLookup => "nested_lookup",
            TransformKind::UuidFromBytes => "uuid_from_bytes",
            TransformKind::UuidFromString => "uuid_from_string",
            TransformKind::ExtractSecondaryMail => "extract_secondary_mail",
            TransformKind::ExtractEmailSecondary => "extract_email_secondary",
            TransformKind::PreferredBusinessPhone => "preferred_business_phone",
            TransformKind::BuildAccountId => "build_account_id",
            TransformKind::ExtensionDeploymentStatus => "extension_deployment_status",
            TransformKind::BuildExtraInfo => "build_extra_info",
            TransformKind::BuildGroupExtraInfo => "build_group_extra_info",
            TransformKind::BuildRoleExtraInfo => "build_role_extra_info",
            TransformKind::Named(name) => name,
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Trait for transformation functions
///
/// A transform receives the extracted value (`Value::Null` when absent), the
/// rule's argument object (`Value::Null` when the rule has none) and the
/// merged extraction context.
pub trait TransformFn: Send + Sync {
    /// Execute the transformation
    ///
    /// # Returns
    ///
    /// * `Ok(Value::Null)` - No value
    /// * `Ok(value)` - Transformed value
    /// * `Err(TransformError)` - Execution failed; the caller keeps the input value
    fn execute(&self, value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError>;
}

/// Simple function-based implementation of TransformFn
impl<F> TransformFn for F
where
    F: Fn(&Value, &Value, &ExtractionContext) -> Result<Value, TransformError> + Send + Sync,
{
    fn execute(&self, value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
        self(value, args, context)
    }
}

/// Registry of transformation functions keyed by [`TransformKind`]
pub struct TransformRegistry {
    transforms: HashMap<TransformKind, Box<dyn TransformFn>>,
}

impl TransformRegistry {
    /// Create a registry with no transforms (every name passes through).
    pub fn empty() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// Create a registry holding every built-in transform.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for kind in TransformKind::BUILTIN.iter() {
            registry.register_kind(kind.clone(), transforms::builtin(kind));
        }
        registry
    }

    /// Register a transformation function under a name
    ///
    /// Registering a built-in name replaces the built-in.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use entity_fabric::transform_registry::{TransformRegistry, TransformFn};
    ///
    /// let mut registry = TransformRegistry::new();
    /// registry.register("reverse", Box::new(|value: &Value, _: &Value, _: &ExtractionContext| {
    ///     Ok(value.as_str().map(|s| Value::String(s.chars().rev().collect())).unwrap_or(Value::Null))
    /// }));
    /// ```
    pub fn register(&mut self, name: &str, func: Box<dyn TransformFn>) {
        self.register_kind(TransformKind::from_name(name), func);
    }

    fn register_kind(&mut self, kind: TransformKind, func: Box<dyn TransformFn>) {
        self.transforms.insert(kind, func);
    }

    /// Apply a transform by name.
    ///
    /// # Arguments
    ///
    /// * `name` - Transform name from the mapping rule
    /// * `value` - Extracted value (`Value::Null` when nothing was extracted)
    /// * `args` - Rule arguments (`Value::Null` when absent)
    /// * `context` - Merged extraction context
    ///
    /// # Returns
    ///
    /// The transformed value, or `value` unchanged when the name is unknown or
    /// the transform fails.
    pub fn apply(&self, name: &str, value: Value, args: &Value, context: &ExtractionContext) -> Value {
        if name.trim().is_empty() {
            return value;
        }
        self.apply_kind(&TransformKind::from_name(name), value, args, context)
    }

    /// Apply an already-resolved transform kind. Same contract as [`apply`](Self::apply).
    pub fn apply_kind(&self, kind: &TransformKind, value: Value, args: &Value, context: &ExtractionContext) -> Value {
        let Some(transform) = self.transforms.get(kind) else {
            tracing::warn!("Unknown transform function: {}", kind);
            return value;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| transform.execute(&value, args, context)));
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!("Error applying transform '{}': {}", kind, e);
                value
            }
            Err(_) => {
                tracing::error!("Transform '{}' panicked; keeping original value", kind);
                value
            }
        }
    }

    /// Check if a transform is registered
    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(&TransformKind::from_name(name))
    }

    /// Get list of all registered transform names
    pub fn list_transforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transforms.keys().map(|k| k.name().to_string()).collect();
        names.sort();
        names
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_apply_custom_transform() {
        let mut registry = TransformRegistry::new();

        registry.register("reverse", Box::new(|value: &Value, _args: &Value, _ctx: &ExtractionContext| {
            let text = value
                .as_str()
                .ok_or_else(|| TransformError::InvalidInput("expected text".to_string()))?;
            Ok(Value::String(text.chars().rev().collect()))
        }) as Box<dyn TransformFn>);

        let result = registry.apply("reverse", json!("abc"), &Value::Null, &ExtractionContext::default());
        assert_eq!(result, json!("cba"));
    }

    #[test]
    fn test_unknown_transform_passes_value_through() {
        let registry = TransformRegistry::new();
        let result = registry.apply("does_not_exist", json!("Keep Me"), &Value::Null, &ExtractionContext::default());
        assert_eq!(result, json!("Keep Me"));
    }

    #[test]
    fn test_failing_transform_returns_original_value() {
        let mut registry = TransformRegistry::empty();
        registry.register("boom", Box::new(|_: &Value, _: &Value, _: &ExtractionContext| {
            Err(TransformError::ExecutionError("boom".to_string()))
        }) as Box<dyn TransformFn>);

        let result = registry.apply("boom", json!(42), &Value::Null, &ExtractionContext::default());
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_panicking_transform_returns_original_value() {
        let mut registry = TransformRegistry::empty();
        registry.register("panics", Box::new(|_: &Value, _: &Value, _: &ExtractionContext| -> Result<Value, TransformError> {
            panic!("transform bug")
        }) as Box<dyn TransformFn>);

        let result = registry.apply("panics", json!("x"), &Value::Null, &ExtractionContext::default());
        assert_eq!(result, json!("x"));
    }

    #[test]
    fn test_names_match_case_insensitively() {
        assert_eq!(TransformKind::from_name("LOWERCASE"), TransformKind::Lowercase);
        assert_eq!(TransformKind::from_name("parseIsoDate"), TransformKind::ParseIsoDate);
        assert_eq!(TransformKind::from_name("Build_Account_Id"), TransformKind::BuildAccountId);

        let registry = TransformRegistry::new();
        assert_eq!(registry.apply("UpperCase", json!("abc"), &Value::Null, &ExtractionContext::default()), json!("ABC"));
    }

    #[test]
    fn test_has_transform() {
        let registry = TransformRegistry::new();
        assert!(registry.has_transform("uuid_from_bytes"));
        assert!(!registry.has_transform("other_fn"));
        assert_eq!(registry.list_transforms().len(), TransformKind::BUILTIN.len());
    }

    #[test]
    fn test_blank_name_is_noop() {
        let registry = TransformRegistry::new();
        assert_eq!(registry.apply("  ", json!("v"), &Value::Null, &ExtractionContext::default()), json!("v"));
    }
}
