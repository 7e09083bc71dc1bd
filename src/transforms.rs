//! Built-in transform functions.
//!
//! Each function takes the extracted value, the rule arguments and the merged
//! context and is total over its input: inputs it does not handle
//! produce `Value::Null` or the value unchanged, never a panic.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::extraction::{as_text, lookup};
use crate::ids::name_uuid;
use crate::mapping::rule::parse_date;
use crate::runtime::ExtractionContext;
use crate::transform_registry::{TransformError, TransformFn, TransformKind};

/// Status given to users the browser extension should be rolled out to.
pub const READY_TO_DEPLOY: &str = "Ready to Deploy";
/// Status for everyone else.
pub const EXCLUDED: &str = "Excluded";

/// Closure backing a built-in transform kind.
pub(crate) fn builtin(kind: &TransformKind) -> Box<dyn TransformFn> {
    match kind {
        TransformKind::Lowercase => value_only(|v| map_text(v, |s| s.to_lowercase())),
        TransformKind::Uppercase => value_only(|v| map_text(v, |s| s.to_uppercase())),
        TransformKind::Trim => value_only(|v| map_text(v, |s| s.trim().to_string())),
        TransformKind::ExtractDomain => value_only(extract_domain),
        TransformKind::Coalesce => Box::new(coalesce),
        TransformKind::DefaultIfNull => Box::new(default_if_null),
        TransformKind::Concat => Box::new(concat),
        TransformKind::Split => Box::new(split),
        TransformKind::ParseIsoDate => value_only(parse_iso_date),
        TransformKind::BooleanFromString => value_only(boolean_from_string),
        TransformKind::ArrayFirst => value_only(array_first),
        TransformKind::ArrayJoin => Box::new(array_join),
        TransformKind::Conditional => Box::new(conditional),
        TransformKind::NestedLookup => Box::new(nested_lookup),
        TransformKind::UuidFromBytes => Box::new(uuid_from_bytes),
        TransformKind::UuidFromString => Box::new(uuid_from_string),
        TransformKind::ExtractSecondaryMail => context_only(|ctx| opt_string(secondary_mails(ctx).0)),
        TransformKind::ExtractEmailSecondary => context_only(|ctx| opt_string(secondary_mails(ctx).1)),
        TransformKind::PreferredBusinessPhone => value_only(preferred_business_phone),
        TransformKind::BuildAccountId => Box::new(build_account_id),
        TransformKind::ExtensionDeploymentStatus => Box::new(extension_deployment_status),
        // extra-info bags are assembled by the strategies; the rule keeps the source value
        TransformKind::BuildExtraInfo
        | TransformKind::BuildGroupExtraInfo
        | TransformKind::BuildRoleExtraInfo
        | TransformKind::Named(_) => value_only(Value::clone),
    }
}

fn value_only(f: fn(&Value) -> Value) -> Box<dyn TransformFn> {
    Box::new(move |value: &Value, _args: &Value, _ctx: &ExtractionContext| -> Result<Value, TransformError> {
        Ok(f(value))
    })
}

fn context_only(f: fn(&ExtractionContext) -> Value) -> Box<dyn TransformFn> {
    Box::new(move |_value: &Value, _args: &Value, ctx: &ExtractionContext| -> Result<Value, TransformError> {
        Ok(f(ctx))
    })
}

fn opt_string(s: Option<String>) -> Value {
    s.map(Value::String).unwrap_or(Value::Null)
}

fn map_text(value: &Value, f: impl Fn(&str) -> String) -> Value {
    opt_string(as_text(value).map(|s| f(&s)))
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn arg_fields(args: &Value) -> Result<Vec<String>, TransformError> {
    match args.get("fields") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.iter().filter_map(as_text).collect()),
        Some(Value::String(single)) => Ok(vec![single.clone()]),
        Some(other) => Err(TransformError::InvalidArgs(format!(
            "'fields' must be a list, got {}",
            other
        ))),
    }
}

/// Value at `path` in the context; a bare name reads a root key.
fn from_context<'a>(context: &'a ExtractionContext, path: &str) -> Option<&'a Value> {
    context.lookup(path)
}

fn context_text(context: &ExtractionContext, path: &str) -> Option<String> {
    from_context(context, path)
        .and_then(as_text)
        .filter(|s| !s.trim().is_empty())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

pub fn extract_domain(value: &Value) -> Value {
    let Some(email) = as_text(value) else {
        return Value::Null;
    };
    match email.split('@').nth(1) {
        Some(domain) => Value::String(domain.to_string()),
        None => Value::Null,
    }
}

pub fn coalesce(value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    if !is_blank(value) {
        return Ok(value.clone());
    }
    for field in arg_fields(args)? {
        if let Some(found) = from_context(context, &field) {
            if !is_blank(found) {
                return Ok(found.clone());
            }
        }
    }
    Ok(Value::Null)
}

/// Like [`coalesce`], then falls back to the literal `args.default`.
pub fn default_if_null(value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    let found = coalesce(value, args, context)?;
    if !found.is_null() {
        return Ok(found);
    }
    Ok(args
        .get("default")
        .and_then(as_text)
        .map(Value::String)
        .unwrap_or(Value::Null))
}

pub fn concat(value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    let fields = arg_fields(args)?;
    if fields.is_empty() {
        return Ok(value.clone());
    }
    let separator = arg_str(args, "separator").unwrap_or("");
    let lowercase = args.get("lowercase").and_then(Value::as_bool).unwrap_or(false);

    let parts: Vec<String> = fields
        .iter()
        .filter_map(|f| from_context(context, f).and_then(as_text))
        .collect();
    let joined = parts.join(separator);
    Ok(Value::String(if lowercase { joined.to_lowercase() } else { joined }))
}

pub fn split(value: &Value, args: &Value, _context: &ExtractionContext) -> Result<Value, TransformError> {
    let Some(text) = as_text(value) else {
        return Ok(Value::Null);
    };
    let delimiter = arg_str(args, "delimiter").unwrap_or(",");
    if delimiter.is_empty() {
        return Err(TransformError::InvalidArgs("empty delimiter".to_string()));
    }
    let index = match args.get("index") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| TransformError::InvalidArgs("'index' must be an integer".to_string()))?,
    };
    if index < 0 {
        return Ok(Value::Null);
    }
    Ok(opt_string(text.split(delimiter).nth(index as usize).map(str::to_string)))
}

/// Full timestamp (RFC 3339, UTC output), else a date from the first ten
/// characters, else null.
pub fn parse_iso_date(value: &Value) -> Value {
    let Some(text) = as_text(value).filter(|s| !s.trim().is_empty()) else {
        return Value::Null;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(text.trim()) {
        let utc: DateTime<Utc> = ts.with_timezone(&Utc);
        return Value::String(utc.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true));
    }
    match parse_date(&text) {
        Some(date) => Value::String(date.format("%Y-%m-%d").to_string()),
        None => {
            tracing::warn!("Failed to parse date: {}", text);
            Value::Null
        }
    }
}

pub fn boolean_from_string(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        other => {
            let text = as_text(other).unwrap_or_default().to_lowercase();
            Value::Bool(matches!(text.trim(), "true" | "1" | "yes"))
        }
    }
}

pub fn array_first(value: &Value) -> Value {
    match value {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

pub fn array_join(value: &Value, args: &Value, _context: &ExtractionContext) -> Result<Value, TransformError> {
    let separator = arg_str(args, "separator").unwrap_or(",");
    Ok(match value {
        Value::Null => Value::Null,
        Value::Array(items) => Value::String(
            items
                .iter()
                .filter_map(as_text)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        other => opt_string(as_text(other)),
    })
}

/// `equals`/`then`/`else` on the textual form of the value.
pub fn conditional(value: &Value, args: &Value, _context: &ExtractionContext) -> Result<Value, TransformError> {
    let Some(expected) = args.get("equals").and_then(as_text) else {
        return Ok(value.clone());
    };
    let matches = as_text(value).map(|s| s == expected).unwrap_or(false);
    let branch = if matches { "then" } else { "else" };
    Ok(match args.get(branch).and_then(as_text) {
        Some(result) => Value::String(result),
        None => value.clone(),
    })
}

pub fn nested_lookup(value: &Value, args: &Value, _context: &ExtractionContext) -> Result<Value, TransformError> {
    let Some(path) = arg_str(args, "path") else {
        return Ok(Value::Null);
    };
    if !value.is_object() {
        return Ok(Value::Null);
    }
    Ok(lookup(value, path).cloned().unwrap_or(Value::Null))
}

/// Deterministic identifier from `prefix` plus the values of `args.fields`,
/// joined with `:`. Inside an array element context, bare field names are
/// read from `_element` first. Without `fields` the identifier is random.
pub fn uuid_from_bytes(_value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    let fields = arg_fields(args)?;
    if fields.is_empty() && args.get("fields").is_none() {
        return Ok(Value::String(Uuid::new_v4().to_string()));
    }

    let mut parts: Vec<String> = Vec::with_capacity(fields.len() + 1);
    if let Some(prefix) = arg_str(args, "prefix").filter(|p| !p.is_empty()) {
        parts.push(prefix.to_string());
    }

    let element = context.element().filter(|e| !e.is_null());
    for field in &fields {
        let from_element = element
            .filter(|_| !field.contains('.'))
            .and_then(|e| e.get(field.as_str()))
            .and_then(as_text);
        if let Some(found) = from_element.or_else(|| from_context(context, field).and_then(as_text)) {
            parts.push(found);
        }
    }

    Ok(Value::String(name_uuid(&parts.join(":")).to_string()))
}

pub fn uuid_from_string(value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    if let Some(text) = as_text(value).filter(|s| !s.trim().is_empty()) {
        match Uuid::parse_str(text.trim()) {
            Ok(id) => return Ok(Value::String(id.to_string())),
            Err(_) => tracing::warn!("Failed to parse UUID from: {}", text),
        }
    }
    if let Some(field) = arg_str(args, "field") {
        if let Some(text) = context_text(context, field) {
            return match Uuid::parse_str(text.trim()) {
                Ok(id) => Ok(Value::String(id.to_string())),
                Err(_) => {
                    tracing::warn!("Failed to parse UUID from field {}: {}", field, text);
                    Ok(Value::Null)
                }
            };
        }
    }
    Ok(Value::Null)
}

/// Split `data.otherMails` into the first address on the primary mail's
/// domain and the first address on any other domain, both lowercased.
pub fn secondary_mails(context: &ExtractionContext) -> (Option<String>, Option<String>) {
    let primary = context_text(context, "data.mail");
    match from_context(context, "data.otherMails") {
        Some(Value::Array(mails)) => {
            let mails: Vec<String> = mails.iter().filter_map(as_text).collect();
            partition_mails(primary.as_deref(), &mails)
        }
        _ => (None, None),
    }
}

/// First same-domain and first other-domain address, lowercased. Entries
/// without an `@` are ignored.
pub fn partition_mails(primary: Option<&str>, mails: &[String]) -> (Option<String>, Option<String>) {
    let primary_domain = primary.and_then(|m| m.split('@').nth(1)).map(str::to_lowercase);

    let mut matching = None;
    let mut other = None;
    for mail in mails {
        let Some(domain) = mail.split('@').nth(1).map(str::to_lowercase) else {
            continue;
        };
        let same = primary_domain.as_deref() == Some(domain.as_str());
        if same && matching.is_none() {
            matching = Some(mail.to_lowercase());
        } else if !same && other.is_none() {
            other = Some(mail.to_lowercase());
        }
    }
    (matching, other)
}

pub fn preferred_business_phone(value: &Value) -> Value {
    match value {
        Value::Array(phones) => opt_string(
            phones
                .iter()
                .filter_map(as_text)
                .find(|p| !p.trim().is_empty()),
        ),
        _ => Value::Null,
    }
}

/// `lower(mail | userPrincipalName | id | "unknown") + "_" + appId`
pub fn build_account_id(_value: &Value, args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    let identifier = context_text(context, "data.mail")
        .or_else(|| context_text(context, "data.userPrincipalName"))
        .or_else(|| context_text(context, "data.id"))
        .unwrap_or_else(|| "unknown".to_string());
    let app_id = args
        .get("appId")
        .and_then(as_text)
        .unwrap_or_else(|| "default".to_string());
    Ok(Value::String(account_id(&identifier, &app_id)))
}

/// Account identifier for a user identifier and application id.
pub fn account_id(identifier: &str, app_id: &str) -> String {
    format!("{}_{}", identifier.to_lowercase(), app_id)
}

pub fn extension_deployment_status(value: &Value, _args: &Value, context: &ExtractionContext) -> Result<Value, TransformError> {
    let enabled = match value {
        Value::Bool(b) => Some(*b),
        Value::Null => None,
        other => match as_text(other).unwrap_or_default().trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
    };
    let user_type = context_text(context, "data.userType");
    Ok(Value::String(deployment_status(enabled, user_type.as_deref()).to_string()))
}

/// "Ready to Deploy" iff the account is enabled and the user is not a guest.
pub fn deployment_status(account_enabled: Option<bool>, user_type: Option<&str>) -> &'static str {
    let is_guest = user_type.map(|t| t.eq_ignore_ascii_case("guest")).unwrap_or(false);
    match account_enabled {
        Some(true) if !is_guest => READY_TO_DEPLOY,
        _ => EXCLUDED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform_registry::TransformRegistry;
    use serde_json::json;

    fn ctx() -> ExtractionContext {
        ExtractionContext::from_document(json!({
            "tenant": "T1",
            "data": {
                "id": "U1",
                "mail": "Alice@Contoso.com",
                "userPrincipalName": "alice@contoso.onmicrosoft.com",
                "userType": "Member",
                "otherMails": ["ALT@contoso.com", "alice@gmail.com", "no-at-sign"],
                "manager": {"id": "M1", "displayName": "Bob"}
            }
        }))
    }

    fn apply(name: &str, value: Value, args: Value) -> Value {
        TransformRegistry::new().apply(name, value, &args, &ctx())
    }

    #[test]
    fn test_string_ops() {
        assert_eq!(apply("lowercase", json!("AbC"), Value::Null), json!("abc"));
        assert_eq!(apply("uppercase", json!(12), Value::Null), json!("12"));
        assert_eq!(apply("trim", json!("  x "), Value::Null), json!("x"));
        assert_eq!(apply("lowercase", Value::Null, Value::Null), Value::Null);
        assert_eq!(apply("extract_domain", json!("a@x.com"), Value::Null), json!("x.com"));
        assert_eq!(apply("extract_domain", json!("nodomain"), Value::Null), Value::Null);
    }

    #[test]
    fn test_coalesce_and_default_if_null() {
        let args = json!({"fields": ["data.missing", "data.userPrincipalName"]});
        assert_eq!(apply("coalesce", json!(""), args.clone()), json!("alice@contoso.onmicrosoft.com"));
        assert_eq!(apply("coalesce", json!("kept"), args), json!("kept"));
        assert_eq!(
            apply("default_if_null", Value::Null, json!({"default": "fallback"})),
            json!("fallback")
        );
    }

    #[test]
    fn test_concat_and_split() {
        let args = json!({"fields": ["tenant", "data.id"], "separator": "-", "lowercase": true});
        assert_eq!(apply("concat", Value::Null, args), json!("t1-u1"));
        assert_eq!(apply("split", json!("a/b/c"), json!({"delimiter": "/", "index": 1})), json!("b"));
        assert_eq!(apply("split", json!("a,b"), json!({"index": 9})), Value::Null);
        assert_eq!(apply("split", json!("a,b"), Value::Null), json!("a"));
    }

    #[test]
    fn test_parse_iso_date() {
        assert_eq!(
            apply("parse_iso_date", json!("2024-05-06T07:08:09+02:00"), Value::Null),
            json!("2024-05-06T05:08:09Z")
        );
        assert_eq!(apply("parse_iso_date", json!("2024-05-06 garbage"), Value::Null), json!("2024-05-06"));
        assert_eq!(apply("parse_iso_date", json!("garbage"), Value::Null), Value::Null);
    }

    #[test]
    fn test_conversions_and_arrays() {
        assert_eq!(apply("boolean_from_string", json!("Yes"), Value::Null), json!(true));
        assert_eq!(apply("boolean_from_string", json!("no"), Value::Null), json!(false));
        assert_eq!(apply("array_first", json!(["a", "b"]), Value::Null), json!("a"));
        assert_eq!(apply("array_first", json!([]), Value::Null), Value::Null);
        assert_eq!(apply("array_join", json!(["a", null, "b"]), Value::Null), json!("a,b"));
        assert_eq!(apply("array_join", json!(["a", "b"]), json!({"separator": "; "})), json!("a; b"));
    }

    #[test]
    fn test_conditional_and_nested_lookup() {
        let args = json!({"equals": "Guest", "then": "external", "else": "internal"});
        assert_eq!(apply("conditional", json!("Guest"), args.clone()), json!("external"));
        assert_eq!(apply("conditional", json!("Member"), args), json!("internal"));
        assert_eq!(
            apply("nested_lookup", json!({"a": {"b": 3}}), json!({"path": "a.b"})),
            json!(3)
        );
        assert_eq!(apply("nested_lookup", json!("flat"), json!({"path": "a"})), Value::Null);
    }

    #[test]
    fn test_uuid_from_bytes_is_deterministic() {
        let args = json!({"prefix": "group", "fields": ["tenant", "id"]});
        let element_ctx = ExtractionContext::from_document(json!({"tenant": "T1"})).for_element(&json!({"id": "G1"}), 0);
        let registry = TransformRegistry::new();
        let a = registry.apply("uuid_from_bytes", Value::Null, &args, &element_ctx);
        let b = registry.apply("uuid_from_bytes", Value::Null, &args, &element_ctx);
        assert_eq!(a, b);
        assert_eq!(a, json!(name_uuid("group:T1:G1").to_string()));

        let random = apply("uuid_from_bytes", Value::Null, Value::Null);
        assert_ne!(random, apply("uuid_from_bytes", Value::Null, Value::Null));
    }

    #[test]
    fn test_uuid_from_string() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(apply("uuid_from_string", json!(id.clone()), Value::Null), json!(id));
        assert_eq!(apply("uuid_from_string", json!("bad"), json!({"field": "data.id"})), Value::Null);
    }

    #[test]
    fn test_secondary_mail_partition() {
        assert_eq!(apply("extract_secondary_mail", Value::Null, Value::Null), json!("alt@contoso.com"));
        assert_eq!(apply("extract_email_secondary", Value::Null, Value::Null), json!("alice@gmail.com"));
    }

    #[test]
    fn test_preferred_business_phone() {
        assert_eq!(apply("preferred_business_phone", json!(["", " ", "+1 555"]), Value::Null), json!("+1 555"));
        assert_eq!(apply("preferred_business_phone", json!([]), Value::Null), Value::Null);
    }

    #[test]
    fn test_build_account_id() {
        assert_eq!(
            apply("build_account_id", Value::Null, json!({"appId": "app"})),
            json!("alice@contoso.com_app")
        );
        let registry = TransformRegistry::new();
        let empty = registry.apply("build_account_id", Value::Null, &Value::Null, &ExtractionContext::from_document(json!({"data": {}})));
        assert_eq!(empty, json!("unknown_default"));
    }

    #[test]
    fn test_extension_deployment_status() {
        assert_eq!(apply("extension_deployment_status", json!(true), Value::Null), json!(READY_TO_DEPLOY));
        assert_eq!(apply("extension_deployment_status", json!("0"), Value::Null), json!(EXCLUDED));
        assert_eq!(apply("extension_deployment_status", Value::Null, Value::Null), json!(EXCLUDED));
        assert_eq!(deployment_status(Some(true), Some("GUEST")), EXCLUDED);
    }
}
