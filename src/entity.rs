//! Canonical entity model.
//!
//! Every vendor payload is reduced to the records in this module: one tenant,
//! instance, application, account and user per message, lists of departments,
//! office locations, groups and roles, and the four user junction links. The
//! identifiers carried here are provisional until the store confirms them
//! (see [`crate::ingestion`]).

use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Application id of Microsoft Entra ID.
pub const MICROSOFT_APP_ID: &str = "ee1b3219-7159-43f0-a5e0-8869de7bc4cd";
pub const MICROSOFT_APP_NAME: &str = "Microsoft Entra ID";

/// A typed field value produced by data-type coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Double(f64),
    Bool(bool),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    List(Vec<String>),
    Json(Value),
}

impl FieldValue {
    /// JSON form used when the value is fed back into transforms or logged.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Uuid(u) => Value::String(u.to_string()),
            FieldValue::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            FieldValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            FieldValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Error type for entity assembly
#[derive(Debug, Clone)]
pub enum EntityError {
    RequiredFieldMissing {
        entity: &'static str,
        field: String,
    },
    InvalidFieldValue {
        entity: &'static str,
        field: String,
        reason: String,
    },
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityError::RequiredFieldMissing { entity, field } => {
                write!(f, "Required field '{}.{}' is missing or empty", entity, field)
            }
            EntityError::InvalidFieldValue { entity, field, reason } => {
                write!(f, "Invalid value for '{}.{}': {}", entity, field, reason)
            }
        }
    }
}

impl std::error::Error for EntityError {}

/// Resolved field values for one target record, keyed by target field name
/// (camelCase, as written in mapping rules), in rule order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValues(IndexMap<String, FieldValue>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a field; a later assignment for the same name overwrites.
    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Non-blank text for a field. Scalars are rendered as text.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            FieldValue::Text(s) if s.trim().is_empty() => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Json(Value::String(s)) => Some(s.clone()),
            FieldValue::Json(_) | FieldValue::List(_) => None,
            other => Some(other.to_string()),
        }
    }

    pub fn boolean(&self, field: &str) -> Option<bool> {
        match self.get(field)? {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => parse_bool(s),
            FieldValue::Integer(i) => Some(*i != 0),
            FieldValue::Json(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.get(field)? {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn uuid(&self, field: &str) -> Option<Uuid> {
        match self.get(field)? {
            FieldValue::Uuid(u) => Some(*u),
            FieldValue::Text(s) => Uuid::parse_str(s.trim()).ok(),
            FieldValue::Json(Value::String(s)) => Uuid::parse_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.get(field)? {
            FieldValue::Timestamp(ts) => Some(*ts),
            FieldValue::Date(d) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()),
            FieldValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        match self.get(field)? {
            FieldValue::Date(d) => Some(*d),
            FieldValue::Timestamp(ts) => Some(ts.date_naive()),
            FieldValue::Text(s) => s
                .get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()),
            _ => None,
        }
    }

    pub fn list(&self, field: &str) -> Option<Vec<String>> {
        match self.get(field)? {
            FieldValue::List(items) => Some(items.clone()),
            FieldValue::Json(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| crate::extraction::as_text(v))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// JSON object for a field, used for `extraInfo` bags.
    pub fn object(&self, field: &str) -> Option<Map<String, Value>> {
        match self.get(field)?.to_json() {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Required text field; the error names the entity for the log line.
    pub fn require_text(&self, entity: &'static str, field: &str) -> Result<String, EntityError> {
        self.text(field).ok_or_else(|| EntityError::RequiredFieldMissing {
            entity,
            field: field.to_string(),
        })
    }

    pub fn require_uuid(&self, entity: &'static str, field: &str) -> Result<Uuid, EntityError> {
        match self.get(field) {
            None => Err(EntityError::RequiredFieldMissing {
                entity,
                field: field.to_string(),
            }),
            Some(value) => self.uuid(field).ok_or_else(|| EntityError::InvalidFieldValue {
                entity,
                field: field.to_string(),
                reason: format!("'{}' is not a UUID", value),
            }),
        }
    }
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Core trait for canonical entities.
pub trait Entity: Serialize + Sized {
    /// Target entity name used by mapping rules (snake_case)
    const NAME: &'static str;

    /// Convert entity to JSON string
    fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Convert entity to pretty-printed JSON string
    fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub tenant_id: Uuid,
    /// Tenant identifier as received, before it was typed
    pub id: Option<String>,
    pub name: Option<String>,
    pub subscriber_id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub enable_persona_via_background_tabs: Option<bool>,
    pub enable_persona_via_forced_login: Option<bool>,
    pub extension_enabled: Option<bool>,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for Tenant {
    const NAME: &'static str = "tenant";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: Uuid,
    pub tenant_id: Uuid,
    pub app_id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for Instance {
    const NAME: &'static str = "instance";
}

/// Application catalogue entry, keyed globally by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: Uuid,
    pub domain: Option<String>,
    pub new_app: bool,
    pub global_sync_allowed: bool,
}

impl Entity for Application {
    const NAME: &'static str = "application";
}

/// A user's account in one application, keyed by `(id, tenant_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub tenant_id: Uuid,
    pub email: Option<String>,
    pub app_name: Option<String>,
    pub app_id: Option<Uuid>,
    pub microsoft_id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
}

impl Entity for Account {
    const NAME: &'static str = "account";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub instance_id: Option<Uuid>,
    /// Vendor-native user id
    pub id: String,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
    pub mobile_phone: Option<String>,
    pub job_title: Option<String>,
    pub employee_type: Option<String>,
    pub employee_hire_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    pub account_enabled: Option<bool>,
    pub user_suspended: Option<bool>,
    pub user_archived: Option<bool>,
    pub user_type: Option<String>,
    pub user_is_admin: Option<bool>,
    pub user_delegation_admin: Option<bool>,
    pub user_ip_whitelisted: Option<bool>,
    pub extension_enabled: Option<bool>,
    pub extension_deployment_status: Option<String>,
    pub user_creation_time: Option<DateTime<Utc>>,
    pub user_last_login_time: Option<DateTime<Utc>>,
    pub profile_pic_url: Option<String>,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for User {
    const NAME: &'static str = "user";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub department_id: Uuid,
    pub tenant_id: Uuid,
    /// Natural key (the department name as sent by the vendor)
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for Department {
    const NAME: &'static str = "department";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficeLocation {
    pub office_location_id: Uuid,
    pub tenant_id: Uuid,
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for OfficeLocation {
    const NAME: &'static str = "office_location";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: Uuid,
    pub tenant_id: Uuid,
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub mail: Option<String>,
    pub mail_enabled: Option<bool>,
    pub mail_nickname: Option<String>,
    pub security_enabled: Option<bool>,
    pub group_types: Vec<String>,
    pub visibility: Option<String>,
    pub classification: Option<String>,
    pub membership_rule: Option<String>,
    pub membership_rule_processing_state: Option<String>,
    pub preferred_data_location: Option<String>,
    pub preferred_language: Option<String>,
    pub theme: Option<String>,
    pub unique_name: Option<String>,
    pub is_assignable_to_role: Option<bool>,
    pub created_date_time: Option<DateTime<Utc>>,
    pub renewed_date_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for Group {
    const NAME: &'static str = "group";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: Uuid,
    pub tenant_id: Uuid,
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub is_built_in: Option<bool>,
    pub is_enabled: Option<bool>,
    pub is_privileged: Option<bool>,
    pub role_template_id: Option<String>,
    pub assignment_type: Option<String>,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

impl Entity for Role {
    const NAME: &'static str = "role";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDepartmentLink {
    pub user_id: Uuid,
    pub department_id: Uuid,
    pub tenant_id: Uuid,
    pub is_primary: bool,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOfficeLocationLink {
    pub user_id: Uuid,
    pub office_location_id: Uuid,
    pub tenant_id: Uuid,
    pub is_primary: bool,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroupLink {
    pub user_id: Uuid,
    pub group_id: Uuid,
    pub tenant_id: Uuid,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleLink {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub tenant_id: Uuid,
    pub assignment_type: Option<String>,
    pub is_active: bool,
    pub extra_info: Map<String, Value>,
}

/// The canonical output unit for one raw message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedEntityGraph {
    pub tenant: Option<Tenant>,
    pub instance: Option<Instance>,
    pub application: Option<Application>,
    pub account: Option<Account>,
    pub user: Option<User>,
    pub departments: Vec<Department>,
    pub office_locations: Vec<OfficeLocation>,
    pub groups: Vec<Group>,
    pub roles: Vec<Role>,
    pub user_departments: Vec<UserDepartmentLink>,
    pub user_office_locations: Vec<UserOfficeLocationLink>,
    pub user_groups: Vec<UserGroupLink>,
    pub user_roles: Vec<UserRoleLink>,
    /// Transformer bookkeeping (version, source system, entity counts)
    pub metadata: Map<String, Value>,
}

impl TransformedEntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the four junction-link lists from the user and the entity lists
    /// already in the graph. Existing links are replaced.
    pub fn link_user(&mut self) {
        self.user_departments.clear();
        self.user_office_locations.clear();
        self.user_groups.clear();
        self.user_roles.clear();

        let Some(user) = &self.user else {
            return;
        };
        let (user_id, tenant_id) = (user.user_id, user.tenant_id);

        self.user_departments = self
            .departments
            .iter()
            .map(|d| UserDepartmentLink {
                user_id,
                department_id: d.department_id,
                tenant_id,
                is_primary: true,
                is_active: true,
                extra_info: Map::new(),
            })
            .collect();
        self.user_office_locations = self
            .office_locations
            .iter()
            .map(|o| UserOfficeLocationLink {
                user_id,
                office_location_id: o.office_location_id,
                tenant_id,
                is_primary: true,
                is_active: true,
                extra_info: Map::new(),
            })
            .collect();
        self.user_groups = self
            .groups
            .iter()
            .map(|g| UserGroupLink {
                user_id,
                group_id: g.group_id,
                tenant_id,
                is_active: true,
                extra_info: Map::new(),
            })
            .collect();
        self.user_roles = self
            .roles
            .iter()
            .map(|r| UserRoleLink {
                user_id,
                role_id: r.role_id,
                tenant_id,
                assignment_type: r.assignment_type.clone(),
                is_active: true,
                extra_info: Map::new(),
            })
            .collect();
    }

    /// Total number of entity records (links included).
    pub fn entity_count(&self) -> usize {
        [
            self.tenant.is_some(),
            self.instance.is_some(),
            self.application.is_some(),
            self.account.is_some(),
            self.user.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
            + self.departments.len()
            + self.office_locations.len()
            + self.groups.len()
            + self.roles.len()
            + self.link_count()
    }

    pub fn link_count(&self) -> usize {
        self.user_departments.len()
            + self.user_office_locations.len()
            + self.user_groups.len()
            + self.user_roles.len()
    }

    /// One-line summary for log output.
    pub fn summary(&self) -> String {
        format!(
            "tenant={} user={} departments={} offices={} groups={} roles={} links={}",
            self.tenant.as_ref().map(|t| t.tenant_id.to_string()).unwrap_or_else(|| "-".to_string()),
            self.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
            self.departments.len(),
            self.office_locations.len(),
            self.groups.len(),
            self.roles.len(),
            self.link_count()
        )
    }
}
