//! Hand-coded strategy for the Microsoft Graph user payload.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::extra_info::{group_extra_info, role_extra_info, string_list, user_extra_info};
use super::{finish_graph, EntityTransformer, TransformOutcome, TransformerError};
use crate::entity::{
    Account, Application, Department, Group, Instance, OfficeLocation, Role, Tenant,
    TransformedEntityGraph, User, MICROSOFT_APP_ID, MICROSOFT_APP_NAME,
};
use crate::extraction::as_text;
use crate::ids::{derive_id, resolve_opaque_id};
use crate::mapping::rule::{parse_date, parse_timestamp};
use crate::message::RawEntityMessage;
use crate::transforms::{account_id, deployment_status};

pub const STATIC_TRANSFORMER_VERSION: &str = "2.1-with-app-account";

fn text(node: &Value, field: &str) -> Option<String> {
    node.get(field).and_then(as_text).filter(|s| !s.trim().is_empty())
}

/// Names key derived ids, so surrounding whitespace must not leak into them.
fn trimmed(node: &Value, field: &str) -> Option<String> {
    text(node, field).map(|s| s.trim().to_string())
}

fn boolean(node: &Value, field: &str) -> Option<bool> {
    match node.get(field)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => crate::entity::parse_bool(s),
        _ => None,
    }
}

fn timestamp(node: &Value, field: &str) -> Option<DateTime<Utc>> {
    let raw = text(node, field)?;
    let parsed = parse_timestamp(&raw);
    if parsed.is_none() {
        tracing::warn!("Failed to parse timestamp {}: {}", field, raw);
    }
    parsed
}

fn date(node: &Value, field: &str) -> Option<NaiveDate> {
    let raw = text(node, field)?;
    let parsed = parse_date(&raw);
    if parsed.is_none() {
        tracing::warn!("Failed to parse date {}: {}", field, raw);
    }
    parsed
}

fn array<'a>(data: &'a Value, field: &str) -> &'a [Value] {
    match data.get(field) {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    }
}

/// Static Microsoft Graph strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct MicrosoftEntityTransformer;

impl MicrosoftEntityTransformer {
    pub fn new() -> Self {
        Self
    }

    fn tenant(message: &RawEntityMessage) -> Tenant {
        Tenant {
            tenant_id: resolve_opaque_id("tenant", message.tenant.as_deref()),
            id: message.tenant.clone(),
            name: None,
            subscriber_id: message.subscriber.clone(),
            creation_time: None,
            enable_persona_via_background_tabs: None,
            enable_persona_via_forced_login: None,
            extension_enabled: None,
            is_active: true,
            extra_info: Map::new(),
        }
    }

    fn instance(message: &RawEntityMessage, tenant_id: Uuid) -> Option<Instance> {
        let raw = message.instance_id.as_deref().filter(|s| !s.trim().is_empty())?;
        Some(Instance {
            instance_id: resolve_opaque_id("instance", Some(raw)),
            tenant_id,
            app_id: message.domain.clone(),
            creation_time: None,
            is_active: true,
            extra_info: Map::new(),
        })
    }

    fn application(message: &RawEntityMessage) -> Application {
        Application {
            id: Uuid::parse_str(MICROSOFT_APP_ID).unwrap_or_else(|_| Uuid::nil()),
            domain: message.domain.clone(),
            new_app: false,
            global_sync_allowed: false,
        }
    }

    fn user(data: &Value, tenant_id: Uuid, instance_id: Option<Uuid>) -> Option<User> {
        let Some(id) = text(data, "id") else {
            tracing::warn!("Microsoft user payload has no id");
            return None;
        };

        let mail = text(data, "mail").map(|m| m.to_lowercase());
        let user_principal_name = text(data, "userPrincipalName").map(|u| u.to_lowercase());
        let primary = mail.clone().or_else(|| user_principal_name.clone());

        let user_type = text(data, "userType");
        let account_enabled = boolean(data, "accountEnabled");
        let last_login = data
            .get("signInActivity")
            .and_then(|activity| timestamp(activity, "lastSignInDateTime"));

        let mut extra_info = user_extra_info(data, primary.as_deref());
        if let Some(phone) = string_list(data, "businessPhones")
            .into_iter()
            .find(|p| !p.trim().is_empty())
        {
            extra_info.insert("preferredBusinessPhone".to_string(), Value::String(phone));
        }

        Some(User {
            user_id: derive_id(tenant_id, "", &id),
            tenant_id,
            instance_id,
            display_name: text(data, "displayName"),
            given_name: text(data, "givenName"),
            surname: text(data, "surname"),
            mail,
            user_principal_name,
            mobile_phone: text(data, "mobilePhone"),
            job_title: text(data, "jobTitle"),
            employee_type: text(data, "employeeType"),
            employee_hire_date: date(data, "employeeHireDate"),
            termination_date: date(data, "employeeLeaveDateTime"),
            account_enabled,
            user_suspended: None,
            user_archived: None,
            extension_deployment_status: Some(
                deployment_status(account_enabled, user_type.as_deref()).to_string(),
            ),
            user_type,
            user_is_admin: None,
            user_delegation_admin: None,
            user_ip_whitelisted: None,
            extension_enabled: None,
            user_creation_time: timestamp(data, "createdDateTime"),
            user_last_login_time: last_login,
            profile_pic_url: None,
            is_active: true,
            extra_info,
            id,
        })
    }

    fn account(user: &User, application: &Application) -> Account {
        let identifier = user
            .mail
            .clone()
            .or_else(|| user.user_principal_name.clone())
            .unwrap_or_else(|| {
                tracing::warn!("Both userPrincipalName and mail are null for user: {}", user.id);
                user.id.clone()
            });

        Account {
            id: account_id(&identifier, &application.id.to_string()),
            tenant_id: user.tenant_id,
            email: user.mail.clone().or_else(|| user.user_principal_name.clone()),
            app_name: Some(MICROSOFT_APP_NAME.to_string()),
            app_id: Some(application.id),
            microsoft_id: Some(user.id.clone()),
            creation_time: user.user_creation_time,
        }
    }

    fn departments(data: &Value, tenant_id: Uuid) -> Vec<Department> {
        trimmed(data, "department")
            .map(|name| Department {
                department_id: derive_id(tenant_id, "dept", &name),
                tenant_id,
                id: name.clone(),
                name,
                is_active: true,
                extra_info: Map::new(),
            })
            .into_iter()
            .collect()
    }

    fn office_locations(data: &Value, tenant_id: Uuid) -> Vec<OfficeLocation> {
        trimmed(data, "officeLocation")
            .map(|name| OfficeLocation {
                office_location_id: derive_id(tenant_id, "office", &name),
                tenant_id,
                id: name.clone(),
                name,
                is_active: true,
                extra_info: Map::new(),
            })
            .into_iter()
            .collect()
    }

    fn groups(data: &Value, tenant_id: Uuid) -> Vec<Group> {
        let mut groups = Vec::new();
        for node in array(data, "groups") {
            let Some(id) = text(node, "id") else {
                tracing::warn!("Failed to extract group: missing id");
                continue;
            };
            groups.push(Group {
                group_id: derive_id(tenant_id, "group", &id),
                tenant_id,
                display_name: text(node, "displayName"),
                description: text(node, "description"),
                mail: text(node, "mail"),
                mail_enabled: boolean(node, "mailEnabled"),
                mail_nickname: text(node, "mailNickname"),
                security_enabled: boolean(node, "securityEnabled"),
                group_types: string_list(node, "groupTypes"),
                visibility: text(node, "visibility"),
                classification: text(node, "classification"),
                membership_rule: text(node, "membershipRule"),
                membership_rule_processing_state: text(node, "membershipRuleProcessingState"),
                preferred_data_location: text(node, "preferredDataLocation"),
                preferred_language: text(node, "preferredLanguage"),
                theme: text(node, "theme"),
                unique_name: text(node, "uniqueName"),
                is_assignable_to_role: boolean(node, "isAssignableToRole"),
                created_date_time: timestamp(node, "createdDateTime"),
                renewed_date_time: timestamp(node, "renewedDateTime"),
                is_active: true,
                extra_info: group_extra_info(node),
                id,
            });
        }
        groups
    }

    fn roles(data: &Value, tenant_id: Uuid) -> Vec<Role> {
        let mut roles = Vec::new();
        for node in array(data, "roles") {
            let Some(id) = text(node, "id") else {
                tracing::warn!("Failed to extract role: missing id");
                continue;
            };
            roles.push(Role {
                role_id: derive_id(tenant_id, "role", &id),
                tenant_id,
                display_name: text(node, "displayName"),
                description: text(node, "description"),
                is_built_in: boolean(node, "isBuiltIn"),
                is_enabled: boolean(node, "isEnabled"),
                is_privileged: boolean(node, "isPrivileged"),
                role_template_id: text(node, "roleTemplateId"),
                assignment_type: text(node, "assignmentType"),
                is_active: true,
                extra_info: role_extra_info(node),
                id,
            });
        }
        roles
    }
}

impl EntityTransformer for MicrosoftEntityTransformer {
    fn name(&self) -> &'static str {
        "MicrosoftEntityTransformer"
    }

    fn transform_users(&self, message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError> {
        tracing::debug!("Transforming Microsoft user entity");

        let data = &message.data;
        if !data.is_object() {
            return Ok(TransformOutcome::InvalidInput(
                "Microsoft users payload must be a JSON object".to_string(),
            ));
        }

        let tenant = Self::tenant(message);
        let tenant_id = tenant.tenant_id;
        let instance = Self::instance(message, tenant_id);
        let application = Self::application(message);

        let Some(user) = Self::user(data, tenant_id, instance.as_ref().map(|i| i.instance_id)) else {
            return Ok(TransformOutcome::InvalidInput(
                "Microsoft user payload has no id".to_string(),
            ));
        };
        let account = Self::account(&user, &application);

        let mut graph = TransformedEntityGraph {
            departments: Self::departments(data, tenant_id),
            office_locations: Self::office_locations(data, tenant_id),
            groups: Self::groups(data, tenant_id),
            roles: Self::roles(data, tenant_id),
            tenant: Some(tenant),
            instance,
            application: Some(application),
            account: Some(account),
            user: Some(user),
            ..TransformedEntityGraph::default()
        };

        finish_graph(
            &mut graph,
            message,
            STATIC_TRANSFORMER_VERSION,
            "Microsoft Graph API".to_string(),
            self.name(),
        );

        tracing::debug!("Transformed Microsoft user: {}", graph.summary());
        Ok(TransformOutcome::Success(graph))
    }

    fn transform_apps(&self, message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError> {
        Ok(TransformOutcome::Unimplemented {
            vendor: message.vendor_tag(),
            operation: "apps",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(data: Value) -> RawEntityMessage {
        serde_json::from_value(json!({
            "vendor": "microsoft",
            "type": "users",
            "tenant": "T1",
            "instance_id": "I1",
            "domain": "x.com",
            "data": data
        }))
        .unwrap()
    }

    fn transform(data: Value) -> TransformedEntityGraph {
        MicrosoftEntityTransformer::new()
            .transform(&message(data))
            .unwrap()
            .into_result()
            .unwrap()
    }

    #[test]
    fn test_scenario_user_with_department() {
        let graph = transform(json!({"id": "U1", "mail": "a@x.com", "department": "Eng"}));

        let user = graph.user.as_ref().unwrap();
        assert_eq!(user.mail.as_deref(), Some("a@x.com"));
        assert_eq!(graph.tenant.as_ref().unwrap().id.as_deref(), Some("T1"));
        assert_eq!(graph.departments.len(), 1);
        assert_eq!(graph.departments[0].name, "Eng");
        assert_eq!(graph.user_departments.len(), 1);
        assert!(graph.user_departments[0].is_primary);
        assert_eq!(graph.user_departments[0].department_id, graph.departments[0].department_id);
        assert_eq!(user.extension_deployment_status.as_deref(), Some("Excluded"));
    }

    #[test]
    fn test_account_and_status() {
        let graph = transform(json!({
            "id": "U1",
            "userPrincipalName": "Bob@X.com",
            "accountEnabled": true,
            "userType": "Member",
            "signInActivity": {"lastSignInDateTime": "2024-05-01T10:00:00Z"},
            "employeeHireDate": "2021-04-01T00:00:00Z"
        }));

        let user = graph.user.as_ref().unwrap();
        let account = graph.account.as_ref().unwrap();
        assert_eq!(account.id, format!("bob@x.com_{}", MICROSOFT_APP_ID));
        assert_eq!(account.app_name.as_deref(), Some(MICROSOFT_APP_NAME));
        assert_eq!(user.extension_deployment_status.as_deref(), Some("Ready to Deploy"));
        assert!(user.user_last_login_time.is_some());
        assert_eq!(user.employee_hire_date, NaiveDate::from_ymd_opt(2021, 4, 1));
    }

    #[test]
    fn test_padded_names_are_trimmed() {
        let graph = transform(json!({
            "id": "U1",
            "mail": "Ann@X.com",
            "department": "  Engineering ",
            "officeLocation": " HQ\t"
        }));
        let tenant = graph.tenant.as_ref().unwrap().tenant_id;

        assert_eq!(graph.departments[0].name, "Engineering");
        assert_eq!(graph.departments[0].id, "Engineering");
        assert_eq!(graph.departments[0].department_id, derive_id(tenant, "dept", "Engineering"));
        assert_eq!(graph.office_locations[0].name, "HQ");
        assert_eq!(graph.office_locations[0].office_location_id, derive_id(tenant, "office", "HQ"));

        let account = graph.account.as_ref().unwrap();
        assert_eq!(account.microsoft_id.as_deref(), Some("U1"));
        assert_eq!(account.email.as_deref(), Some("ann@x.com"));
    }

    #[test]
    fn test_ids_stable_across_redelivery() {
        let data = json!({
            "id": "U1",
            "department": "Eng",
            "officeLocation": "HQ",
            "groups": [{"id": "G1"}, {"displayName": "no id"}],
            "roles": [{"id": "R1", "assignmentType": "Eligible"}]
        });
        let first = transform(data.clone());
        let second = transform(data);

        assert_eq!(first.user.unwrap().user_id, second.user.unwrap().user_id);
        assert_eq!(first.departments[0].department_id, second.departments[0].department_id);
        assert_eq!(first.groups.len(), 1);
        assert_eq!(first.groups[0].group_id, second.groups[0].group_id);
        assert_eq!(first.user_roles[0].assignment_type.as_deref(), Some("Eligible"));
        assert_eq!(first.user_office_locations.len(), 1);
    }

    #[test]
    fn test_empty_groups() {
        let graph = transform(json!({"id": "U1", "groups": []}));
        assert!(graph.groups.is_empty());
        assert!(graph.user_groups.is_empty());
    }

    #[test]
    fn test_missing_id_is_invalid() {
        let outcome = MicrosoftEntityTransformer::new()
            .transform_users(&message(json!({"mail": "a@x.com"})))
            .unwrap();
        assert!(matches!(outcome, TransformOutcome::InvalidInput(_)));
    }
}
