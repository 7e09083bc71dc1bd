//! Per-entity record assembly from resolved field values.
//!
//! Each canonical entity has one explicit builder. Natural keys and owning
//! tenant are validated here; identifiers missing from the values are
//! derived from (tenant, natural key) so that rule sets without explicit id
//! rules still produce stable identifiers.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::{
    Account, Application, Department, Entity, EntityError, FieldValues, Group, Instance,
    OfficeLocation, Role, Tenant, User,
};
use crate::ids::derive_id;

/// Typed construction from a [`FieldValues`] bag.
pub trait FromFieldValues: Entity {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError>;
}

fn extra_info(values: &FieldValues) -> Map<String, Value> {
    values.object("extraInfo").unwrap_or_default()
}

fn active(values: &FieldValues) -> bool {
    values.boolean("isActive").unwrap_or(true)
}

/// Explicit identifier when present, otherwise derived from the natural key.
fn id_or_derived(
    values: &FieldValues,
    entity: &'static str,
    id_field: &str,
    tenant_id: Uuid,
    kind: &str,
    natural_key: &str,
) -> Result<Uuid, EntityError> {
    if values.contains(id_field) {
        values.require_uuid(entity, id_field)
    } else {
        Ok(derive_id(tenant_id, kind, natural_key))
    }
}

impl FromFieldValues for Tenant {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        Ok(Tenant {
            tenant_id: values.require_uuid(Self::NAME, "tenantId")?,
            id: values.text("id"),
            name: values.text("name"),
            subscriber_id: values.text("subscriberId"),
            creation_time: values.timestamp("creationTime"),
            enable_persona_via_background_tabs: values.boolean("enablePersonaViaBackgroundTabs"),
            enable_persona_via_forced_login: values.boolean("enablePersonaViaForcedLogin"),
            extension_enabled: values.boolean("extensionEnabled"),
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}

impl FromFieldValues for Instance {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        Ok(Instance {
            instance_id: values.require_uuid(Self::NAME, "instanceId")?,
            tenant_id: values.require_uuid(Self::NAME, "tenantId")?,
            app_id: values.text("appId"),
            creation_time: values.timestamp("creationTime"),
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}

impl FromFieldValues for Application {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        Ok(Application {
            id: values.require_uuid(Self::NAME, "id")?,
            domain: values.text("domain"),
            new_app: values.boolean("newApp").unwrap_or(false),
            global_sync_allowed: values.boolean("globalSyncAllowed").unwrap_or(false),
        })
    }
}

impl FromFieldValues for Account {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        Ok(Account {
            id: values.require_text(Self::NAME, "id")?,
            tenant_id: values.require_uuid(Self::NAME, "tenantId")?,
            email: values.text("email").map(|e| e.to_lowercase()),
            app_name: values.text("appName"),
            app_id: values.uuid("appId"),
            microsoft_id: values.text("microsoftId"),
            creation_time: values.timestamp("creationTime"),
        })
    }
}

impl FromFieldValues for User {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        let tenant_id = values.require_uuid(Self::NAME, "tenantId")?;
        let id = values.require_text(Self::NAME, "id")?;
        let user_id = id_or_derived(values, Self::NAME, "userId", tenant_id, "", &id)?;

        Ok(User {
            user_id,
            tenant_id,
            instance_id: values.uuid("instanceId"),
            id,
            display_name: values.text("displayName"),
            given_name: values.text("givenName"),
            surname: values.text("surname"),
            mail: values.text("mail"),
            user_principal_name: values.text("userPrincipalName"),
            mobile_phone: values.text("mobilePhone"),
            job_title: values.text("jobTitle"),
            employee_type: values.text("employeeType"),
            employee_hire_date: values.date("employeeHireDate"),
            termination_date: values.date("terminationDate"),
            account_enabled: values.boolean("accountEnabled"),
            user_suspended: values.boolean("userSuspended"),
            user_archived: values.boolean("userArchived"),
            user_type: values.text("userType"),
            user_is_admin: values.boolean("userIsAdmin"),
            user_delegation_admin: values.boolean("userDelegationAdmin"),
            user_ip_whitelisted: values.boolean("userIpWhitelisted"),
            extension_enabled: values.boolean("extensionEnabled"),
            extension_deployment_status: values.text("extensionDeploymentStatus"),
            user_creation_time: values.timestamp("userCreationTime"),
            user_last_login_time: values.timestamp("userLastLoginTime"),
            profile_pic_url: values.text("profilePicUrl"),
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}

impl FromFieldValues for Department {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        let tenant_id = values.require_uuid(Self::NAME, "tenantId")?;
        let name = values.require_text(Self::NAME, "name")?;
        let id = values.text("id").unwrap_or_else(|| name.clone());
        let department_id = id_or_derived(values, Self::NAME, "departmentId", tenant_id, "dept", &id)?;

        Ok(Department {
            department_id,
            tenant_id,
            id,
            name,
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}

impl FromFieldValues for OfficeLocation {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        let tenant_id = values.require_uuid(Self::NAME, "tenantId")?;
        let name = values.require_text(Self::NAME, "name")?;
        let id = values.text("id").unwrap_or_else(|| name.clone());
        let office_location_id =
            id_or_derived(values, Self::NAME, "officeLocationId", tenant_id, "office", &id)?;

        Ok(OfficeLocation {
            office_location_id,
            tenant_id,
            id,
            name,
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}

impl FromFieldValues for Group {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        let tenant_id = values.require_uuid(Self::NAME, "tenantId")?;
        let id = values.require_text(Self::NAME, "id")?;
        let group_id = id_or_derived(values, Self::NAME, "groupId", tenant_id, "group", &id)?;

        Ok(Group {
            group_id,
            tenant_id,
            id,
            display_name: values.text("displayName"),
            description: values.text("description"),
            mail: values.text("mail"),
            mail_enabled: values.boolean("mailEnabled"),
            mail_nickname: values.text("mailNickname"),
            security_enabled: values.boolean("securityEnabled"),
            group_types: values.list("groupTypes").unwrap_or_default(),
            visibility: values.text("visibility"),
            classification: values.text("classification"),
            membership_rule: values.text("membershipRule"),
            membership_rule_processing_state: values.text("membershipRuleProcessingState"),
            preferred_data_location: values.text("preferredDataLocation"),
            preferred_language: values.text("preferredLanguage"),
            theme: values.text("theme"),
            unique_name: values.text("uniqueName"),
            is_assignable_to_role: values.boolean("isAssignableToRole"),
            created_date_time: values.timestamp("createdDateTime"),
            renewed_date_time: values.timestamp("renewedDateTime"),
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}

impl FromFieldValues for Role {
    fn from_field_values(values: &FieldValues) -> Result<Self, EntityError> {
        let tenant_id = values.require_uuid(Self::NAME, "tenantId")?;
        let id = values.require_text(Self::NAME, "id")?;
        let role_id = id_or_derived(values, Self::NAME, "roleId", tenant_id, "role", &id)?;

        Ok(Role {
            role_id,
            tenant_id,
            id,
            display_name: values.text("displayName"),
            description: values.text("description"),
            is_built_in: values.boolean("isBuiltIn"),
            is_enabled: values.boolean("isEnabled"),
            is_privileged: values.boolean("isPrivileged"),
            role_template_id: values.text("roleTemplateId"),
            assignment_type: values.text("assignmentType"),
            is_active: active(values),
            extra_info: extra_info(values),
        })
    }
}
