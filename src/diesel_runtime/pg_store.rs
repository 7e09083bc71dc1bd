//! Postgres canonical store.
//!
//! Every upsert is one `INSERT ... ON CONFLICT (<natural key>) DO UPDATE ...
//! RETURNING <primary id>` statement. The conflict branch never touches the
//! primary id column, so a row keeps the identifier it was first stored with.

use diesel::prelude::*;
use diesel::sql_types::{Array, Bool, Date, Jsonb, Nullable, Text, Timestamptz};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::database::{DbConnection, Pool};
use super::store::{EntityKind, EntityStore, StoreError, TransactionWork, TransactionalStore};
use crate::entity::{
    Account, Application, Department, Group, Instance, OfficeLocation, Role, Tenant, User,
    UserDepartmentLink, UserGroupLink, UserOfficeLocationLink, UserRoleLink,
};

type SqlUuid = diesel::sql_types::Uuid;

#[derive(QueryableByName)]
struct ReturnedUuid {
    #[diesel(sql_type = diesel::sql_types::Uuid)]
    id: Uuid,
}

#[derive(QueryableByName)]
struct ReturnedText {
    #[diesel(sql_type = Text)]
    id: String,
}

fn bag(extra_info: &Map<String, Value>) -> Value {
    Value::Object(extra_info.clone())
}

const UPSERT_TENANT: &str = r#"
    INSERT INTO tenants (tenant_id, id, name, subscriber_id, creation_time,
        enable_persona_via_background_tabs, enable_persona_via_forced_login,
        extension_enabled, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (tenant_id) DO UPDATE SET
        id = EXCLUDED.id,
        name = COALESCE(EXCLUDED.name, tenants.name),
        subscriber_id = COALESCE(EXCLUDED.subscriber_id, tenants.subscriber_id),
        creation_time = COALESCE(tenants.creation_time, EXCLUDED.creation_time),
        enable_persona_via_background_tabs = EXCLUDED.enable_persona_via_background_tabs,
        enable_persona_via_forced_login = EXCLUDED.enable_persona_via_forced_login,
        extension_enabled = EXCLUDED.extension_enabled,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING tenant_id AS id"#;

const UPSERT_INSTANCE: &str = r#"
    INSERT INTO instances (instance_id, tenant_id, app_id, creation_time, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (instance_id) DO UPDATE SET
        app_id = EXCLUDED.app_id,
        creation_time = COALESCE(instances.creation_time, EXCLUDED.creation_time),
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING instance_id AS id"#;

const UPSERT_APPLICATION: &str = r#"
    INSERT INTO applications (id, domain, new_app, global_sync_allowed)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (id) DO UPDATE SET
        domain = COALESCE(EXCLUDED.domain, applications.domain),
        updated_at = now()
    RETURNING id"#;

const UPSERT_ACCOUNT: &str = r#"
    INSERT INTO accounts (id, tenant_id, email, app_name, app_id, microsoft_id, creation_time)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (id) DO UPDATE SET
        email = EXCLUDED.email,
        app_name = EXCLUDED.app_name,
        app_id = EXCLUDED.app_id,
        microsoft_id = EXCLUDED.microsoft_id,
        creation_time = COALESCE(accounts.creation_time, EXCLUDED.creation_time),
        updated_at = now()
    RETURNING id"#;

const UPSERT_DEPARTMENT: &str = r#"
    INSERT INTO departments (department_id, tenant_id, id, name, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (tenant_id, id) DO UPDATE SET
        name = EXCLUDED.name,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING department_id AS id"#;

const UPSERT_OFFICE_LOCATION: &str = r#"
    INSERT INTO office_locations (office_location_id, tenant_id, id, name, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (tenant_id, id) DO UPDATE SET
        name = EXCLUDED.name,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING office_location_id AS id"#;

const UPSERT_GROUP: &str = r#"
    INSERT INTO groups (group_id, tenant_id, id, display_name, description, mail,
        mail_enabled, mail_nickname, security_enabled, group_types, visibility,
        classification, membership_rule, membership_rule_processing_state,
        preferred_data_location, preferred_language, theme, unique_name,
        is_assignable_to_role, created_date_time, renewed_date_time, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
        $17, $18, $19, $20, $21, $22, $23)
    ON CONFLICT (tenant_id, id) DO UPDATE SET
        display_name = EXCLUDED.display_name,
        description = EXCLUDED.description,
        mail = EXCLUDED.mail,
        mail_enabled = EXCLUDED.mail_enabled,
        mail_nickname = EXCLUDED.mail_nickname,
        security_enabled = EXCLUDED.security_enabled,
        group_types = EXCLUDED.group_types,
        visibility = EXCLUDED.visibility,
        classification = EXCLUDED.classification,
        membership_rule = EXCLUDED.membership_rule,
        membership_rule_processing_state = EXCLUDED.membership_rule_processing_state,
        preferred_data_location = EXCLUDED.preferred_data_location,
        preferred_language = EXCLUDED.preferred_language,
        theme = EXCLUDED.theme,
        unique_name = EXCLUDED.unique_name,
        is_assignable_to_role = EXCLUDED.is_assignable_to_role,
        created_date_time = EXCLUDED.created_date_time,
        renewed_date_time = EXCLUDED.renewed_date_time,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING group_id AS id"#;

const UPSERT_ROLE: &str = r#"
    INSERT INTO roles (role_id, tenant_id, id, display_name, description, is_built_in,
        is_enabled, is_privileged, role_template_id, assignment_type, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (tenant_id, id) DO UPDATE SET
        display_name = EXCLUDED.display_name,
        description = EXCLUDED.description,
        is_built_in = EXCLUDED.is_built_in,
        is_enabled = EXCLUDED.is_enabled,
        is_privileged = EXCLUDED.is_privileged,
        role_template_id = EXCLUDED.role_template_id,
        assignment_type = EXCLUDED.assignment_type,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING role_id AS id"#;

const UPSERT_USER: &str = r#"
    INSERT INTO users (user_id, tenant_id, instance_id, id, display_name, given_name,
        surname, mail, user_principal_name, mobile_phone, job_title, employee_type,
        employee_hire_date, termination_date, account_enabled, user_suspended,
        user_archived, user_type, user_is_admin, user_delegation_admin,
        user_ip_whitelisted, extension_enabled, extension_deployment_status,
        user_creation_time, user_last_login_time, profile_pic_url, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
        $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
    ON CONFLICT (tenant_id, id) DO UPDATE SET
        instance_id = COALESCE(EXCLUDED.instance_id, users.instance_id),
        display_name = EXCLUDED.display_name,
        given_name = EXCLUDED.given_name,
        surname = EXCLUDED.surname,
        mail = EXCLUDED.mail,
        user_principal_name = EXCLUDED.user_principal_name,
        mobile_phone = EXCLUDED.mobile_phone,
        job_title = EXCLUDED.job_title,
        employee_type = EXCLUDED.employee_type,
        employee_hire_date = EXCLUDED.employee_hire_date,
        termination_date = EXCLUDED.termination_date,
        account_enabled = EXCLUDED.account_enabled,
        user_suspended = EXCLUDED.user_suspended,
        user_archived = EXCLUDED.user_archived,
        user_type = EXCLUDED.user_type,
        user_is_admin = EXCLUDED.user_is_admin,
        user_delegation_admin = EXCLUDED.user_delegation_admin,
        user_ip_whitelisted = EXCLUDED.user_ip_whitelisted,
        extension_enabled = EXCLUDED.extension_enabled,
        extension_deployment_status = EXCLUDED.extension_deployment_status,
        user_creation_time = COALESCE(users.user_creation_time, EXCLUDED.user_creation_time),
        user_last_login_time = COALESCE(EXCLUDED.user_last_login_time, users.user_last_login_time),
        profile_pic_url = EXCLUDED.profile_pic_url,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()
    RETURNING user_id AS id"#;

const UPSERT_USER_DEPARTMENT: &str = r#"
    INSERT INTO user_departments (user_id, department_id, tenant_id, is_primary, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (user_id, department_id) DO UPDATE SET
        is_primary = EXCLUDED.is_primary,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()"#;

const UPSERT_USER_OFFICE_LOCATION: &str = r#"
    INSERT INTO user_office_locations (user_id, office_location_id, tenant_id, is_primary, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (user_id, office_location_id) DO UPDATE SET
        is_primary = EXCLUDED.is_primary,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()"#;

const UPSERT_USER_GROUP: &str = r#"
    INSERT INTO user_groups (user_id, group_id, tenant_id, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (user_id, group_id) DO UPDATE SET
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()"#;

const UPSERT_USER_ROLE: &str = r#"
    INSERT INTO user_roles (user_id, role_id, tenant_id, assignment_type, is_active, extra_info)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (user_id, role_id) DO UPDATE SET
        assignment_type = EXCLUDED.assignment_type,
        is_active = EXCLUDED.is_active,
        extra_info = EXCLUDED.extra_info,
        updated_at = now()"#;

/// One open transaction on a pooled connection.
struct PgTx<'a> {
    conn: &'a mut DbConnection,
}

impl EntityStore for PgTx<'_> {
    fn upsert_tenant(&mut self, tenant: &Tenant) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_TENANT)
            .bind::<SqlUuid, _>(tenant.tenant_id)
            .bind::<Nullable<Text>, _>(tenant.id.clone())
            .bind::<Nullable<Text>, _>(tenant.name.clone())
            .bind::<Nullable<Text>, _>(tenant.subscriber_id.clone())
            .bind::<Nullable<Timestamptz>, _>(tenant.creation_time)
            .bind::<Nullable<Bool>, _>(tenant.enable_persona_via_background_tabs)
            .bind::<Nullable<Bool>, _>(tenant.enable_persona_via_forced_login)
            .bind::<Nullable<Bool>, _>(tenant.extension_enabled)
            .bind::<Bool, _>(tenant.is_active)
            .bind::<Jsonb, _>(bag(&tenant.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Tenant))?;
        Ok(row.id)
    }

    fn upsert_instance(&mut self, instance: &Instance) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_INSTANCE)
            .bind::<SqlUuid, _>(instance.instance_id)
            .bind::<SqlUuid, _>(instance.tenant_id)
            .bind::<Nullable<Text>, _>(instance.app_id.clone())
            .bind::<Nullable<Timestamptz>, _>(instance.creation_time)
            .bind::<Bool, _>(instance.is_active)
            .bind::<Jsonb, _>(bag(&instance.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Instance))?;
        Ok(row.id)
    }

    fn upsert_application(&mut self, application: &Application) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_APPLICATION)
            .bind::<SqlUuid, _>(application.id)
            .bind::<Nullable<Text>, _>(application.domain.clone())
            .bind::<Bool, _>(application.new_app)
            .bind::<Bool, _>(application.global_sync_allowed)
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Application))?;
        Ok(row.id)
    }

    fn upsert_account(&mut self, account: &Account) -> Result<String, StoreError> {
        let row: ReturnedText = diesel::sql_query(UPSERT_ACCOUNT)
            .bind::<Text, _>(account.id.clone())
            .bind::<SqlUuid, _>(account.tenant_id)
            .bind::<Nullable<Text>, _>(account.email.clone())
            .bind::<Nullable<Text>, _>(account.app_name.clone())
            .bind::<Nullable<SqlUuid>, _>(account.app_id)
            .bind::<Nullable<Text>, _>(account.microsoft_id.clone())
            .bind::<Nullable<Timestamptz>, _>(account.creation_time)
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Account))?;
        Ok(row.id)
    }

    fn upsert_department(&mut self, department: &Department) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_DEPARTMENT)
            .bind::<SqlUuid, _>(department.department_id)
            .bind::<SqlUuid, _>(department.tenant_id)
            .bind::<Text, _>(department.id.clone())
            .bind::<Text, _>(department.name.clone())
            .bind::<Bool, _>(department.is_active)
            .bind::<Jsonb, _>(bag(&department.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Department))?;
        Ok(row.id)
    }

    fn upsert_office_location(&mut self, office: &OfficeLocation) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_OFFICE_LOCATION)
            .bind::<SqlUuid, _>(office.office_location_id)
            .bind::<SqlUuid, _>(office.tenant_id)
            .bind::<Text, _>(office.id.clone())
            .bind::<Text, _>(office.name.clone())
            .bind::<Bool, _>(office.is_active)
            .bind::<Jsonb, _>(bag(&office.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::OfficeLocation))?;
        Ok(row.id)
    }

    fn upsert_group(&mut self, group: &Group) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_GROUP)
            .bind::<SqlUuid, _>(group.group_id)
            .bind::<SqlUuid, _>(group.tenant_id)
            .bind::<Text, _>(group.id.clone())
            .bind::<Nullable<Text>, _>(group.display_name.clone())
            .bind::<Nullable<Text>, _>(group.description.clone())
            .bind::<Nullable<Text>, _>(group.mail.clone())
            .bind::<Nullable<Bool>, _>(group.mail_enabled)
            .bind::<Nullable<Text>, _>(group.mail_nickname.clone())
            .bind::<Nullable<Bool>, _>(group.security_enabled)
            .bind::<Array<Text>, _>(group.group_types.clone())
            .bind::<Nullable<Text>, _>(group.visibility.clone())
            .bind::<Nullable<Text>, _>(group.classification.clone())
            .bind::<Nullable<Text>, _>(group.membership_rule.clone())
            .bind::<Nullable<Text>, _>(group.membership_rule_processing_state.clone())
            .bind::<Nullable<Text>, _>(group.preferred_data_location.clone())
            .bind::<Nullable<Text>, _>(group.preferred_language.clone())
            .bind::<Nullable<Text>, _>(group.theme.clone())
            .bind::<Nullable<Text>, _>(group.unique_name.clone())
            .bind::<Nullable<Bool>, _>(group.is_assignable_to_role)
            .bind::<Nullable<Timestamptz>, _>(group.created_date_time)
            .bind::<Nullable<Timestamptz>, _>(group.renewed_date_time)
            .bind::<Bool, _>(group.is_active)
            .bind::<Jsonb, _>(bag(&group.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Group))?;
        Ok(row.id)
    }

    fn upsert_role(&mut self, role: &Role) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_ROLE)
            .bind::<SqlUuid, _>(role.role_id)
            .bind::<SqlUuid, _>(role.tenant_id)
            .bind::<Text, _>(role.id.clone())
            .bind::<Nullable<Text>, _>(role.display_name.clone())
            .bind::<Nullable<Text>, _>(role.description.clone())
            .bind::<Nullable<Bool>, _>(role.is_built_in)
            .bind::<Nullable<Bool>, _>(role.is_enabled)
            .bind::<Nullable<Bool>, _>(role.is_privileged)
            .bind::<Nullable<Text>, _>(role.role_template_id.clone())
            .bind::<Nullable<Text>, _>(role.assignment_type.clone())
            .bind::<Bool, _>(role.is_active)
            .bind::<Jsonb, _>(bag(&role.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::Role))?;
        Ok(row.id)
    }

    fn upsert_user(&mut self, user: &User) -> Result<Uuid, StoreError> {
        let row: ReturnedUuid = diesel::sql_query(UPSERT_USER)
            .bind::<SqlUuid, _>(user.user_id)
            .bind::<SqlUuid, _>(user.tenant_id)
            .bind::<Nullable<SqlUuid>, _>(user.instance_id)
            .bind::<Text, _>(user.id.clone())
            .bind::<Nullable<Text>, _>(user.display_name.clone())
            .bind::<Nullable<Text>, _>(user.given_name.clone())
            .bind::<Nullable<Text>, _>(user.surname.clone())
            .bind::<Nullable<Text>, _>(user.mail.clone())
            .bind::<Nullable<Text>, _>(user.user_principal_name.clone())
            .bind::<Nullable<Text>, _>(user.mobile_phone.clone())
            .bind::<Nullable<Text>, _>(user.job_title.clone())
            .bind::<Nullable<Text>, _>(user.employee_type.clone())
            .bind::<Nullable<Date>, _>(user.employee_hire_date)
            .bind::<Nullable<Date>, _>(user.termination_date)
            .bind::<Nullable<Bool>, _>(user.account_enabled)
            .bind::<Nullable<Bool>, _>(user.user_suspended)
            .bind::<Nullable<Bool>, _>(user.user_archived)
            .bind::<Nullable<Text>, _>(user.user_type.clone())
            .bind::<Nullable<Bool>, _>(user.user_is_admin)
            .bind::<Nullable<Bool>, _>(user.user_delegation_admin)
            .bind::<Nullable<Bool>, _>(user.user_ip_whitelisted)
            .bind::<Nullable<Bool>, _>(user.extension_enabled)
            .bind::<Nullable<Text>, _>(user.extension_deployment_status.clone())
            .bind::<Nullable<Timestamptz>, _>(user.user_creation_time)
            .bind::<Nullable<Timestamptz>, _>(user.user_last_login_time)
            .bind::<Nullable<Text>, _>(user.profile_pic_url.clone())
            .bind::<Bool, _>(user.is_active)
            .bind::<Jsonb, _>(bag(&user.extra_info))
            .get_result(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::User))?;
        Ok(row.id)
    }

    fn upsert_user_department(&mut self, link: &UserDepartmentLink) -> Result<(), StoreError> {
        diesel::sql_query(UPSERT_USER_DEPARTMENT)
            .bind::<SqlUuid, _>(link.user_id)
            .bind::<SqlUuid, _>(link.department_id)
            .bind::<SqlUuid, _>(link.tenant_id)
            .bind::<Bool, _>(link.is_primary)
            .bind::<Bool, _>(link.is_active)
            .bind::<Jsonb, _>(bag(&link.extra_info))
            .execute(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::UserDepartment))?;
        Ok(())
    }

    fn upsert_user_office_location(&mut self, link: &UserOfficeLocationLink) -> Result<(), StoreError> {
        diesel::sql_query(UPSERT_USER_OFFICE_LOCATION)
            .bind::<SqlUuid, _>(link.user_id)
            .bind::<SqlUuid, _>(link.office_location_id)
            .bind::<SqlUuid, _>(link.tenant_id)
            .bind::<Bool, _>(link.is_primary)
            .bind::<Bool, _>(link.is_active)
            .bind::<Jsonb, _>(bag(&link.extra_info))
            .execute(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::UserOfficeLocation))?;
        Ok(())
    }

    fn upsert_user_group(&mut self, link: &UserGroupLink) -> Result<(), StoreError> {
        diesel::sql_query(UPSERT_USER_GROUP)
            .bind::<SqlUuid, _>(link.user_id)
            .bind::<SqlUuid, _>(link.group_id)
            .bind::<SqlUuid, _>(link.tenant_id)
            .bind::<Bool, _>(link.is_active)
            .bind::<Jsonb, _>(bag(&link.extra_info))
            .execute(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::UserGroup))?;
        Ok(())
    }

    fn upsert_user_role(&mut self, link: &UserRoleLink) -> Result<(), StoreError> {
        diesel::sql_query(UPSERT_USER_ROLE)
            .bind::<SqlUuid, _>(link.user_id)
            .bind::<SqlUuid, _>(link.role_id)
            .bind::<SqlUuid, _>(link.tenant_id)
            .bind::<Nullable<Text>, _>(link.assignment_type.clone())
            .bind::<Bool, _>(link.is_active)
            .bind::<Jsonb, _>(bag(&link.extra_info))
            .execute(&mut *self.conn)
            .map_err(|e| StoreError::from(e).for_kind(EntityKind::UserRole))?;
        Ok(())
    }
}

/// Canonical store backed by the shared connection pool.
#[derive(Clone)]
pub struct PgEntityStore {
    pool: Pool,
}

impl PgEntityStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl TransactionalStore for PgEntityStore {
    fn in_transaction(&self, work: &mut TransactionWork<'_>) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        conn.transaction::<_, StoreError, _>(|conn| {
            let mut tx = PgTx { conn };
            work(&mut tx)
        })
    }
}
