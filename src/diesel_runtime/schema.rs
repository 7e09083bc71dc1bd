//! Canonical table bootstrap.
//!
//! In production, use proper migrations instead of `CREATE TABLE IF NOT
//! EXISTS`; this keeps a fresh database usable for `fabric ingest` and the
//! integration tests.

use diesel::prelude::*;

use super::database::DbConnection;
use super::store::StoreError;

/// Statements in dependency order. The unique constraints are the natural
/// keys the upserts conflict on.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tenants (
        tenant_id UUID PRIMARY KEY,
        id TEXT,
        name TEXT,
        subscriber_id TEXT,
        creation_time TIMESTAMPTZ,
        enable_persona_via_background_tabs BOOLEAN,
        enable_persona_via_forced_login BOOLEAN,
        extension_enabled BOOLEAN,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS instances (
        instance_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        app_id TEXT,
        creation_time TIMESTAMPTZ,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS applications (
        id UUID PRIMARY KEY,
        domain TEXT,
        new_app BOOLEAN NOT NULL DEFAULT FALSE,
        global_sync_allowed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        email TEXT,
        app_name TEXT,
        app_id UUID,
        microsoft_id TEXT,
        creation_time TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS departments (
        department_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (tenant_id, id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS office_locations (
        office_location_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (tenant_id, id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS groups (
        group_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        id TEXT NOT NULL,
        display_name TEXT,
        description TEXT,
        mail TEXT,
        mail_enabled BOOLEAN,
        mail_nickname TEXT,
        security_enabled BOOLEAN,
        group_types TEXT[] NOT NULL DEFAULT '{}',
        visibility TEXT,
        classification TEXT,
        membership_rule TEXT,
        membership_rule_processing_state TEXT,
        preferred_data_location TEXT,
        preferred_language TEXT,
        theme TEXT,
        unique_name TEXT,
        is_assignable_to_role BOOLEAN,
        created_date_time TIMESTAMPTZ,
        renewed_date_time TIMESTAMPTZ,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (tenant_id, id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS roles (
        role_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        id TEXT NOT NULL,
        display_name TEXT,
        description TEXT,
        is_built_in BOOLEAN,
        is_enabled BOOLEAN,
        is_privileged BOOLEAN,
        role_template_id TEXT,
        assignment_type TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (tenant_id, id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS users (
        user_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(tenant_id),
        instance_id UUID,
        id TEXT NOT NULL,
        display_name TEXT,
        given_name TEXT,
        surname TEXT,
        mail TEXT,
        user_principal_name TEXT,
        mobile_phone TEXT,
        job_title TEXT,
        employee_type TEXT,
        employee_hire_date DATE,
        termination_date DATE,
        account_enabled BOOLEAN,
        user_suspended BOOLEAN,
        user_archived BOOLEAN,
        user_type TEXT,
        user_is_admin BOOLEAN,
        user_delegation_admin BOOLEAN,
        user_ip_whitelisted BOOLEAN,
        extension_enabled BOOLEAN,
        extension_deployment_status TEXT,
        user_creation_time TIMESTAMPTZ,
        user_last_login_time TIMESTAMPTZ,
        profile_pic_url TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (tenant_id, id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_departments (
        user_id UUID NOT NULL REFERENCES users(user_id),
        department_id UUID NOT NULL REFERENCES departments(department_id),
        tenant_id UUID NOT NULL,
        is_primary BOOLEAN NOT NULL DEFAULT FALSE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, department_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_office_locations (
        user_id UUID NOT NULL REFERENCES users(user_id),
        office_location_id UUID NOT NULL REFERENCES office_locations(office_location_id),
        tenant_id UUID NOT NULL,
        is_primary BOOLEAN NOT NULL DEFAULT FALSE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, office_location_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_groups (
        user_id UUID NOT NULL REFERENCES users(user_id),
        group_id UUID NOT NULL REFERENCES groups(group_id),
        tenant_id UUID NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, group_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_roles (
        user_id UUID NOT NULL REFERENCES users(user_id),
        role_id UUID NOT NULL REFERENCES roles(role_id),
        tenant_id UUID NOT NULL,
        assignment_type TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        extra_info JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, role_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS field_mappings (
        id BIGSERIAL PRIMARY KEY,
        vendor TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        target_entity TEXT NOT NULL,
        target_field TEXT NOT NULL,
        source_path TEXT NOT NULL DEFAULT '',
        fallback_paths TEXT,
        data_type TEXT NOT NULL DEFAULT 'STRING',
        transform_name TEXT,
        transform_args TEXT,
        default_value TEXT,
        required BOOLEAN NOT NULL DEFAULT FALSE,
        priority INTEGER NOT NULL DEFAULT 0,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_field_mappings_lookup ON field_mappings(vendor, entity_type, target_entity)",
];

/// Create every canonical table and the `field_mappings` table if missing.
pub fn ensure_schema(conn: &mut DbConnection) -> Result<(), StoreError> {
    for statement in SCHEMA_STATEMENTS {
        diesel::sql_query(*statement).execute(conn)?;
    }
    tracing::info!("All tables ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diesel_runtime::store::EntityKind;

    #[test]
    fn test_every_entity_table_is_created() {
        for kind in EntityKind::ALL {
            let needle = format!("CREATE TABLE IF NOT EXISTS {} (", kind.table());
            assert!(
                SCHEMA_STATEMENTS.iter().any(|s| s.starts_with(&needle)),
                "missing table {}",
                kind.table()
            );
        }
    }
}
