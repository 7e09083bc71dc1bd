//! Canonical store capability used by the ingestion coordinator.
//!
//! One upsert per entity kind, keyed by the kind's natural key. Each upsert
//! returns the identifier the store holds for that row, which may differ from
//! the provisional one carried by the record.

use std::fmt;

use uuid::Uuid;

use crate::entity::{
    Account, Application, Department, Group, Instance, OfficeLocation, Role, Tenant, User,
    UserDepartmentLink, UserGroupLink, UserOfficeLocationLink, UserRoleLink,
};

/// Entity kinds in upsert order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Tenant,
    Instance,
    Application,
    Account,
    Department,
    OfficeLocation,
    Group,
    Role,
    User,
    UserDepartment,
    UserOfficeLocation,
    UserGroup,
    UserRole,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Tenant,
        EntityKind::Instance,
        EntityKind::Application,
        EntityKind::Account,
        EntityKind::Department,
        EntityKind::OfficeLocation,
        EntityKind::Group,
        EntityKind::Role,
        EntityKind::User,
        EntityKind::UserDepartment,
        EntityKind::UserOfficeLocation,
        EntityKind::UserGroup,
        EntityKind::UserRole,
    ];

    /// Table name
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Tenant => "tenants",
            EntityKind::Instance => "instances",
            EntityKind::Application => "applications",
            EntityKind::Account => "accounts",
            EntityKind::Department => "departments",
            EntityKind::OfficeLocation => "office_locations",
            EntityKind::Group => "groups",
            EntityKind::Role => "roles",
            EntityKind::User => "users",
            EntityKind::UserDepartment => "user_departments",
            EntityKind::UserOfficeLocation => "user_office_locations",
            EntityKind::UserGroup => "user_groups",
            EntityKind::UserRole => "user_roles",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// Error type for canonical store operations
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Pool exhausted or connection lost
    Connection(String),
    /// Statement timed out or the transaction was cancelled
    Timeout(String),
    /// Unique, foreign-key or check constraint rejected the row
    Constraint { kind: Option<EntityKind>, message: String },
    Query { kind: Option<EntityKind>, message: String },
}

impl StoreError {
    /// Whether retrying the same work later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }

    /// Attach the entity kind to an error raised without one.
    pub fn for_kind(self, kind: EntityKind) -> Self {
        match self {
            StoreError::Query { kind: None, message } => StoreError::Query {
                kind: Some(kind),
                message,
            },
            StoreError::Constraint { kind: None, message } => StoreError::Constraint {
                kind: Some(kind),
                message,
            },
            other => other,
        }
    }

    fn describe(kind: &Option<EntityKind>) -> &'static str {
        kind.map(|k| k.table()).unwrap_or("<unknown>")
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(msg) => write!(f, "Store connection error: {}", msg),
            StoreError::Timeout(msg) => write!(f, "Store timeout: {}", msg),
            StoreError::Constraint { kind, message } => {
                write!(f, "Constraint violation on {}: {}", Self::describe(kind), message)
            }
            StoreError::Query { kind: Some(kind), message } => {
                write!(f, "Query on {} failed: {}", kind, message)
            }
            StoreError::Query { kind: None, message } => write!(f, "Query failed: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Connection(info.message().to_string())
            }
            Error::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                StoreError::Timeout(info.message().to_string())
            }
            Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation
                | DatabaseErrorKind::ForeignKeyViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::CheckViolation,
                info,
            ) => StoreError::Constraint {
                kind: None,
                message: format!("{} ({})", info.message(), info.constraint_name().unwrap_or("?")),
            },
            other => StoreError::Query {
                kind: None,
                message: other.to_string(),
            },
        }
    }
}

/// Upsert-by-natural-key operations, all running inside one ambient
/// transaction.
pub trait EntityStore {
    /// Keyed by `tenant_id`.
    fn upsert_tenant(&mut self, tenant: &Tenant) -> Result<Uuid, StoreError>;
    /// Keyed by `instance_id`.
    fn upsert_instance(&mut self, instance: &Instance) -> Result<Uuid, StoreError>;
    /// Keyed by `id`.
    fn upsert_application(&mut self, application: &Application) -> Result<Uuid, StoreError>;
    /// Keyed by `id` (identifier + app id).
    fn upsert_account(&mut self, account: &Account) -> Result<String, StoreError>;
    fn upsert_department(&mut self, department: &Department) -> Result<Uuid, StoreError>;
    fn upsert_office_location(&mut self, office: &OfficeLocation) -> Result<Uuid, StoreError>;
    fn upsert_group(&mut self, group: &Group) -> Result<Uuid, StoreError>;
    fn upsert_role(&mut self, role: &Role) -> Result<Uuid, StoreError>;
    fn upsert_user(&mut self, user: &User) -> Result<Uuid, StoreError>;

    fn upsert_user_department(&mut self, link: &UserDepartmentLink) -> Result<(), StoreError>;
    fn upsert_user_office_location(&mut self, link: &UserOfficeLocationLink) -> Result<(), StoreError>;
    fn upsert_user_group(&mut self, link: &UserGroupLink) -> Result<(), StoreError>;
    fn upsert_user_role(&mut self, link: &UserRoleLink) -> Result<(), StoreError>;
}

/// Work run inside one transaction.
pub type TransactionWork<'a> = dyn FnMut(&mut dyn EntityStore) -> Result<(), StoreError> + 'a;

/// A store that can run a unit of work atomically: either every upsert in
/// `work` is visible afterwards or none is.
pub trait TransactionalStore: Send + Sync {
    fn in_transaction(&self, work: &mut TransactionWork<'_>) -> Result<(), StoreError>;
}
