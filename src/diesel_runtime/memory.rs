//! In-process canonical store.
//!
//! Transactions run against a copy of the state which replaces the committed
//! state only when the work succeeds. Used by tests and by `fabric replay`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{EntityKind, EntityStore, StoreError, TransactionWork, TransactionalStore};
use crate::entity::{
    Account, Application, Department, Group, Instance, OfficeLocation, Role, Tenant, User,
    UserDepartmentLink, UserGroupLink, UserOfficeLocationLink, UserRoleLink,
};

/// A stored row with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub record: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type TenantKey = (Uuid, String);

/// Committed contents of a [`MemoryStore`], keyed by natural key.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub tenants: BTreeMap<Uuid, Stored<Tenant>>,
    pub instances: BTreeMap<Uuid, Stored<Instance>>,
    pub applications: BTreeMap<Uuid, Stored<Application>>,
    pub accounts: BTreeMap<String, Stored<Account>>,
    pub departments: BTreeMap<TenantKey, Stored<Department>>,
    pub office_locations: BTreeMap<TenantKey, Stored<OfficeLocation>>,
    pub groups: BTreeMap<TenantKey, Stored<Group>>,
    pub roles: BTreeMap<TenantKey, Stored<Role>>,
    pub users: BTreeMap<TenantKey, Stored<User>>,
    pub user_departments: BTreeMap<(Uuid, Uuid), Stored<UserDepartmentLink>>,
    pub user_office_locations: BTreeMap<(Uuid, Uuid), Stored<UserOfficeLocationLink>>,
    pub user_groups: BTreeMap<(Uuid, Uuid), Stored<UserGroupLink>>,
    pub user_roles: BTreeMap<(Uuid, Uuid), Stored<UserRoleLink>>,
}

impl MemoryState {
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Tenant => self.tenants.len(),
            EntityKind::Instance => self.instances.len(),
            EntityKind::Application => self.applications.len(),
            EntityKind::Account => self.accounts.len(),
            EntityKind::Department => self.departments.len(),
            EntityKind::OfficeLocation => self.office_locations.len(),
            EntityKind::Group => self.groups.len(),
            EntityKind::Role => self.roles.len(),
            EntityKind::User => self.users.len(),
            EntityKind::UserDepartment => self.user_departments.len(),
            EntityKind::UserOfficeLocation => self.user_office_locations.len(),
            EntityKind::UserGroup => self.user_groups.len(),
            EntityKind::UserRole => self.user_roles.len(),
        }
    }

    /// Rows across every table.
    pub fn total(&self) -> usize {
        EntityKind::ALL.iter().map(|k| self.count(*k)).sum()
    }
}

/// Insert or update `record` under `key`. On update the stored primary id is
/// kept: `keep_id` copies it from the existing row into the new record.
fn upsert<K: Ord, T: Clone>(
    table: &mut BTreeMap<K, Stored<T>>,
    key: K,
    mut record: T,
    keep_id: impl Fn(&T, &mut T),
) -> T {
    let now = Utc::now();
    match table.get_mut(&key) {
        Some(existing) => {
            keep_id(&existing.record, &mut record);
            existing.record = record.clone();
            existing.updated_at = now;
        }
        None => {
            table.insert(
                key,
                Stored {
                    record: record.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }
    }
    record
}

struct MemoryTx<'a> {
    state: &'a mut MemoryState,
    fail_on: &'a HashSet<EntityKind>,
}

impl MemoryTx<'_> {
    fn check(&self, kind: EntityKind) -> Result<(), StoreError> {
        if self.fail_on.contains(&kind) {
            return Err(StoreError::Query {
                kind: Some(kind),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn require_tenant(&self, kind: EntityKind, tenant_id: Uuid) -> Result<(), StoreError> {
        if self.state.tenants.contains_key(&tenant_id) {
            Ok(())
        } else {
            Err(StoreError::Constraint {
                kind: Some(kind),
                message: format!("tenant {} does not exist", tenant_id),
            })
        }
    }
}

impl EntityStore for MemoryTx<'_> {
    fn upsert_tenant(&mut self, tenant: &Tenant) -> Result<Uuid, StoreError> {
        self.check(EntityKind::Tenant)?;
        let stored = upsert(&mut self.state.tenants, tenant.tenant_id, tenant.clone(), |_, _| {});
        Ok(stored.tenant_id)
    }

    fn upsert_instance(&mut self, instance: &Instance) -> Result<Uuid, StoreError> {
        self.check(EntityKind::Instance)?;
        self.require_tenant(EntityKind::Instance, instance.tenant_id)?;
        let stored = upsert(&mut self.state.instances, instance.instance_id, instance.clone(), |_, _| {});
        Ok(stored.instance_id)
    }

    fn upsert_application(&mut self, application: &Application) -> Result<Uuid, StoreError> {
        self.check(EntityKind::Application)?;
        let stored = upsert(&mut self.state.applications, application.id, application.clone(), |_, _| {});
        Ok(stored.id)
    }

    fn upsert_account(&mut self, account: &Account) -> Result<String, StoreError> {
        self.check(EntityKind::Account)?;
        self.require_tenant(EntityKind::Account, account.tenant_id)?;
        let stored = upsert(&mut self.state.accounts, account.id.clone(), account.clone(), |_, _| {});
        Ok(stored.id)
    }

    fn upsert_department(&mut self, department: &Department) -> Result<Uuid, StoreError> {
        self.check(EntityKind::Department)?;
        self.require_tenant(EntityKind::Department, department.tenant_id)?;
        let key = (department.tenant_id, department.id.clone());
        let stored = upsert(&mut self.state.departments, key, department.clone(), |old, new| {
            new.department_id = old.department_id
        });
        Ok(stored.department_id)
    }

    fn upsert_office_location(&mut self, office: &OfficeLocation) -> Result<Uuid, StoreError> {
        self.check(EntityKind::OfficeLocation)?;
        self.require_tenant(EntityKind::OfficeLocation, office.tenant_id)?;
        let key = (office.tenant_id, office.id.clone());
        let stored = upsert(&mut self.state.office_locations, key, office.clone(), |old, new| {
            new.office_location_id = old.office_location_id
        });
        Ok(stored.office_location_id)
    }

    fn upsert_group(&mut self, group: &Group) -> Result<Uuid, StoreError> {
        self.check(EntityKind::Group)?;
        self.require_tenant(EntityKind::Group, group.tenant_id)?;
        let key = (group.tenant_id, group.id.clone());
        let stored = upsert(&mut self.state.groups, key, group.clone(), |old, new| {
            new.group_id = old.group_id
        });
        Ok(stored.group_id)
    }

    fn upsert_role(&mut self, role: &Role) -> Result<Uuid, StoreError> {
        self.check(EntityKind::Role)?;
        self.require_tenant(EntityKind::Role, role.tenant_id)?;
        let key = (role.tenant_id, role.id.clone());
        let stored = upsert(&mut self.state.roles, key, role.clone(), |old, new| {
            new.role_id = old.role_id
        });
        Ok(stored.role_id)
    }

    fn upsert_user(&mut self, user: &User) -> Result<Uuid, StoreError> {
        self.check(EntityKind::User)?;
        self.require_tenant(EntityKind::User, user.tenant_id)?;
        let key = (user.tenant_id, user.id.clone());
        let stored = upsert(&mut self.state.users, key, user.clone(), |old, new| {
            new.user_id = old.user_id
        });
        Ok(stored.user_id)
    }

    fn upsert_user_department(&mut self, link: &UserDepartmentLink) -> Result<(), StoreError> {
        self.check(EntityKind::UserDepartment)?;
        upsert(&mut self.state.user_departments, (link.user_id, link.department_id), link.clone(), |_, _| {});
        Ok(())
    }

    fn upsert_user_office_location(&mut self, link: &UserOfficeLocationLink) -> Result<(), StoreError> {
        self.check(EntityKind::UserOfficeLocation)?;
        upsert(
            &mut self.state.user_office_locations,
            (link.user_id, link.office_location_id),
            link.clone(),
            |_, _| {},
        );
        Ok(())
    }

    fn upsert_user_group(&mut self, link: &UserGroupLink) -> Result<(), StoreError> {
        self.check(EntityKind::UserGroup)?;
        upsert(&mut self.state.user_groups, (link.user_id, link.group_id), link.clone(), |_, _| {});
        Ok(())
    }

    fn upsert_user_role(&mut self, link: &UserRoleLink) -> Result<(), StoreError> {
        self.check(EntityKind::UserRole)?;
        upsert(&mut self.state.user_roles, (link.user_id, link.role_id), link.clone(), |_, _| {});
        Ok(())
    }
}

/// Canonical store held in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_on: Mutex<HashSet<EntityKind>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Make every later upsert of `kind` fail until cleared.
    pub fn fail_on(&self, kind: EntityKind) {
        if let Ok(mut kinds) = self.fail_on.lock() {
            kinds.insert(kind);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut kinds) = self.fail_on.lock() {
            kinds.clear();
        }
    }
}

impl TransactionalStore for MemoryStore {
    fn in_transaction(&self, work: &mut TransactionWork<'_>) -> Result<(), StoreError> {
        let fail_on = self
            .fail_on
            .lock()
            .map(|k| k.clone())
            .map_err(|_| StoreError::Connection("memory store poisoned".to_string()))?;
        let mut committed = self
            .state
            .lock()
            .map_err(|_| StoreError::Connection("memory store poisoned".to_string()))?;

        let mut working = committed.clone();
        let mut tx = MemoryTx {
            state: &mut working,
            fail_on: &fail_on,
        };
        work(&mut tx)?;
        *committed = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn tenant(id: Uuid) -> Tenant {
        Tenant {
            tenant_id: id,
            id: Some("T1".to_string()),
            name: None,
            subscriber_id: None,
            creation_time: None,
            enable_persona_via_background_tabs: None,
            enable_persona_via_forced_login: None,
            extension_enabled: None,
            is_active: true,
            extra_info: Map::new(),
        }
    }

    fn department(tenant_id: Uuid, name: &str) -> Department {
        Department {
            department_id: Uuid::new_v4(),
            tenant_id,
            id: name.to_string(),
            name: name.to_string(),
            is_active: true,
            extra_info: Map::new(),
        }
    }

    #[test]
    fn test_update_keeps_stored_id() {
        let store = MemoryStore::new();
        let t = Uuid::new_v4();
        let mut first_id = Uuid::nil();
        let mut second_id = Uuid::nil();

        store
            .in_transaction(&mut |tx| {
                tx.upsert_tenant(&tenant(t))?;
                first_id = tx.upsert_department(&department(t, "Eng"))?;
                Ok(())
            })
            .unwrap();
        store
            .in_transaction(&mut |tx| {
                second_id = tx.upsert_department(&department(t, "Eng"))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(store.snapshot().count(EntityKind::Department), 1);
    }

    #[test]
    fn test_failed_transaction_leaves_no_rows() {
        let store = MemoryStore::new();
        store.fail_on(EntityKind::Department);
        let t = Uuid::new_v4();

        let result = store.in_transaction(&mut |tx| {
            tx.upsert_tenant(&tenant(t))?;
            tx.upsert_department(&department(t, "Eng"))?;
            Ok(())
        });

        assert!(result.is_err());
        assert_eq!(store.snapshot().total(), 0);
    }

    #[test]
    fn test_missing_tenant_is_constraint_violation() {
        let store = MemoryStore::new();
        let err = store
            .in_transaction(&mut |tx| tx.upsert_department(&department(Uuid::new_v4(), "Eng")).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { kind: Some(EntityKind::Department), .. }));
    }
}
