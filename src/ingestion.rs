//! Transactional persistence of one entity graph.
//!
//! Upsert order is fixed because later rows reference earlier ones:
//!
//! tenant → instance → application → account → departments → offices →
//! groups → roles → user → user/department, user/office, user/group and
//! user/role links.
//!
//! Every upsert answers with the identifier the store holds. Provisional
//! identifiers from transformation are remapped per entity kind, and every
//! foreign key written later goes through those maps. A key missing from its
//! map passes through unchanged, referencing a row persisted earlier.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::diesel_runtime::{EntityKind, EntityStore, StoreError, TransactionalStore};
use crate::entity::TransformedEntityGraph;

/// Error type for graph ingestion
#[derive(Debug)]
pub enum IngestError {
    /// The graph cannot be persisted as given
    InvalidGraph(String),
    /// The transaction was rolled back
    Store(StoreError),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Store(e) if e.is_transient())
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::InvalidGraph(reason) => write!(f, "Invalid entity graph: {}", reason),
            IngestError::Store(e) => write!(f, "Ingestion rolled back: {}", e),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::Store(e) => Some(e),
            IngestError::InvalidGraph(_) => None,
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Store(err)
    }
}

/// Row counts written by one successful ingest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub counts: HashMap<EntityKind, usize>,
}

impl IngestReport {
    fn record(&mut self, kind: EntityKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Provisional → assigned identifier maps, one per referenced kind.
#[derive(Debug, Default)]
struct IdRemap {
    tenants: HashMap<Uuid, Uuid>,
    instances: HashMap<Uuid, Uuid>,
    departments: HashMap<Uuid, Uuid>,
    offices: HashMap<Uuid, Uuid>,
    groups: HashMap<Uuid, Uuid>,
    roles: HashMap<Uuid, Uuid>,
    users: HashMap<Uuid, Uuid>,
}

fn resolve(map: &HashMap<Uuid, Uuid>, id: Uuid) -> Uuid {
    map.get(&id).copied().unwrap_or(id)
}

/// Persists entity graphs through a [`TransactionalStore`].
#[derive(Clone)]
pub struct IngestionCoordinator {
    store: Arc<dyn TransactionalStore>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Upsert the whole graph in one transaction. On error nothing from the
    /// graph is persisted.
    pub fn ingest(&self, graph: &TransformedEntityGraph) -> Result<IngestReport, IngestError> {
        if graph.tenant.is_none() {
            return Err(IngestError::InvalidGraph("graph has no tenant".to_string()));
        }

        let mut report = IngestReport::default();
        self.store.in_transaction(&mut |store| {
            report = IngestReport::default();
            write_graph(store, graph, &mut report)
        })?;

        tracing::debug!(
            "Ingested graph for user {}: {} rows",
            graph.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
            report.total()
        );
        Ok(report)
    }
}

fn write_graph(
    store: &mut dyn EntityStore,
    graph: &TransformedEntityGraph,
    report: &mut IngestReport,
) -> Result<(), StoreError> {
    let mut ids = IdRemap::default();

    if let Some(tenant) = &graph.tenant {
        let assigned = store.upsert_tenant(tenant)?;
        ids.tenants.insert(tenant.tenant_id, assigned);
        report.record(EntityKind::Tenant);
    }

    if let Some(instance) = &graph.instance {
        let mut row = instance.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        let assigned = store.upsert_instance(&row)?;
        ids.instances.insert(instance.instance_id, assigned);
        report.record(EntityKind::Instance);
    }

    if let Some(application) = &graph.application {
        store.upsert_application(application)?;
        report.record(EntityKind::Application);
    }

    if let Some(account) = &graph.account {
        let mut row = account.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        store.upsert_account(&row)?;
        report.record(EntityKind::Account);
    }

    for department in &graph.departments {
        let mut row = department.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        let assigned = store.upsert_department(&row)?;
        ids.departments.insert(department.department_id, assigned);
        report.record(EntityKind::Department);
    }

    for office in &graph.office_locations {
        let mut row = office.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        let assigned = store.upsert_office_location(&row)?;
        ids.offices.insert(office.office_location_id, assigned);
        report.record(EntityKind::OfficeLocation);
    }

    for group in &graph.groups {
        let mut row = group.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        let assigned = store.upsert_group(&row)?;
        ids.groups.insert(group.group_id, assigned);
        report.record(EntityKind::Group);
    }

    for role in &graph.roles {
        let mut row = role.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        let assigned = store.upsert_role(&row)?;
        ids.roles.insert(role.role_id, assigned);
        report.record(EntityKind::Role);
    }

    if let Some(user) = &graph.user {
        let mut row = user.clone();
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        row.instance_id = row.instance_id.map(|id| resolve(&ids.instances, id));
        let assigned = store.upsert_user(&row)?;
        ids.users.insert(user.user_id, assigned);
        report.record(EntityKind::User);
    }

    for link in &graph.user_departments {
        let mut row = link.clone();
        row.user_id = resolve(&ids.users, row.user_id);
        row.department_id = resolve(&ids.departments, row.department_id);
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        store.upsert_user_department(&row)?;
        report.record(EntityKind::UserDepartment);
    }

    for link in &graph.user_office_locations {
        let mut row = link.clone();
        row.user_id = resolve(&ids.users, row.user_id);
        row.office_location_id = resolve(&ids.offices, row.office_location_id);
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        store.upsert_user_office_location(&row)?;
        report.record(EntityKind::UserOfficeLocation);
    }

    for link in &graph.user_groups {
        let mut row = link.clone();
        row.user_id = resolve(&ids.users, row.user_id);
        row.group_id = resolve(&ids.groups, row.group_id);
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        store.upsert_user_group(&row)?;
        report.record(EntityKind::UserGroup);
    }

    for link in &graph.user_roles {
        let mut row = link.clone();
        row.user_id = resolve(&ids.users, row.user_id);
        row.role_id = resolve(&ids.roles, row.role_id);
        row.tenant_id = resolve(&ids.tenants, row.tenant_id);
        store.upsert_user_role(&row)?;
        report.record(EntityKind::UserRole);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diesel_runtime::MemoryStore;
    use crate::transformer::{EntityTransformer, MicrosoftEntityTransformer};
    use serde_json::{json, Value};

    fn graph(data: Value) -> TransformedEntityGraph {
        let message = serde_json::from_value(json!({
            "vendor": "microsoft", "type": "users", "tenant": "T1", "data": data
        }))
        .unwrap();
        MicrosoftEntityTransformer::new()
            .transform(&message)
            .unwrap()
            .into_result()
            .unwrap()
    }

    fn full_graph() -> TransformedEntityGraph {
        graph(json!({
            "id": "U1",
            "mail": "a@x.com",
            "department": "Eng",
            "officeLocation": "HQ",
            "groups": [{"id": "G1"}, {"id": "G2"}],
            "roles": [{"id": "R1"}]
        }))
    }

    #[test]
    fn test_ingest_writes_every_kind() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IngestionCoordinator::new(store.clone());

        let report = coordinator.ingest(&full_graph()).unwrap();
        let state = store.snapshot();

        assert_eq!(report.count(EntityKind::Group), 2);
        assert_eq!(state.count(EntityKind::UserGroup), 2);
        assert_eq!(state.count(EntityKind::Department), 1);
        assert_eq!(state.count(EntityKind::Account), 1);
        assert_eq!(report.total(), state.total());
    }

    #[test]
    fn test_ingest_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IngestionCoordinator::new(store.clone());
        let graph = full_graph();

        coordinator.ingest(&graph).unwrap();
        let once = store.snapshot();
        coordinator.ingest(&graph).unwrap();
        let twice = store.snapshot();

        assert_eq!(once.total(), twice.total());
        let records = |s: &crate::diesel_runtime::MemoryState| {
            s.departments.values().map(|d| d.record.clone()).collect::<Vec<_>>()
        };
        assert_eq!(records(&once), records(&twice));
    }

    #[test]
    fn test_links_follow_assigned_ids() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IngestionCoordinator::new(store.clone());
        let first = full_graph();
        coordinator.ingest(&first).unwrap();

        // Same natural keys, different provisional ids
        let mut second = full_graph();
        for department in &mut second.departments {
            department.department_id = Uuid::new_v4();
        }
        second.link_user();
        coordinator.ingest(&second).unwrap();

        let state = store.snapshot();
        assert_eq!(state.count(EntityKind::Department), 1);
        assert_eq!(state.count(EntityKind::UserDepartment), 1);
        let link = state.user_departments.values().next().unwrap();
        assert_eq!(link.record.department_id, first.departments[0].department_id);
    }

    #[test]
    fn test_failure_rolls_back_whole_graph() {
        let store = Arc::new(MemoryStore::new());
        store.fail_on(EntityKind::Role);
        let coordinator = IngestionCoordinator::new(store.clone());

        let err = coordinator.ingest(&full_graph()).unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));
        assert!(!err.is_transient());
        assert_eq!(store.snapshot().total(), 0);
    }

    #[test]
    fn test_empty_groups_ingest_no_group_rows() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IngestionCoordinator::new(store.clone());

        let report = coordinator.ingest(&graph(json!({"id": "U1", "groups": []}))).unwrap();
        assert_eq!(report.count(EntityKind::Group), 0);
        assert_eq!(report.count(EntityKind::UserGroup), 0);
        assert_eq!(report.count(EntityKind::User), 1);
    }

    #[test]
    fn test_graph_without_tenant_rejected() {
        let coordinator = IngestionCoordinator::new(Arc::new(MemoryStore::new()));
        let err = coordinator.ingest(&TransformedEntityGraph::new()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidGraph(_)));
    }
}
