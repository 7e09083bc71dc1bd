//! Rule-driven strategy: every entity comes from the field-mapping engine.

use serde_json::Value;

use super::extra_info::{group_extra_info, role_extra_info, user_extra_info};
use super::{finish_graph, EntityTransformer, TransformOutcome, TransformerError};
use crate::entity::{
    Account, Application, Department, Group, Instance, OfficeLocation, Role, Tenant,
    TransformedEntityGraph, User,
};
use crate::extraction::as_text;
use crate::mapping::{FieldMappingEngine, FromFieldValues, MappingError, MappingScope};
use crate::message::RawEntityMessage;

pub const DYNAMIC_TRANSFORMER_VERSION: &str = "3.0-dynamic";

/// Vendor-agnostic strategy driven by mapping rules.
pub struct DynamicEntityTransformer {
    engine: FieldMappingEngine,
}

impl DynamicEntityTransformer {
    pub fn new(engine: FieldMappingEngine) -> Self {
        Self { engine }
    }

    /// One typed entity; a record that fails to build is logged and left out.
    fn single<T: FromFieldValues>(&self, scope: &MappingScope) -> Result<Option<T>, TransformerError> {
        match self.engine.map_record::<T>(scope) {
            Ok(entity) => Ok(entity),
            Err(MappingError::Entity(e)) => {
                tracing::warn!("Omitting {} from graph: {}", T::NAME, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Department or office from a scalar source field, present only when
    /// that field is non-blank.
    fn from_scalar<T: FromFieldValues>(
        &self,
        scope: &MappingScope,
        data: &Value,
        field: &str,
    ) -> Result<Vec<T>, TransformerError> {
        let present = data
            .get(field)
            .and_then(as_text)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Ok(Vec::new());
        }
        Ok(self.single::<T>(scope)?.into_iter().collect())
    }

    /// Tenant from the message itself when no tenant rule produced one.
    fn context_tenant(scope: &MappingScope, message: &RawEntityMessage) -> Tenant {
        Tenant {
            tenant_id: scope.tenant_id,
            id: message.tenant.clone(),
            name: None,
            subscriber_id: message.subscriber.clone(),
            creation_time: None,
            enable_persona_via_background_tabs: None,
            enable_persona_via_forced_login: None,
            extension_enabled: None,
            is_active: true,
            extra_info: Default::default(),
        }
    }
}

impl EntityTransformer for DynamicEntityTransformer {
    fn name(&self) -> &'static str {
        "DynamicEntityTransformer"
    }

    fn transform_users(&self, message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError> {
        tracing::debug!("Transforming user entity dynamically - vendor: {}", message.vendor);

        let data = &message.data;
        if !data.is_object() {
            return Ok(TransformOutcome::InvalidInput(
                "users payload must be a JSON object".to_string(),
            ));
        }

        let scope = MappingScope::from_message(message);
        let mut graph = TransformedEntityGraph::new();

        graph.tenant = Some(
            self.single::<Tenant>(&scope)?
                .unwrap_or_else(|| Self::context_tenant(&scope, message)),
        );
        graph.instance = self.single::<Instance>(&scope)?;
        graph.application = self.single::<Application>(&scope)?;
        graph.user = self.single::<User>(&scope)?;
        graph.account = self.single::<Account>(&scope)?;

        let Some(user) = graph.user.as_mut() else {
            return Ok(TransformOutcome::InvalidInput(format!(
                "no user could be mapped for vendor {}",
                scope.vendor
            )));
        };
        let primary = user.mail.clone().or_else(|| user.user_principal_name.clone());
        user.extra_info.extend(user_extra_info(data, primary.as_deref()));

        graph.departments = self.from_scalar::<Department>(&scope, data, "department")?;
        graph.office_locations = self.from_scalar::<OfficeLocation>(&scope, data, "officeLocation")?;

        graph.groups = self.engine.map_records::<Group>(&scope, "data.groups")?;
        graph.roles = self.engine.map_records::<Role>(&scope, "data.roles")?;

        // Elements that failed to build were skipped; match bags by natural key
        if let Some(Value::Array(nodes)) = data.get("groups") {
            for group in graph.groups.iter_mut() {
                if let Some(node) = nodes.iter().find(|n| n.get("id").and_then(as_text).as_deref() == Some(group.id.as_str())) {
                    group.extra_info.extend(group_extra_info(node));
                }
            }
        }
        if let Some(Value::Array(nodes)) = data.get("roles") {
            for role in graph.roles.iter_mut() {
                if let Some(node) = nodes.iter().find(|n| n.get("id").and_then(as_text).as_deref() == Some(role.id.as_str())) {
                    role.extra_info.extend(role_extra_info(node));
                }
            }
        }

        finish_graph(
            &mut graph,
            message,
            DYNAMIC_TRANSFORMER_VERSION,
            format!("{} API", scope.vendor),
            self.name(),
        );

        tracing::debug!(
            "Transformed user dynamically - EntityId: {}, Groups: {}, Roles: {}",
            graph.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
            graph.groups.len(),
            graph.roles.len()
        );
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
    use crate::mapping::{DataType, FieldMapping, InMemoryRuleStore};
    use crate::transform_registry::TransformRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn rule(target: &str, field: &str, path: &str) -> FieldMapping {
        FieldMapping {
            vendor: "microsoft".to_string(),
            entity_type: "users".to_string(),
            target_entity: target.to_string(),
            target_field: field.to_string(),
            source_path: path.to_string(),
            fallback_paths: vec![],
            data_type: DataType::String,
            transform: None,
            transform_args: None,
            default_value: None,
            required: false,
            priority: 0,
        }
    }

    fn transformer() -> DynamicEntityTransformer {
        let rules = vec![
            rule("tenant", "tenantId", ""),
            rule("tenant", "id", "tenant"),
            rule("user", "tenantId", ""),
            rule("user", "id", "data.id"),
            rule("user", "mail", "data.mail"),
            rule("department", "tenantId", ""),
            rule("department", "name", "data.department"),
            rule("group", "tenantId", ""),
            rule("group", "id", "data.groups[*].id"),
        ];
        let store = InMemoryRuleStore::from_rules(rules).unwrap();
        DynamicEntityTransformer::new(FieldMappingEngine::new(
            Arc::new(store),
            Arc::new(TransformRegistry::new()),
        ))
    }

    fn message(data: Value) -> RawEntityMessage {
        serde_json::from_value(json!({
            "vendor": "microsoft", "type": "users", "tenant": "T1", "data": data
        }))
        .unwrap()
    }

    #[test]
    fn test_users_graph() {
        let outcome = transformer()
            .transform(&message(json!({
                "id": "U1",
                "mail": "a@x.com",
                "department": "Eng",
                "groups": [{"id": "G1", "creationOptions": ["Team"]}]
            })))
            .unwrap();
        let TransformOutcome::Success(graph) = outcome else {
            panic!("expected success");
        };

        assert_eq!(graph.tenant.as_ref().unwrap().id.as_deref(), Some("T1"));
        assert_eq!(graph.user.as_ref().unwrap().mail.as_deref(), Some("a@x.com"));
        assert_eq!(graph.departments.len(), 1);
        assert_eq!(graph.departments[0].name, "Eng");
        assert!(graph.user_departments[0].is_primary);
        assert_eq!(graph.user_groups.len(), 1);
        assert_eq!(graph.groups[0].extra_info["creationOptions"], json!(["Team"]));
        assert_eq!(graph.metadata["transformerVersion"], json!(DYNAMIC_TRANSFORMER_VERSION));
    }

    #[test]
    fn test_blank_department_omitted() {
        let outcome = transformer()
            .transform_users(&message(json!({"id": "U1", "department": " ", "groups": []})))
            .unwrap();
        let graph = outcome.into_result().unwrap();
        assert!(graph.departments.is_empty());
        assert!(graph.user_departments.is_empty());
        assert!(graph.groups.is_empty());
    }

    #[test]
    fn test_missing_user_is_invalid_input() {
        let outcome = transformer().transform_users(&message(json!({"mail": "a@x.com"}))).unwrap();
        assert!(matches!(outcome, TransformOutcome::InvalidInput(_)));
    }

    #[test]
    fn test_apps_unimplemented() {
        let outcome = transformer().transform_apps(&message(json!({}))).unwrap();
        assert!(matches!(outcome, TransformOutcome::Unimplemented { operation: "apps", .. }));
    }
}
