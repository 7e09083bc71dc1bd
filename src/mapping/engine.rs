//! Rule-driven field mapping.
//!
//! For one (vendor, entity type, target entity) triple the engine loads the
//! ordered rule list and resolves every rule against the merged extraction
//! context: primary path, fallback paths, transform, coercion, default, and
//! finally tenant/instance injection from the message.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::builders::FromFieldValues;
use super::rule::{FieldMapping, MappingError};
use super::store::MappingRuleStore;
use crate::entity::{FieldValue, FieldValues};
use crate::extraction::{extract_array, lookup};
use crate::ids::resolve_opaque_id;
use crate::message::RawEntityMessage;
use crate::runtime::ExtractionContext;
use crate::transform_registry::TransformRegistry;

/// Per-message inputs shared by every mapping call for that message.
///
/// Tenant and instance identifiers are typed once here so that every entity
/// of one message carries the same owning tenant.
#[derive(Debug, Clone)]
pub struct MappingScope {
    pub vendor: String,
    pub entity_type: String,
    pub tenant_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub context: ExtractionContext,
}

impl MappingScope {
    pub fn from_message(message: &RawEntityMessage) -> Self {
        let instance_id = message
            .instance_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|raw| resolve_opaque_id("instance", Some(raw)));

        Self {
            vendor: message.vendor_tag(),
            entity_type: message.entity_type_tag(),
            tenant_id: resolve_opaque_id("tenant", message.tenant.as_deref()),
            instance_id,
            context: ExtractionContext::from_message(message),
        }
    }
}

/// Field-mapping interpreter over a rule store and a transform registry.
#[derive(Clone)]
pub struct FieldMappingEngine {
    rules: Arc<dyn MappingRuleStore>,
    transforms: Arc<TransformRegistry>,
}

impl FieldMappingEngine {
    pub fn new(rules: Arc<dyn MappingRuleStore>, transforms: Arc<TransformRegistry>) -> Self {
        Self { rules, transforms }
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// Resolve the field values of a single target entity.
    ///
    /// `Ok(None)` when no rules exist for the target: the entity is simply
    /// absent from the graph.
    pub fn map_entity(&self, scope: &MappingScope, target: &str) -> Result<Option<FieldValues>, MappingError> {
        let rules = self.rules.rules_for(&scope.vendor, &scope.entity_type, target)?;
        if rules.is_empty() {
            tracing::debug!(
                "No field mappings for vendor={}, entityType={}, targetEntity={}",
                scope.vendor,
                scope.entity_type,
                target
            );
            return Ok(None);
        }

        let mut values = FieldValues::new();

        for rule in &rules {
            let mut value = self
                .resolve(rule, &scope.context, None)
                .or_else(|| rule.default_field_value());

            if value.is_none() {
                value = match rule.target_field.as_str() {
                    "tenantId" => Some(FieldValue::Uuid(scope.tenant_id)),
                    "instanceId" => scope.instance_id.map(FieldValue::Uuid),
                    _ => None,
                };
            }

            match value {
                Some(v) => {
                    tracing::trace!("Mapped {}.{} = {} (from: {})", target, rule.target_field, v, rule.source_path);
                    values.set(rule.target_field.clone(), v);
                }
                None if rule.required => {
                    tracing::warn!(
                        "Required field {}.{} is null (source: {})",
                        target,
                        rule.target_field,
                        rule.source_path
                    );
                }
                None => {}
            }
        }

        Ok(Some(values))
    }

    /// Resolve one record per element of the array at `array_path`.
    ///
    /// Each element is mapped against the parent context plus `_element` and
    /// `_index`; `[*]` source paths read from the element itself. `tenantId`
    /// is always the message tenant.
    pub fn map_entity_list(
        &self,
        scope: &MappingScope,
        target: &str,
        array_path: &str,
    ) -> Result<Vec<FieldValues>, MappingError> {
        let rules = self.rules.rules_for(&scope.vendor, &scope.entity_type, target)?;
        if rules.is_empty() {
            tracing::debug!(
                "No field mappings for vendor={}, entityType={}, targetEntity={}",
                scope.vendor,
                scope.entity_type,
                target
            );
            return Ok(Vec::new());
        }

        let elements = extract_array(scope.context.document(), array_path);
        if elements.is_empty() {
            tracing::debug!("Array at path {} is empty (targetEntity: {})", array_path, target);
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(elements.len());
        for (index, element) in elements.iter().enumerate() {
            let element_context = scope.context.for_element(element, index);
            let mut values = FieldValues::new();

            for rule in &rules {
                let value = if rule.target_field == "tenantId" {
                    Some(FieldValue::Uuid(scope.tenant_id))
                } else {
                    self.resolve(rule, &element_context, Some(element))
                        .or_else(|| rule.default_field_value())
                };

                match value {
                    Some(v) => values.set(rule.target_field.clone(), v),
                    None if rule.required => tracing::warn!(
                        "Required field {}.{} is null at index {} (source: {})",
                        target,
                        rule.target_field,
                        index,
                        rule.source_path
                    ),
                    None => {}
                }
            }
            records.push(values);
        }

        tracing::debug!("Mapped {} {} records from {}", records.len(), target, array_path);
        Ok(records)
    }

    /// Map and build a single typed entity.
    pub fn map_record<T: FromFieldValues>(&self, scope: &MappingScope) -> Result<Option<T>, MappingError> {
        match self.map_entity(scope, T::NAME)? {
            Some(values) => Ok(Some(T::from_field_values(&values)?)),
            None => Ok(None),
        }
    }

    /// Map and build typed entities from an array. Elements that fail to
    /// build are logged and skipped.
    pub fn map_records<T: FromFieldValues>(
        &self,
        scope: &MappingScope,
        array_path: &str,
    ) -> Result<Vec<T>, MappingError> {
        let records = self.map_entity_list(scope, T::NAME, array_path)?;
        let mut entities = Vec::with_capacity(records.len());
        for (index, values) in records.iter().enumerate() {
            match T::from_field_values(values) {
                Ok(entity) => entities.push(entity),
                Err(e) => tracing::warn!("Skipping {} at index {}: {}", T::NAME, index, e),
            }
        }
        Ok(entities)
    }

    /// Extract, transform and coerce one rule.
    ///
    /// With an element, a rule whose primary path addresses the element only
    /// runs its transform when a value was found.
    fn resolve(&self, rule: &FieldMapping, context: &ExtractionContext, element: Option<&Value>) -> Option<FieldValue> {
        let element_rule = element.is_some() && rule.source_path.contains("[*]");

        let extracted = std::iter::once(&rule.source_path)
            .chain(rule.fallback_paths.iter())
            .filter(|p| !p.trim().is_empty())
            .find_map(|path| match element {
                Some(el) if path.contains("[*]") => from_element(el, path, rule),
                _ => context.extract(path, rule.data_type),
            });

        let value = match (&rule.transform, extracted) {
            (Some(_), None) if element_rule => return None,
            (Some(name), found) => {
                self.transforms
                    .apply(name, found.unwrap_or(Value::Null), rule.args(), context)
            }
            (None, found) => found?,
        };

        rule.data_type.coerce(&value)
    }
}

/// Value of an element path: the part after `[*]` resolved against the
/// element, or the element itself for a trailing `[*]`.
fn from_element(element: &Value, path: &str, rule: &FieldMapping) -> Option<Value> {
    let (_, rest) = path.split_once("[*]")?;
    let rest = rest.trim_start_matches('.');
    let raw = if rest.is_empty() {
        Some(element).filter(|v| !v.is_null())
    } else {
        lookup(element, rest)
    }?;
    rule.data_type.coerce(raw).map(|v| v.to_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Department, Group, User};
    use crate::ids::derive_id;
    use crate::mapping::rule::DataType;
    use crate::mapping::store::InMemoryRuleStore;
    use serde_json::json;

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

    fn engine(rules: Vec<FieldMapping>) -> FieldMappingEngine {
        let store = InMemoryRuleStore::from_rules(rules).unwrap();
        FieldMappingEngine::new(Arc::new(store), Arc::new(TransformRegistry::new()))
    }

    fn scope(data: Value) -> MappingScope {
        let message: RawEntityMessage = serde_json::from_value(json!({
            "vendor": "microsoft",
            "type": "users",
            "tenant": "T1",
            "data": data
        }))
        .unwrap();
        MappingScope::from_message(&message)
    }

    #[test]
    fn test_fallback_path_used_when_primary_absent() {
        let mut mail = rule("user", "mail", "data.mail");
        mail.fallback_paths = vec!["data.userPrincipalName".to_string()];
        let engine = engine(vec![mail]);

        let values = engine
            .map_entity(&scope(json!({"userPrincipalName": "a@x.com"})), "user")
            .unwrap()
            .unwrap();
        assert_eq!(values.text("mail").as_deref(), Some("a@x.com"));
    }

    #[test]
    fn test_no_rules_means_absent() {
        let engine = engine(vec![rule("user", "id", "data.id")]);
        assert!(engine.map_entity(&scope(json!({})), "role").unwrap().is_none());
        assert!(engine.map_entity_list(&scope(json!({})), "role", "data.roles").unwrap().is_empty());
    }

    #[test]
    fn test_transform_default_and_injection() {
        let mut mail = rule("user", "mail", "data.mail");
        mail.transform = Some("lowercase".to_string());
        let mut enabled = rule("user", "accountEnabled", "data.accountEnabled");
        enabled.data_type = DataType::Boolean;
        enabled.default_value = Some("true".to_string());
        let mut tenant = rule("user", "tenantId", "");
        tenant.data_type = DataType::Uuid;
        let unknown = {
            let mut r = rule("user", "jobTitle", "data.jobTitle");
            r.transform = Some("no_such_transform".to_string());
            r
        };
        let mut required = rule("user", "surname", "data.surname");
        required.required = true;

        let engine = engine(vec![rule("user", "id", "data.id"), tenant, mail, enabled, unknown, required]);
        let scope = scope(json!({"id": "U1", "mail": "A@X.COM", "jobTitle": "Dev"}));
        let values = engine.map_entity(&scope, "user").unwrap().unwrap();

        assert_eq!(values.text("mail").as_deref(), Some("a@x.com"));
        assert_eq!(values.boolean("accountEnabled"), Some(true));
        assert_eq!(values.text("jobTitle").as_deref(), Some("Dev"));
        assert!(!values.contains("surname"));

        let user: User = engine.map_record(&scope).unwrap().unwrap();
        assert_eq!(user.tenant_id, scope.tenant_id);
        assert_eq!(user.user_id, derive_id(scope.tenant_id, "", "U1"));
    }

    #[test]
    fn test_list_mapping_reads_elements() {
        let mut group_id = rule("group", "groupId", "data.groups[*].id");
        group_id.transform = Some("uuid_from_bytes".to_string());
        group_id.transform_args = Some(json!({"prefix": "group", "fields": ["tenant", "id"]}));
        let mut types = rule("group", "groupTypes", "data.groups[*].groupTypes");
        types.data_type = DataType::Array;

        let engine = engine(vec![
            rule("group", "id", "data.groups[*].id"),
            rule("group", "displayName", "data.groups[*].displayName"),
            group_id,
            types,
            rule("group", "tenantId", ""),
        ]);
        let scope = scope(json!({"groups": [
            {"id": "G1", "displayName": "Admins", "groupTypes": ["Unified"]},
            {"id": "G2"}
        ]}));

        let groups: Vec<Group> = engine.map_records(&scope, "data.groups").unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].display_name.as_deref(), Some("Admins"));
        assert_eq!(groups[0].group_types, vec!["Unified".to_string()]);
        assert_eq!(groups[1].display_name, None);
        assert_ne!(groups[0].group_id, groups[1].group_id);
        assert!(groups.iter().all(|g| g.tenant_id == scope.tenant_id));

        let again: Vec<Group> = engine.map_records(&scope, "data.groups").unwrap();
        assert_eq!(groups[0].group_id, again[0].group_id);
    }

    #[test]
    fn test_element_paths_resolve_without_touching_the_root() {
        let mut position = rule("group", "position", "_index");
        position.data_type = DataType::Integer;
        let mut label = rule("group", "label", "data.groups[*].id");
        label.transform = Some("concat".to_string());
        label.transform_args = Some(json!({"fields": ["tenant", "_element.id", "_index"], "separator": "/"}));

        let engine = engine(vec![rule("group", "id", "_element.id"), position, label]);
        let scope = scope(json!({"groups": [{"id": "G1"}, {"id": "G2"}]}));

        let records = engine.map_entity_list(&scope, "group", "data.groups").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].text("id").as_deref(), Some("G2"));
        assert_eq!(records[1].get("position"), Some(&FieldValue::Integer(1)));
        assert_eq!(records[1].text("label").as_deref(), Some("T1/G2/1"));
        assert!(scope.context.document().get("_element").is_none());
    }

    #[test]
    fn test_empty_array_maps_nothing() {
        let engine = engine(vec![rule("group", "id", "data.groups[*].id")]);
        let groups: Vec<Group> = engine.map_records(&scope(json!({"groups": []})), "data.groups").unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_scalar_array_elements() {
        let engine = engine(vec![rule("department", "name", "data.departments[*]"), rule("department", "tenantId", "")]);
        let scope = scope(json!({"departments": ["Eng", "Ops"]}));

        let departments: Vec<Department> = engine.map_records(&scope, "data.departments").unwrap();
        assert_eq!(departments.len(), 2);
        assert_eq!(departments[1].name, "Ops");
    }
}
