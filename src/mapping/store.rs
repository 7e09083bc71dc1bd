//! Mapping rule sources.
//!
//! Rules are loaded, not compiled: either from YAML/JSON rule files or from
//! the `field_mappings` table. Every source answers with the rules for one
//! (vendor, entity type, target entity) triple in ascending priority.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::rule::{FieldMapping, MappingError};

/// Source of field mapping rules.
pub trait MappingRuleStore: Send + Sync {
    /// Rules for one target entity, ordered by ascending priority.
    fn rules_for(
        &self,
        vendor: &str,
        entity_type: &str,
        target_entity: &str,
    ) -> Result<Vec<FieldMapping>, MappingError>;
}

/// Rule files hold either a bare list or a `mappings:` wrapper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Wrapped { mappings: Vec<FieldMapping> },
    Bare(Vec<FieldMapping>),
}

impl RuleFile {
    fn into_rules(self) -> Vec<FieldMapping> {
        match self {
            RuleFile::Wrapped { mappings } => mappings,
            RuleFile::Bare(rules) => rules,
        }
    }
}

type RuleKey = (String, String, String);

fn rule_key(vendor: &str, entity_type: &str, target_entity: &str) -> RuleKey {
    (
        vendor.trim().to_lowercase(),
        entity_type.trim().to_lowercase(),
        target_entity.trim().to_lowercase(),
    )
}

/// Rules held in memory, grouped by target triple.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuleStore {
    rules: HashMap<RuleKey, Vec<FieldMapping>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from rules; invalid rules are rejected.
    pub fn from_rules(rules: Vec<FieldMapping>) -> Result<Self, MappingError> {
        let mut store = Self::new();
        for rule in rules {
            store.add(rule)?;
        }
        Ok(store)
    }

    /// Load one rule file, or every `.yaml`/`.yml`/`.json` file in a directory.
    ///
    /// # Example
    /// ```ignore
    /// let store = InMemoryRuleStore::load("config/mappings")?;
    /// let rules = store.rules_for("microsoft", "users", "user")?;
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let mut store = Self::new();

        if path.is_dir() {
            let entries = fs::read_dir(path).map_err(|e| MappingError::Io {
                path: path.display().to_string(),
                source: e,
            })?;

            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| MappingError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
                let file = entry.path();
                if is_rule_file(&file) {
                    files.push(file);
                }
            }
            // Directory order is unspecified; equal priorities must load deterministically
            files.sort();

            for file in files {
                for rule in load_rule_file(&file)? {
                    store.add(rule)?;
                }
            }
        } else {
            for rule in load_rule_file(path)? {
                store.add(rule)?;
            }
        }

        tracing::info!(
            "Loaded {} mapping rules for {} targets from {}",
            store.rule_count(),
            store.rules.len(),
            path.display()
        );
        Ok(store)
    }

    /// Add a rule, keeping its group sorted by priority (stable for ties).
    pub fn add(&mut self, rule: FieldMapping) -> Result<(), MappingError> {
        rule.validate()?;
        let key = rule_key(&rule.vendor, &rule.entity_type, &rule.target_entity);
        let group = self.rules.entry(key).or_default();
        group.push(rule);
        group.sort_by_key(|r| r.priority);
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Every (vendor, entity type, target entity) triple with rules, sorted.
    pub fn targets(&self) -> Vec<(String, String, String)> {
        let mut keys: Vec<_> = self.rules.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl MappingRuleStore for InMemoryRuleStore {
    fn rules_for(
        &self,
        vendor: &str,
        entity_type: &str,
        target_entity: &str,
    ) -> Result<Vec<FieldMapping>, MappingError> {
        Ok(self
            .rules
            .get(&rule_key(vendor, entity_type, target_entity))
            .cloned()
            .unwrap_or_default())
    }
}

fn is_rule_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Parse one rule file without validating its rules.
pub fn load_rule_file(path: &Path) -> Result<Vec<FieldMapping>, MappingError> {
    let contents = fs::read_to_string(path).map_err(|e| MappingError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let parsed: RuleFile = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&contents).map_err(|e| MappingError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&contents).map_err(|e| MappingError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
    };

    Ok(parsed.into_rules())
}

#[cfg(feature = "postgres")]
pub use pg::PgRuleStore;

#[cfg(feature = "postgres")]
mod pg {
    use diesel::prelude::*;
    use diesel::sql_types::{Bool, Integer, Nullable, Text};

    use super::{MappingError, MappingRuleStore};
    use crate::diesel_runtime::Pool;
    use crate::mapping::rule::FieldMapping;

    #[derive(QueryableByName)]
    struct FieldMappingRow {
        #[diesel(sql_type = Text)]
        vendor: String,
        #[diesel(sql_type = Text)]
        entity_type: String,
        #[diesel(sql_type = Text)]
        target_entity: String,
        #[diesel(sql_type = Text)]
        target_field: String,
        #[diesel(sql_type = Text)]
        source_path: String,
        #[diesel(sql_type = Nullable<Text>)]
        fallback_paths: Option<String>,
        #[diesel(sql_type = Text)]
        data_type: String,
        #[diesel(sql_type = Nullable<Text>)]
        transform_name: Option<String>,
        #[diesel(sql_type = Nullable<Text>)]
        transform_args: Option<String>,
        #[diesel(sql_type = Nullable<Text>)]
        default_value: Option<String>,
        #[diesel(sql_type = Bool)]
        required: bool,
        #[diesel(sql_type = Integer)]
        priority: i32,
    }

    impl FieldMappingRow {
        fn into_rule(self) -> Result<FieldMapping, MappingError> {
            let describe = format!("{}/{}/{}.{}", self.vendor, self.entity_type, self.target_entity, self.target_field);
            let invalid = |reason: String| MappingError::InvalidRule {
                rule: describe.clone(),
                reason,
            };

            let fallback_paths = match self.fallback_paths.as_deref().map(str::trim) {
                None | Some("") => Vec::new(),
                Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                    .map_err(|e| invalid(format!("fallback_paths: {}", e)))?,
            };
            let transform_args = match self.transform_args.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(raw) => Some(
                    serde_json::from_str(raw).map_err(|e| invalid(format!("transform_args: {}", e)))?,
                ),
            };

            Ok(FieldMapping {
                vendor: self.vendor,
                entity_type: self.entity_type,
                target_entity: self.target_entity,
                target_field: self.target_field,
                source_path: self.source_path,
                fallback_paths,
                data_type: self.data_type.parse()?,
                transform: self.transform_name.filter(|t| !t.trim().is_empty()),
                transform_args,
                default_value: self.default_value,
                required: self.required,
                priority: self.priority,
            })
        }
    }

    /// Rules read from the `field_mappings` table on every lookup.
    pub struct PgRuleStore {
        pool: Pool,
    }

    impl PgRuleStore {
        pub fn new(pool: Pool) -> Self {
            Self { pool }
        }
    }

    impl MappingRuleStore for PgRuleStore {
        fn rules_for(
            &self,
            vendor: &str,
            entity_type: &str,
            target_entity: &str,
        ) -> Result<Vec<FieldMapping>, MappingError> {
            let mut conn = self
                .pool
                .get()
                .map_err(|e| MappingError::Store(e.to_string()))?;

            let rows: Vec<FieldMappingRow> = diesel::sql_query(
                "SELECT vendor, entity_type, target_entity, target_field, source_path, \
                 fallback_paths, data_type, transform_name, transform_args, default_value, \
                 required, priority \
                 FROM field_mappings \
                 WHERE lower(vendor) = lower($1) AND lower(entity_type) = lower($2) \
                 AND lower(target_entity) = lower($3) AND is_active \
                 ORDER BY priority ASC, id ASC",
            )
            .bind::<Text, _>(vendor)
            .bind::<Text, _>(entity_type)
            .bind::<Text, _>(target_entity)
            .load(&mut conn)
            .map_err(|e| MappingError::Store(e.to_string()))?;

            rows.into_iter().map(FieldMappingRow::into_rule).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const USER_RULES: &str = r#"
mappings:
  - vendor: microsoft
    entity_type: users
    target_entity: user
    target_field: mail
    source_path: data.mail
    transform: lowercase
    priority: 20
  - vendor: microsoft
    entity_type: users
    target_entity: user
    target_field: id
    source_path: data.id
    required: true
    priority: 10
"#;

    #[test]
    fn test_load_yaml_file_sorted_by_priority() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(USER_RULES.as_bytes()).unwrap();

        let store = InMemoryRuleStore::load(file.path()).unwrap();
        let rules = store.rules_for("Microsoft", "USERS", "user").unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].target_field, "id");
        assert_eq!(rules[1].target_field, "mail");
        assert!(store.rules_for("okta", "users", "user").unwrap().is_empty());
    }

    #[test]
    fn test_load_directory_mixes_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("users.yaml"), USER_RULES).unwrap();
        fs::write(
            dir.path().join("groups.json"),
            r#"[{"vendor":"microsoft","entity_type":"users","target_entity":"group",
                 "target_field":"id","source_path":"data.groups[*].id"}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let store = InMemoryRuleStore::load(dir.path()).unwrap();

        assert_eq!(store.rule_count(), 3);
        assert_eq!(store.targets().len(), 2);
        assert_eq!(store.rules_for("microsoft", "users", "group").unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(
            b"- vendor: okta\n  entity_type: users\n  target_entity: user\n  target_field: ''\n  source_path: data.id\n",
        )
        .unwrap();

        let err = InMemoryRuleStore::load(file.path()).unwrap_err();
        assert!(matches!(err, MappingError::InvalidRule { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = InMemoryRuleStore::load("/nonexistent/rules.yaml").unwrap_err();
        assert!(matches!(err, MappingError::Io { .. }));
    }
}
