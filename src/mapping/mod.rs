//! Rule-driven field mapping.
//!
//! Mapping rules are data: they are loaded from rule files or the
//! `field_mappings` table and interpreted by [`FieldMappingEngine`] against
//! the merged extraction context of one raw message. Typed records are then
//! assembled by the per-entity builders in [`builders`].

pub mod builders;
pub mod engine;
pub mod rule;
pub mod store;

pub use builders::FromFieldValues;
pub use engine::{FieldMappingEngine, MappingScope};
pub use rule::{DataType, FieldMapping, MappingError};
pub use store::{load_rule_file, InMemoryRuleStore, MappingRuleStore};

#[cfg(feature = "postgres")]
pub use store::PgRuleStore;
