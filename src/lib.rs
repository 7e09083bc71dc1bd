//! # entity-fabric: identity-provider change-event ingestion
//!
//! entity-fabric consumes identity-provider change events (users, groups,
//! roles, departments, offices) from a partitioned message stream, turns the
//! vendor JSON into a canonical entity graph and persists that graph in one
//! transaction.
//!
//! ## Pipeline
//!
//! - **Batch consumption** ([`consumer`], [`nats`]): a fixed worker pool
//!   polls bounded batches, retries failed batches with backoff, commits
//!   offsets only after a batch was handled and dead-letters records that
//!   cannot succeed.
//! - **Field mapping** ([`mapping`], [`extraction`], [`transform_registry`]):
//!   externally stored rules extract values by path, apply named transforms
//!   and assemble typed records.
//! - **Strategies** ([`transformer`]): per-vendor builders of the full
//!   [`TransformedEntityGraph`], routed by vendor tag.
//! - **Ingestion** ([`ingestion`], [`diesel_runtime`]): upserts the graph in
//!   dependency order, remapping provisional identifiers to stored ones.
//!
//! ## Example: mapping rule
//!
//! ```yaml
//! mappings:
//!   - vendor: microsoft
//!     entity_type: users
//!     target_entity: user
//!     target_field: mail
//!     source_path: data.mail
//!     fallback_paths: [data.userPrincipalName]
//!     data_type: STRING
//!     transform: lowercase
//!     priority: 10
//! ```

// Core model
pub mod entity;
pub mod ids;
pub mod message;

// Field extraction and transforms
pub mod extraction;
pub mod transform_registry;
pub mod transforms;

// Mapping context shared by the engine and the strategies
pub mod runtime;

// Rule-driven field mapping
pub mod mapping;

// Vendor strategies and routing
pub mod transformer;

// Persistence
pub mod diesel_runtime;
pub mod ingestion;

// Consumption engine and NATS JetStream adapter
pub mod consumer;
pub mod nats;

// Configuration, output and entry points
pub mod config;
pub mod output;
pub mod processing;
pub mod serialization;

// Re-export key types
pub use entity::{Entity, EntityError, FieldValue, FieldValues, TransformedEntityGraph};
pub use extraction::{extract, extract_array, FieldPath, PathError};
pub use message::{EntityType, MessageError, RawEntityMessage, VendorType};
pub use transform_registry::{TransformError, TransformRegistry};

pub use mapping::{FieldMapping, FieldMappingEngine, InMemoryRuleStore, MappingError, MappingRuleStore};
pub use transformer::{EntityTransformer, TransformOutcome, TransformerError, TransformerFactory};

pub use diesel_runtime::{EntityKind, EntityStore, MemoryStore, StoreError, TransactionalStore};
pub use ingestion::{IngestError, IngestReport, IngestionCoordinator};

pub use consumer::{BatchHandler, MemoryBroker, WorkerPool, WorkerSettings};
pub use nats::{JetStreamConnector, JetStreamDlq, NatsConfig};

pub use config::{ConfigCache, ConfigError, FabricConfig, OutputMode, StrategyKind, TransformerConfig};
pub use output::{DatabaseSink, LogSink, OutputSink};
pub use processing::{EntityProcessor, ProcessingError};

#[cfg(feature = "postgres")]
pub use diesel_runtime::{Database, DatabaseConfig, PgEntityStore};
