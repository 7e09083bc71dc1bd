//! Vendor strategies that turn one raw message into a canonical entity graph.
//!
//! A strategy either interprets mapping rules ([`dynamic`]) or hand-codes a
//! fixed vendor schema ([`microsoft`]). Both produce the same graph shape.
//! [`factory::TransformerFactory`] routes a message to the strategy
//! registered for its vendor.

pub mod dynamic;
pub mod extra_info;
pub mod factory;
pub mod microsoft;
pub mod stubs;

use std::fmt;

use chrono::Utc;
use serde_json::{json, Value};

use crate::entity::TransformedEntityGraph;
use crate::mapping::MappingError;
use crate::message::{EntityType, RawEntityMessage};

pub use dynamic::DynamicEntityTransformer;
pub use factory::{registration, TransformerFactory};
pub use microsoft::MicrosoftEntityTransformer;
pub use stubs::UnimplementedTransformer;

/// Result of one strategy operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Success(TransformedEntityGraph),
    /// The strategy does not implement this operation
    Unimplemented { vendor: String, operation: &'static str },
    /// The message cannot be transformed by this strategy
    InvalidInput(String),
}

impl TransformOutcome {
    /// Convert to a result, turning non-success outcomes into errors.
    pub fn into_result(self) -> Result<TransformedEntityGraph, TransformerError> {
        match self {
            TransformOutcome::Success(graph) => Ok(graph),
            TransformOutcome::Unimplemented { vendor, operation } => {
                Err(TransformerError::Unimplemented { vendor, operation })
            }
            TransformOutcome::InvalidInput(reason) => Err(TransformerError::InvalidInput(reason)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransformOutcome::Success(_))
    }
}

/// Error type for strategies and routing
#[derive(Debug)]
pub enum TransformerError {
    /// No strategy is registered for the vendor tag
    UnsupportedVendor { vendor: String, known: Vec<String> },
    UnsupportedEntityType { vendor: String, entity_type: String },
    Unimplemented { vendor: String, operation: &'static str },
    InvalidInput(String),
    /// Rule store failure while mapping
    Mapping(MappingError),
}

impl fmt::Display for TransformerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformerError::UnsupportedVendor { vendor, known } => write!(
                f,
                "Unsupported vendor '{}'. Available vendors: [{}]",
                vendor,
                known.join(", ")
            ),
            TransformerError::UnsupportedEntityType { vendor, entity_type } => write!(
                f,
                "Entity type '{}' not supported for vendor {}",
                entity_type, vendor
            ),
            TransformerError::Unimplemented { vendor, operation } => {
                write!(f, "{} {} transformation not yet implemented", vendor, operation)
            }
            TransformerError::InvalidInput(reason) => write!(f, "Invalid input: {}", reason),
            TransformerError::Mapping(e) => write!(f, "Mapping failed: {}", e),
        }
    }
}

impl std::error::Error for TransformerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransformerError::Mapping(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MappingError> for TransformerError {
    fn from(err: MappingError) -> Self {
        TransformerError::Mapping(err)
    }
}

/// Per-vendor transformation strategy.
pub trait EntityTransformer: Send + Sync {
    /// Short strategy name for logs and graph metadata
    fn name(&self) -> &'static str;

    fn transform_users(&self, message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError>;

    fn transform_apps(&self, message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError>;

    /// Dispatch on the message's entity type.
    fn transform(&self, message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError> {
        match message.entity_type_tag().parse::<EntityType>() {
            Ok(EntityType::Users) => self.transform_users(message),
            Ok(EntityType::Apps) => self.transform_apps(message),
            Err(_) => Err(TransformerError::UnsupportedEntityType {
                vendor: message.vendor_tag(),
                entity_type: message.entity_type.clone(),
            }),
        }
    }
}

/// Link the user to every entity list and record transformer metadata.
pub(crate) fn finish_graph(
    graph: &mut TransformedEntityGraph,
    message: &RawEntityMessage,
    version: &str,
    source_system: String,
    transformed_by: &str,
) {
    graph.link_user();

    let counts = json!({
        "tenant": graph.tenant.is_some() as u8,
        "instance": graph.instance.is_some() as u8,
        "application": graph.application.is_some() as u8,
        "account": graph.account.is_some() as u8,
        "user": graph.user.is_some() as u8,
        "departments": graph.departments.len(),
        "officeLocations": graph.office_locations.len(),
        "groups": graph.groups.len(),
        "roles": graph.roles.len(),
    });

    let metadata = &mut graph.metadata;
    metadata.insert("transformerVersion".to_string(), Value::from(version));
    metadata.insert("sourceSystem".to_string(), Value::String(source_system));
    metadata.insert("transformedBy".to_string(), Value::from(transformed_by));
    metadata.insert("entitiesExtracted".to_string(), counts);
    metadata.insert("vendor".to_string(), Value::String(message.vendor_tag()));
    metadata.insert("entityType".to_string(), Value::String(message.entity_type_tag()));
    metadata.insert("transformedAt".to_string(), Value::String(Utc::now().to_rfc3339()));
    if let Some(user) = &graph.user {
        metadata.insert("entityId".to_string(), Value::String(user.id.clone()));
    }
    if let Some(ts) = message.timestamp {
        metadata.insert("originalTimestamp".to_string(), Value::String(ts.to_rfc3339()));
    }
}
