//! Vendor routing table.
//!
//! Built once at startup and read-only afterwards; every worker shares one
//! factory behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    DynamicEntityTransformer, EntityTransformer, MicrosoftEntityTransformer, TransformerError,
    UnimplementedTransformer,
};
use crate::config::{StrategyKind, TransformerConfig};
use crate::entity::TransformedEntityGraph;
use crate::mapping::FieldMappingEngine;
use crate::message::{RawEntityMessage, VendorType};

/// One routing entry.
pub fn registration<T>(vendor: VendorType, transformer: T) -> (VendorType, Arc<dyn EntityTransformer>)
where
    T: EntityTransformer + 'static,
{
    (vendor, Arc::new(transformer))
}

/// Maps each vendor tag to exactly one strategy.
pub struct TransformerFactory {
    transformers: HashMap<VendorType, Arc<dyn EntityTransformer>>,
}

impl TransformerFactory {
    /// Build the routing table. A vendor registered twice keeps the last
    /// strategy.
    pub fn new(registrations: Vec<(VendorType, Arc<dyn EntityTransformer>)>) -> Self {
        let mut transformers: HashMap<VendorType, Arc<dyn EntityTransformer>> = HashMap::new();
        for (vendor, transformer) in registrations {
            if let Some(previous) = transformers.insert(vendor, transformer.clone()) {
                tracing::warn!(
                    "Duplicate transformer for vendor {}: {} replaced by {}",
                    vendor,
                    previous.name(),
                    transformer.name()
                );
            }
        }
        tracing::info!("Registered transformers for vendors: {:?}", Self::sorted_tags(&transformers));
        Self { transformers }
    }

    /// Standard registrations: Microsoft by the configured strategy, the
    /// remaining vendors as stubs.
    pub fn from_config(config: &TransformerConfig, engine: FieldMappingEngine) -> Self {
        let microsoft = match config.microsoft_strategy {
            StrategyKind::Dynamic => {
                registration(VendorType::Microsoft, DynamicEntityTransformer::new(engine))
            }
            StrategyKind::Static => registration(VendorType::Microsoft, MicrosoftEntityTransformer::new()),
        };
        let mut registrations = vec![microsoft];
        for vendor in [VendorType::Okta, VendorType::PingIdp, VendorType::Ollama] {
            registrations.push(registration(vendor, UnimplementedTransformer::new(vendor)));
        }
        Self::new(registrations)
    }

    fn sorted_tags(transformers: &HashMap<VendorType, Arc<dyn EntityTransformer>>) -> Vec<String> {
        let mut tags: Vec<String> = transformers.keys().map(|v| v.to_string()).collect();
        tags.sort();
        tags
    }

    /// Strategy for a vendor tag (case-insensitive).
    pub fn get(&self, vendor: &str) -> Result<Arc<dyn EntityTransformer>, TransformerError> {
        vendor
            .parse::<VendorType>()
            .ok()
            .and_then(|v| self.transformers.get(&v).cloned())
            .ok_or_else(|| TransformerError::UnsupportedVendor {
                vendor: vendor.to_string(),
                known: self.registered_vendors(),
            })
    }

    /// Route a message and unwrap the outcome.
    pub fn transform(&self, message: &RawEntityMessage) -> Result<TransformedEntityGraph, TransformerError> {
        let transformer = self.get(&message.vendor)?;
        tracing::debug!(
            "Routing {} {} message to {}",
            message.vendor_tag(),
            message.entity_type_tag(),
            transformer.name()
        );
        transformer.transform(message)?.into_result()
    }

    pub fn registered_vendors(&self) -> Vec<String> {
        Self::sorted_tags(&self.transformers)
    }

    pub fn has_transformer(&self, vendor: &str) -> bool {
        self.get(vendor).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::TransformOutcome;
    use serde_json::json;

    fn message(vendor: &str) -> RawEntityMessage {
        serde_json::from_value(json!({
            "vendor": vendor, "type": "users", "tenant": "T1",
            "data": {"id": "U1", "mail": "a@x.com"}
        }))
        .unwrap()
    }

    fn factory() -> TransformerFactory {
        TransformerFactory::new(vec![
            registration(VendorType::Microsoft, MicrosoftEntityTransformer::new()),
            registration(VendorType::Okta, UnimplementedTransformer::new(VendorType::Okta)),
        ])
    }

    #[test]
    fn test_unsupported_vendor_names_known_vendors() {
        let err = factory().transform(&message("foo")).unwrap_err();
        match &err {
            TransformerError::UnsupportedVendor { vendor, known } => {
                assert_eq!(vendor, "foo");
                assert_eq!(known, &vec!["microsoft".to_string(), "okta".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("microsoft, okta"));
    }

    #[test]
    fn test_known_but_unregistered_vendor() {
        assert!(!factory().has_transformer("ollama"));
        assert!(factory().has_transformer("MICROSOFT"));
    }

    #[test]
    fn test_duplicate_registration_keeps_last() {
        let factory = TransformerFactory::new(vec![
            registration(VendorType::Microsoft, MicrosoftEntityTransformer::new()),
            registration(VendorType::Microsoft, UnimplementedTransformer::new(VendorType::Microsoft)),
        ]);
        let outcome = factory.get("microsoft").unwrap().transform(&message("microsoft")).unwrap();
        assert!(matches!(outcome, TransformOutcome::Unimplemented { .. }));
    }

    #[test]
    fn test_routes_to_strategy() {
        let graph = factory().transform(&message("Microsoft")).unwrap();
        assert_eq!(graph.user.unwrap().mail.as_deref(), Some("a@x.com"));
        assert!(matches!(
            factory().transform(&message("okta")),
            Err(TransformerError::Unimplemented { operation: "users", .. })
        ));
    }
}
