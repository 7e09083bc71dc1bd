//! Placeholder strategies for vendors whose payloads are not mapped yet.

use super::{EntityTransformer, TransformOutcome, TransformerError};
use crate::message::{RawEntityMessage, VendorType};

/// Registered for a vendor so routing succeeds, but every operation answers
/// `Unimplemented`.
#[derive(Debug, Clone, Copy)]
pub struct UnimplementedTransformer {
    vendor: VendorType,
}

impl UnimplementedTransformer {
    pub fn new(vendor: VendorType) -> Self {
        Self { vendor }
    }

    fn unimplemented(&self, operation: &'static str) -> Result<TransformOutcome, TransformerError> {
        tracing::debug!("{} {} transformation requested but not implemented", self.vendor, operation);
        Ok(TransformOutcome::Unimplemented {
            vendor: self.vendor.to_string(),
            operation,
        })
    }
}

impl EntityTransformer for UnimplementedTransformer {
    fn name(&self) -> &'static str {
        match self.vendor {
            VendorType::Okta => "OktaEntityTransformer",
            VendorType::PingIdp => "PingIdpEntityTransformer",
            VendorType::Ollama => "OllamaEntityTransformer",
            VendorType::Microsoft => "UnimplementedMicrosoftTransformer",
        }
    }

    fn transform_users(&self, _message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError> {
        self.unimplemented("users")
    }

    fn transform_apps(&self, _message: &RawEntityMessage) -> Result<TransformOutcome, TransformerError> {
        self.unimplemented("apps")
    }
}
