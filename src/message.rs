//! Raw identity-provider change event as received from the broker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity-provider vendors with a registered strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VendorType {
    Okta,
    Microsoft,
    Ollama,
    PingIdp,
}

impl VendorType {
    pub const ALL: [VendorType; 4] = [
        VendorType::Okta,
        VendorType::Microsoft,
        VendorType::Ollama,
        VendorType::PingIdp,
    ];

    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorType::Okta => "okta",
            VendorType::Microsoft => "microsoft",
            VendorType::Ollama => "ollama",
            VendorType::PingIdp => "pingidp",
        }
    }
}

impl fmt::Display for VendorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VendorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        VendorType::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(tag))
            .ok_or_else(|| format!("Unknown vendor type: {}", s))
    }
}

/// Source entity type carried in the message's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Users,
    Apps,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Users => "users",
            EntityType::Apps => "apps",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "users" => Ok(EntityType::Users),
            "apps" => Ok(EntityType::Apps),
            other => Err(format!("Unknown entity type: {}", other)),
        }
    }
}

/// Error raised when a payload is not a usable raw message
#[derive(Debug)]
pub enum MessageError {
    InvalidJson(serde_json::Error),
    MissingField(&'static str),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::InvalidJson(e) => write!(f, "Invalid message JSON: {}", e),
            MessageError::MissingField(field) => write!(f, "Required field '{}' is missing", field),
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageError::InvalidJson(e) => Some(e),
            MessageError::MissingField(_) => None,
        }
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::InvalidJson(err)
    }
}

/// Raw message: routing tags and identifiers at the root, the vendor
/// document under `data`. Identifiers stay opaque strings here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntityMessage {
    /// Vendor tag (`microsoft`, `okta`, ...)
    #[serde(default)]
    pub vendor: String,
    /// Source entity type (`users`, `apps`)
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub subscriber: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(rename = "subProduct", default)]
    pub sub_product: Option<String>,
    #[serde(default)]
    pub relation_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Arrival time; set on receipt when the producer did not send one
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawEntityMessage {
    /// Parse and validate a message from JSON bytes.
    ///
    /// `vendor`, `type` and `data` are required. A missing `timestamp` is
    /// filled with the current time.
    pub fn from_slice(payload: &[u8]) -> Result<Self, MessageError> {
        let mut message: RawEntityMessage = serde_json::from_slice(payload)?;
        message.validate()?;
        if message.timestamp.is_none() {
            message.timestamp = Some(Utc::now());
        }
        Ok(message)
    }

    /// Check the required top-level fields.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.vendor.trim().is_empty() {
            return Err(MessageError::MissingField("vendor"));
        }
        if self.entity_type.trim().is_empty() {
            return Err(MessageError::MissingField("type"));
        }
        if self.data.is_null() {
            return Err(MessageError::MissingField("data"));
        }
        Ok(())
    }

    /// Vendor tag, lowercased
    pub fn vendor_tag(&self) -> String {
        self.vendor.trim().to_lowercase()
    }

    /// Entity type tag, lowercased
    pub fn entity_type_tag(&self) -> String {
        self.entity_type.trim().to_lowercase()
    }
}
