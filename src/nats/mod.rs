/// NATS JetStream integration module
///
/// Broker adapter for the consumption engine: a pull-consumer message source
/// and a dead-letter sink

pub mod client;
pub mod dlq;
pub mod source;

pub use client::{topic_filter, NatsClient, NatsConfig};
pub use dlq::JetStreamDlq;
pub use source::{JetStreamConnector, JetStreamSource};

/// Header carrying the record key; NATS messages have no key of their own
pub const KEY_HEADER: &str = "Fabric-Record-Key";
