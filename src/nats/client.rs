/// NATS JetStream connection
///
/// Provides connection management, stream setup and raw publishing for the
/// consumer adapter and the dead-letter sink

use async_nats::jetstream;
use std::time::Duration;

use crate::config::{env_or, env_parse};
use crate::consumer::SourceError;

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    /// Durable consumer name; workers share it and split its deliveries
    pub consumer_name: String,
    /// Redeliveries JetStream attempts before it stops on its own
    pub max_deliver: i64,
    /// How long an unacknowledged message stays invisible
    pub ack_wait: Duration,
    pub max_age: Duration,
    pub max_bytes: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "ENTITIES".to_string(),
            consumer_name: "entity-fabric".to_string(),
            max_deliver: 10,
            ack_wait: Duration::from_secs(60),
            max_age: Duration::from_secs(24 * 60 * 60), // 24 hours
            max_bytes: 1024 * 1024 * 1024, // 1GB
        }
    }
}

impl NatsConfig {
    /// `NATS_URL`, `NATS_STREAM`, `NATS_CONSUMER`, `NATS_MAX_DELIVER`,
    /// `NATS_ACK_WAIT_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_or("NATS_URL", &defaults.url),
            stream_name: env_or("NATS_STREAM", &defaults.stream_name),
            consumer_name: env_or("NATS_CONSUMER", &defaults.consumer_name),
            max_deliver: env_parse("NATS_MAX_DELIVER", defaults.max_deliver),
            ack_wait: Duration::from_secs(env_parse("NATS_ACK_WAIT_SECS", defaults.ack_wait.as_secs())),
            ..defaults
        }
    }
}

/// Subject filter covering every partition of a topic.
pub fn topic_filter(topic: &str) -> String {
    format!("{}.>", topic.trim_end_matches(".>"))
}

#[derive(Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to NATS and initialize JetStream
    pub async fn connect(config: NatsConfig) -> Result<Self, SourceError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| SourceError::Connect(format!("{}: {}", config.url, e)))?;
        tracing::info!("Connected to NATS at {}", config.url);

        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            config,
        })
    }

    /// Create or get the stream carrying `topics` (and the DLQ topic, if any).
    pub async fn ensure_stream(&self, topics: &[String]) -> Result<jetstream::stream::Stream, SourceError> {
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: self.config.stream_name.clone(),
                subjects: topics.iter().map(|t| topic_filter(t)).collect(),
                max_age: self.config.max_age,
                max_bytes: self.config.max_bytes,
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| SourceError::Connect(format!("stream '{}': {}", self.config.stream_name, e)))?;

        tracing::info!("JetStream stream '{}' ready", self.config.stream_name);
        Ok(stream)
    }

    /// Publish and wait for the JetStream acknowledgment.
    pub async fn publish(
        &self,
        subject: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ack = match key {
            Some(key) => {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert(super::KEY_HEADER, key);
                self.jetstream
                    .publish_with_headers(subject.to_string(), headers, payload.into())
                    .await?
            }
            None => self.jetstream.publish(subject.to_string(), payload.into()).await?,
        };
        ack.await?;

        tracing::debug!("Published message to JetStream subject {}", subject);
        Ok(())
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Get JetStream context for advanced operations
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Check if the NATS connection is active
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
