//! Dead-letter sink publishing to a JetStream subject.

use async_nats::jetstream;
use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::client::{NatsClient, NatsConfig};
use crate::consumer::{DlqSink, SinkError};

/// Connects on first use; the connection is then shared by every worker.
pub struct JetStreamDlq {
    config: NatsConfig,
    dlq_topic: String,
    client: OnceCell<NatsClient>,
}

impl JetStreamDlq {
    pub fn new(config: NatsConfig, dlq_topic: impl Into<String>) -> Self {
        Self {
            config,
            dlq_topic: dlq_topic.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&NatsClient, SinkError> {
        self.client
            .get_or_try_init(|| async {
                let client = NatsClient::connect(self.config.clone())
                    .await
                    .map_err(|e| SinkError(e.to_string()))?;
                let name = format!("{}_DLQ", self.config.stream_name);
                client
                    .jetstream()
                    .get_or_create_stream(jetstream::stream::Config {
                        name: name.clone(),
                        subjects: vec![self.dlq_topic.clone()],
                        max_age: self.config.max_age,
                        storage: jetstream::stream::StorageType::File,
                        num_replicas: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| SinkError(format!("stream '{}': {}", name, e)))?;
                tracing::info!("Dead-letter stream '{}' ready on {}", name, self.dlq_topic);
                Ok(client)
            })
            .await
    }
}

#[async_trait]
impl DlqSink for JetStreamDlq {
    async fn send(&self, topic: &str, key: Option<&str>, value: &[u8]) -> Result<(), SinkError> {
        let client = self.client().await?;
        client
            .publish(topic, key, value.to_vec())
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}
