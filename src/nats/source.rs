//! JetStream adapter for the consumption engine.
//!
//! A subject is a partition and a message's stream sequence is its offset.
//! Fetched messages stay unacknowledged until their offset is committed;
//! abandoning a batch NAKs them so JetStream redelivers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures::StreamExt;

use super::client::{topic_filter, NatsClient, NatsConfig};
use super::KEY_HEADER;
use crate::consumer::{MessageSource, PartitionOffsets, Record, SourceConnector, SourceError};

/// Opens one JetStream connection per worker.
pub struct JetStreamConnector {
    config: NatsConfig,
}

impl JetStreamConnector {
    pub fn new(config: NatsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceConnector for JetStreamConnector {
    async fn connect(&self, worker_id: usize) -> Result<Box<dyn MessageSource>, SourceError> {
        let client = NatsClient::connect(self.config.clone()).await?;
        tracing::debug!("[CID:worker-{}] JetStream connection open", worker_id);
        Ok(Box::new(JetStreamSource {
            client,
            consumer: None,
            pending: BTreeMap::new(),
        }))
    }
}

pub struct JetStreamSource {
    client: NatsClient,
    consumer: Option<PullConsumer>,
    /// Delivered, not yet acknowledged, keyed by (subject, sequence)
    pending: BTreeMap<(String, u64), jetstream::Message>,
}

impl JetStreamSource {
    fn to_record(message: &jetstream::Message) -> Result<Record, SourceError> {
        let sequence = message
            .info()
            .map_err(|e| SourceError::Poll(format!("message without JetStream metadata: {}", e)))?
            .stream_sequence;
        let key = message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(KEY_HEADER))
            .map(|value| value.as_str().to_string());

        Ok(Record {
            partition: message.subject.to_string(),
            offset: sequence,
            key,
            payload: message.payload.to_vec(),
        })
    }
}

/// Decode a fetched batch. A message that fails to decode is set aside
/// without affecting the others.
fn split_fetched<M>(
    fetched: Vec<M>,
    decode: impl Fn(&M) -> Result<Record, SourceError>,
) -> (Vec<(Record, M)>, Vec<(M, SourceError)>) {
    let mut accepted = Vec::with_capacity(fetched.len());
    let mut rejected = Vec::new();
    for message in fetched {
        match decode(&message) {
            Ok(record) => accepted.push((record, message)),
            Err(e) => rejected.push((message, e)),
        }
    }
    (accepted, rejected)
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError> {
        let stream = self.client.ensure_stream(topics).await?;
        let config = self.client.config();

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &config.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(config.consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    max_deliver: config.max_deliver,
                    filter_subjects: topics.iter().map(|t| topic_filter(t)).collect(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SourceError::Connect(format!("consumer '{}': {}", config.consumer_name, e)))?;

        tracing::info!(
            "Consuming {:?} from stream '{}' with consumer '{}'",
            topics,
            config.stream_name,
            config.consumer_name
        );
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn poll_batch(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, SourceError> {
        let consumer = self.consumer.as_ref().ok_or(SourceError::Closed)?;
        let mut messages = consumer
            .fetch()
            .max_messages(max_records)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| SourceError::Poll(e.to_string()))?;

        let mut fetched = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(m) => fetched.push(m),
                Err(e) => tracing::error!("Error receiving message: {}", e),
            }
        }

        let (accepted, rejected) = split_fetched(fetched, Self::to_record);
        for (message, e) in rejected {
            tracing::error!(
                "Dropping undecodable message on {}: {} RAW_RECORD payload: {}",
                message.subject,
                e,
                String::from_utf8_lossy(&message.payload)
            );
            if let Err(e) = message.ack_with(AckKind::Term).await {
                tracing::warn!("Failed to terminate message on {}: {}", message.subject, e);
            }
        }

        let mut records = Vec::with_capacity(accepted.len());
        for (record, message) in accepted {
            self.pending.insert((record.partition.clone(), record.offset), message);
            records.push(record);
        }
        Ok(records)
    }

    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<(), SourceError> {
        let covered: Vec<(String, u64)> = self
            .pending
            .keys()
            .filter(|(subject, sequence)| offsets.get(subject).is_some_and(|next| *sequence < next))
            .cloned()
            .collect();

        let mut failure = None;
        for key in covered {
            let Some(message) = self.pending.remove(&key) else {
                continue;
            };
            if let Err(e) = message.ack().await {
                failure = Some(format!("{}/{}: {}", key.0, key.1, e));
                self.pending.insert(key, message);
            }
        }
        match failure {
            Some(reason) => Err(SourceError::Commit(reason)),
            None => Ok(()),
        }
    }

    async fn abandon(&mut self, records: &[Record]) -> Result<(), SourceError> {
        for record in records {
            let Some(message) = self.pending.remove(&(record.partition.clone(), record.offset)) else {
                continue;
            };
            if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                // Redelivered after ack_wait anyway
                tracing::error!("Failed to NAK {}: {}", record.tag(), e);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        let pending = std::mem::take(&mut self.pending);
        for ((subject, sequence), message) in pending {
            if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                tracing::warn!("Failed to release {}/{} on close: {}", subject, sequence, e);
            }
        }
        self.consumer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(message: &(&str, Option<u64>)) -> Result<Record, SourceError> {
        let (subject, sequence) = *message;
        let offset = sequence.ok_or_else(|| SourceError::Poll("message without JetStream metadata".to_string()))?;
        Ok(Record {
            partition: subject.to_string(),
            offset,
            key: None,
            payload: Vec::new(),
        })
    }

    #[test]
    fn test_undecodable_message_keeps_the_rest_of_the_batch() {
        let fetched = vec![("entities.0", Some(1)), ("entities.0", None), ("entities.1", Some(7))];

        let (accepted, rejected) = split_fetched(fetched, decode);
        let offsets: Vec<(String, u64)> = accepted.iter().map(|(r, _)| (r.partition.clone(), r.offset)).collect();
        assert_eq!(
            offsets,
            vec![("entities.0".to_string(), 1), ("entities.1".to_string(), 7)]
        );
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, ("entities.0", None));
    }

    #[test]
    fn test_clean_batch_has_no_rejects() {
        let (accepted, rejected) = split_fetched(vec![("entities.0", Some(3))], decode);
        assert_eq!(accepted.len(), 1);
        assert!(rejected.is_empty());
    }
}
