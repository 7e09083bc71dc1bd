//! Per-record pipeline: parse, route to a strategy, hand the graph to the
//! output sink.
//!
//! [`EntityProcessor`] is also the consumption engine's batch handler. A
//! record that cannot be parsed or transformed is logged raw and reported as
//! failed; only a transient store failure fails the batch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::consumer::{BatchError, BatchHandler, BatchReport, FailedRecord, Record};
use crate::entity::TransformedEntityGraph;
use crate::ingestion::IngestReport;
use crate::message::{MessageError, RawEntityMessage};
use crate::output::{OutputError, OutputSink};
use crate::transformer::{TransformerError, TransformerFactory};

/// Error type for the public processing entry points
#[derive(Debug)]
pub enum ProcessingError {
    Message(MessageError),
    Transform(TransformerError),
    Output(OutputError),
}

impl ProcessingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessingError::Output(e) if e.is_transient())
    }

    /// The strategy answered "not implemented" rather than failing
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, ProcessingError::Transform(TransformerError::Unimplemented { .. }))
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingError::Message(e) => write!(f, "{}", e),
            ProcessingError::Transform(e) => write!(f, "{}", e),
            ProcessingError::Output(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessingError::Message(e) => Some(e),
            ProcessingError::Transform(e) => Some(e),
            ProcessingError::Output(e) => Some(e),
        }
    }
}

impl From<MessageError> for ProcessingError {
    fn from(err: MessageError) -> Self {
        ProcessingError::Message(err)
    }
}

impl From<TransformerError> for ProcessingError {
    fn from(err: TransformerError) -> Self {
        ProcessingError::Transform(err)
    }
}

impl From<OutputError> for ProcessingError {
    fn from(err: OutputError) -> Self {
        ProcessingError::Output(err)
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Processed,
    /// Logged only: transformers disabled or the operation is unimplemented
    Skipped,
    Failed(String),
}

#[derive(Clone)]
pub struct EntityProcessor {
    factory: Arc<TransformerFactory>,
    sink: Arc<dyn OutputSink>,
    transformers_enabled: bool,
}

impl EntityProcessor {
    pub fn new(factory: Arc<TransformerFactory>, sink: Arc<dyn OutputSink>, transformers_enabled: bool) -> Self {
        tracing::info!(
            "Entity processor ready (transformers enabled: {}, output: {})",
            transformers_enabled,
            sink.mode()
        );
        Self {
            factory,
            sink,
            transformers_enabled,
        }
    }

    pub fn transformers_enabled(&self) -> bool {
        self.transformers_enabled
    }

    /// Transform one message into its canonical graph. Nothing is written.
    pub fn process_entity(&self, message: &RawEntityMessage) -> Result<TransformedEntityGraph, ProcessingError> {
        message.validate()?;
        Ok(self.factory.transform(message)?)
    }

    /// Hand a graph to the configured output sink.
    pub fn ingest_transformed_entity(
        &self,
        graph: &TransformedEntityGraph,
    ) -> Result<Option<IngestReport>, ProcessingError> {
        Ok(self.sink.accept("[API]", graph)?)
    }

    fn transform_and_output(&self, tag: &str, payload: &[u8]) -> Result<(), ProcessingError> {
        let message = RawEntityMessage::from_slice(payload)?;
        tracing::debug!(
            "{} parsed message - vendor: {}, type: {}",
            tag,
            message.vendor_tag(),
            message.entity_type_tag()
        );
        let graph = self.process_entity(&message)?;
        self.sink.accept(tag, &graph)?;
        Ok(())
    }

    /// Run one record through the pipeline. `Err` only for failures that
    /// should fail the whole batch.
    pub fn process_record(&self, worker: &str, record: &Record) -> Result<RecordOutcome, ProcessingError> {
        let tag = format!("{} {}", worker, record.tag());

        if !self.transformers_enabled {
            tracing::info!("{} consumed record - key: {:?}", tag, record.key);
            return Ok(RecordOutcome::Skipped);
        }

        match self.transform_and_output(&tag, &record.payload) {
            Ok(()) => Ok(RecordOutcome::Processed),
            Err(e) if e.is_transient() => Err(e),
            Err(e) if e.is_unimplemented() => {
                tracing::warn!("{} {}; falling back to logging", tag, e);
                log_raw(&tag, record);
                Ok(RecordOutcome::Skipped)
            }
            Err(e) => {
                tracing::error!("{} processing failed: {}; falling back to logging", tag, e);
                log_raw(&tag, record);
                Ok(RecordOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Process a batch in order. Stops at the first transient failure.
    pub fn process_records(&self, worker: &str, records: &[Record]) -> Result<BatchReport, ProcessingError> {
        let mut report = BatchReport::default();
        for (index, record) in records.iter().enumerate() {
            match self.process_record(worker, record)? {
                RecordOutcome::Processed => report.processed += 1,
                RecordOutcome::Skipped => report.skipped += 1,
                RecordOutcome::Failed(reason) => report.failed.push(FailedRecord { index, reason }),
            }
        }
        tracing::info!(
            "{} batch of {} records - processed: {}, skipped: {}, failed: {}",
            worker,
            records.len(),
            report.processed,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }
}

fn log_raw(tag: &str, record: &Record) {
    tracing::info!(
        "{} RAW_RECORD key: {:?} payload: {}",
        tag,
        record.key,
        String::from_utf8_lossy(&record.payload)
    );
}

#[async_trait]
impl BatchHandler for EntityProcessor {
    async fn handle_batch(&self, worker: &str, records: &[Record]) -> Result<BatchReport, BatchError> {
        let processor = self.clone();
        let worker = worker.to_string();
        let records = records.to_vec();

        // Transformation and the store calls block
        tokio::task::spawn_blocking(move || processor.process_records(&worker, &records))
            .await
            .map_err(|e| BatchError(format!("processing task failed: {}", e)))?
            .map_err(|e| BatchError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputMode;
    use crate::diesel_runtime::{EntityKind, MemoryStore, StoreError, TransactionWork, TransactionalStore};
    use crate::ingestion::IngestionCoordinator;
    use crate::output::{sink_for, LogSink};
    use crate::transformer::{registration, MicrosoftEntityTransformer, UnimplementedTransformer};
    use crate::message::VendorType;
    use serde_json::json;

    fn factory() -> Arc<TransformerFactory> {
        Arc::new(TransformerFactory::new(vec![
            registration(VendorType::Microsoft, MicrosoftEntityTransformer::new()),
            registration(VendorType::Okta, UnimplementedTransformer::new(VendorType::Okta)),
        ]))
    }

    fn record(offset: u64, payload: serde_json::Value) -> Record {
        Record {
            partition: "entities.0".to_string(),
            offset,
            key: Some(format!("k{}", offset)),
            payload: serde_json::to_vec(&payload).unwrap(),
        }
    }

    fn user(id: &str) -> serde_json::Value {
        json!({"vendor": "microsoft", "type": "users", "tenant": "T1", "data": {"id": id, "department": "Eng"}})
    }

    struct Unavailable;

    impl TransactionalStore for Unavailable {
        fn in_transaction(&self, _work: &mut TransactionWork<'_>) -> Result<(), StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }
    }

    #[test]
    fn test_unsupported_vendor_names_known_vendors() {
        let processor = EntityProcessor::new(factory(), Arc::new(LogSink), true);
        let message: RawEntityMessage = serde_json::from_value(json!({
            "vendor": "foo", "type": "users", "data": {"id": "U1"}
        }))
        .unwrap();

        let err = processor.process_entity(&message).unwrap_err();
        match err {
            ProcessingError::Transform(TransformerError::UnsupportedVendor { vendor, known }) => {
                assert_eq!(vendor, "foo");
                assert_eq!(known, vec!["microsoft".to_string(), "okta".to_string()]);
            }
            other => panic!("expected unsupported vendor, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_reports_each_record() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink_for(OutputMode::Database, Some(IngestionCoordinator::new(store.clone())));
        let processor = EntityProcessor::new(factory(), sink, true);

        let records = vec![
            record(0, user("U1")),
            Record {
                payload: b"{not json".to_vec(),
                ..record(1, json!({}))
            },
            record(2, json!({"vendor": "okta", "type": "users", "data": {"id": "O1"}})),
            record(3, json!({"vendor": "foo", "type": "users", "data": {"id": "F1"}})),
            record(4, user("U2")),
        ];

        let report = processor.process_records("[CID:worker-0]", &records).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 1);
        let failed: Vec<usize> = report.failed.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 3]);

        let state = store.snapshot();
        assert_eq!(state.count(EntityKind::User), 2);
        assert_eq!(state.count(EntityKind::Department), 1);
    }

    #[test]
    fn test_disabled_transformers_only_log() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink_for(OutputMode::Database, Some(IngestionCoordinator::new(store.clone())));
        let processor = EntityProcessor::new(factory(), sink, false);

        let report = processor
            .process_records("[CID:worker-0]", &[record(0, user("U1")), record(1, json!("garbage"))])
            .unwrap();
        assert_eq!(report.skipped, 2);
        assert!(report.failed.is_empty());
        assert_eq!(store.snapshot().total(), 0);
    }

    #[test]
    fn test_transient_store_error_fails_batch() {
        let sink = sink_for(OutputMode::Database, Some(IngestionCoordinator::new(Arc::new(Unavailable))));
        let processor = EntityProcessor::new(factory(), sink, true);

        let err = processor
            .process_records("[CID:worker-0]", &[record(0, user("U1"))])
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_handle_batch_maps_transient_error() {
        let sink = sink_for(OutputMode::Database, Some(IngestionCoordinator::new(Arc::new(Unavailable))));
        let processor = EntityProcessor::new(factory(), sink, true);

        let result = processor.handle_batch("[CID:worker-0]", &[record(0, user("U1"))]).await;
        assert!(result.is_err());
    }
}
