//! In-process broker used by the CLI replay command and the tests.
//!
//! Partitions are assigned round-robin across the workers that connect.
//! Committed offsets are kept per partition so redelivery after an abandon
//! or a restart can be observed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::source::{DlqSink, MessageSource, PartitionOffsets, Record, SinkError, SourceConnector, SourceError};

#[derive(Debug, Default)]
struct Partition {
    records: Vec<Record>,
    committed: u64,
    cursor: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    partitions: BTreeMap<String, Partition>,
    /// Partition → worker that owns it
    owners: HashMap<String, usize>,
    workers: usize,
    commit_failures: u32,
    poll_failures: u32,
}

/// Shared broker state. Cloning shares the same partitions.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record; returns its offset.
    pub fn publish(&self, partition: &str, key: Option<&str>, payload: impl Into<Vec<u8>>) -> u64 {
        let mut state = self.lock();
        let part = state.partitions.entry(partition.to_string()).or_default();
        let offset = part.records.len() as u64;
        part.records.push(Record {
            partition: partition.to_string(),
            offset,
            key: key.map(str::to_string),
            payload: payload.into(),
        });
        offset
    }

    /// Next offset to consume once everything before it is committed.
    pub fn committed(&self, partition: &str) -> u64 {
        self.lock().partitions.get(partition).map(|p| p.committed).unwrap_or(0)
    }

    /// Records not yet committed across every partition.
    pub fn lag(&self) -> u64 {
        self.lock()
            .partitions
            .values()
            .map(|p| p.records.len() as u64 - p.committed)
            .sum()
    }

    /// Make the next `count` commits fail.
    pub fn fail_commits(&self, count: u32) {
        self.lock().commit_failures = count;
    }

    /// Make the next `count` polls fail.
    pub fn fail_polls(&self, count: u32) {
        self.lock().poll_failures = count;
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { broker: self.clone() }
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    async fn connect(&self, worker_id: usize) -> Result<Box<dyn MessageSource>, SourceError> {
        let mut state = self.broker.lock();
        state.workers = state.workers.max(worker_id + 1);
        Ok(Box::new(MemorySource {
            broker: self.broker.clone(),
            worker_id,
            topics: Vec::new(),
            closed: false,
        }))
    }
}

pub struct MemorySource {
    broker: MemoryBroker,
    worker_id: usize,
    topics: Vec<String>,
    closed: bool,
}

impl MemorySource {
    fn matches(&self, partition: &str) -> bool {
        self.topics.is_empty()
            || self
                .topics
                .iter()
                .any(|t| partition == t || partition.starts_with(&format!("{}.", t)))
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        self.topics = topics.to_vec();
        Ok(())
    }

    async fn poll_batch(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        let batch = {
            let mut state = self.broker.lock();
            if state.poll_failures > 0 {
                state.poll_failures -= 1;
                return Err(SourceError::Poll("injected poll failure".to_string()));
            }

            let names: Vec<String> = state
                .partitions
                .keys()
                .filter(|name| self.matches(name))
                .cloned()
                .collect();
            let workers = state.workers.max(1);
            for (index, name) in names.iter().enumerate() {
                state
                    .owners
                    .entry(name.clone())
                    .or_insert(index % workers);
            }

            let mut batch = Vec::new();
            for name in names {
                if state.owners.get(&name) != Some(&self.worker_id) {
                    continue;
                }
                let Some(part) = state.partitions.get_mut(&name) else {
                    continue;
                };
                while batch.len() < max_records && (part.cursor as usize) < part.records.len() {
                    batch.push(part.records[part.cursor as usize].clone());
                    part.cursor += 1;
                }
            }
            batch
        };

        if batch.is_empty() {
            // Keep idle workers from spinning
            tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<(), SourceError> {
        let mut state = self.broker.lock();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(SourceError::Commit("injected commit failure".to_string()));
        }
        for (name, next) in offsets.iter() {
            if let Some(part) = state.partitions.get_mut(name) {
                part.committed = part.committed.max(*next);
            }
        }
        Ok(())
    }

    async fn abandon(&mut self, records: &[Record]) -> Result<(), SourceError> {
        let mut state = self.broker.lock();
        for record in records {
            if let Some(part) = state.partitions.get_mut(&record.partition) {
                part.cursor = part.cursor.min(record.offset).max(part.committed);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Uncommitted records go back to the next owner
        let mut state = self.broker.lock();
        let owned: Vec<String> = state
            .owners
            .iter()
            .filter(|(_, worker)| **worker == self.worker_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            if let Some(part) = state.partitions.get_mut(&name) {
                part.cursor = part.committed;
            }
            state.owners.remove(&name);
        }
        Ok(())
    }
}

/// Dead-letter sink that keeps what it was sent.
#[derive(Debug, Clone, Default)]
pub struct MemoryDlq {
    sent: Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>,
}

impl MemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic, key, payload)` in send order
    pub fn sent(&self) -> Vec<(String, Option<String>, Vec<u8>)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl DlqSink for MemoryDlq {
    async fn send(&self, topic: &str, key: Option<&str>, value: &[u8]) -> Result<(), SinkError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| SinkError("dead-letter buffer poisoned".to_string()))?;
        sent.push((topic.to_string(), key.map(str::to_string), value.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::retry::RetryPolicy;
    use crate::consumer::worker::{BatchError, BatchHandler, BatchReport, FailedRecord, Worker, WorkerSettings};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BatchHandler for AlwaysFails {
        async fn handle_batch(&self, _worker: &str, _records: &[Record]) -> Result<BatchReport, BatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BatchError("database unavailable".to_string()))
        }
    }

    /// Fails every record whose payload is `bad`.
    struct RejectsBad;

    #[async_trait]
    impl BatchHandler for RejectsBad {
        async fn handle_batch(&self, _worker: &str, records: &[Record]) -> Result<BatchReport, BatchError> {
            let mut report = BatchReport::default();
            for (index, record) in records.iter().enumerate() {
                if record.payload == b"bad" {
                    report.failed.push(FailedRecord {
                        index,
                        reason: "malformed".to_string(),
                    });
                } else {
                    report.processed += 1;
                }
            }
            Ok(report)
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            topics: vec!["users".to_string()],
            poll_timeout: Duration::from_millis(5),
            max_poll_records: 10,
            init_retry: RetryPolicy::fixed(1, Duration::from_millis(1)),
            batch_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            max_poll_failures: 3,
            dlq_topic: Some("users.dlq".to_string()),
        }
    }

    async fn run_until(worker: &mut Worker, running: Arc<AtomicBool>, done: impl Fn() -> bool + Send + 'static) {
        let stopper = tokio::spawn(async move {
            for _ in 0..200 {
                if done() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            running.store(false, Ordering::SeqCst);
        });
        let _ = worker.run().await;
        let _ = stopper.await;
    }

    #[tokio::test]
    async fn test_failing_batch_is_never_committed() {
        let broker = MemoryBroker::new();
        broker.publish("users.0", None, "one");
        broker.publish("users.0", None, "two");

        let handler = Arc::new(AlwaysFails { calls: AtomicU32::new(0) });
        let running = Arc::new(AtomicBool::new(true));
        let mut worker = Worker::new(
            0,
            Arc::new(broker.connector()),
            handler.clone(),
            None,
            settings(),
            running.clone(),
        );

        let watched = handler.clone();
        run_until(&mut worker, running, move || watched.calls.load(Ordering::SeqCst) >= 6).await;

        // Abandoned batches come back: more than one round of attempts
        assert!(handler.calls.load(Ordering::SeqCst) >= 6);
        assert_eq!(broker.committed("users.0"), 0);
        assert_eq!(broker.lag(), 2);
        assert!(worker.stats().batches_abandoned >= 2);
    }

    #[tokio::test]
    async fn test_failed_records_go_to_dlq_and_batch_commits() {
        let broker = MemoryBroker::new();
        broker.publish("users.0", Some("k1"), "good");
        broker.publish("users.0", Some("k2"), "bad");
        broker.publish("users.0", Some("k3"), "good");

        let dlq = MemoryDlq::new();
        let running = Arc::new(AtomicBool::new(true));
        let mut worker = Worker::new(
            0,
            Arc::new(broker.connector()),
            Arc::new(RejectsBad),
            Some(Arc::new(dlq.clone())),
            settings(),
            running.clone(),
        );

        let watched = broker.clone();
        run_until(&mut worker, running, move || watched.lag() == 0).await;

        assert_eq!(broker.committed("users.0"), 3);
        let sent = dlq.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "users.dlq");
        assert_eq!(sent[0].1.as_deref(), Some("k2"));
        assert_eq!(sent[0].2, b"bad".to_vec());
        assert_eq!(worker.stats().records_processed, 2);
        assert_eq!(worker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_does_not_reprocess() {
        let broker = MemoryBroker::new();
        broker.publish("users.0", None, "good");
        broker.fail_commits(3);

        let running = Arc::new(AtomicBool::new(true));
        let mut worker = Worker::new(
            0,
            Arc::new(broker.connector()),
            Arc::new(RejectsBad),
            None,
            settings(),
            running.clone(),
        );

        let watched = broker.clone();
        let flag = running.clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(false, Ordering::SeqCst);
        });
        let _ = worker.run().await;
        let _ = stopper.await;

        // Commit retries ran out, the drain commit landed
        assert_eq!(watched.committed("users.0"), 1);
        assert_eq!(worker.stats().records_processed, 1);
    }

    #[tokio::test]
    async fn test_poll_failures_are_capped() {
        let broker = MemoryBroker::new();
        broker.fail_polls(10);
        let mut worker = Worker::new(
            0,
            Arc::new(broker.connector()),
            Arc::new(RejectsBad),
            None,
            settings(),
            Arc::new(AtomicBool::new(true)),
        );

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, crate::consumer::ConsumerError::PollFailed { .. }));
        assert_eq!(worker.state(), crate::consumer::WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_partitions_split_across_workers() {
        let broker = MemoryBroker::new();
        broker.publish("users.0", None, "a");
        broker.publish("users.1", None, "b");

        let connector = broker.connector();
        let mut first = connector.connect(0).await.unwrap();
        let mut second = connector.connect(1).await.unwrap();
        first.subscribe(&["users".to_string()]).await.unwrap();
        second.subscribe(&["users".to_string()]).await.unwrap();

        let a = first.poll_batch(Duration::from_millis(1), 10).await.unwrap();
        let b = second.poll_batch(Duration::from_millis(1), 10).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].partition, b[0].partition);
    }
}
