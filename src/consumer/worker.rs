//! One consumption worker: a sequential poll → process → commit loop over a
//! connection it owns.
//!
//! ```text
//! Uninitialized → Initializing → Running → Draining → Stopped
//! ```
//!
//! Offsets only advance after the handler accepted the whole batch. A batch
//! that keeps failing is handed back to the source uncommitted and will be
//! redelivered.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::retry::RetryPolicy;
use super::source::{DlqSink, MessageSource, PartitionOffsets, Record, SourceConnector, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Uninitialized => "UNINITIALIZED",
            WorkerState::Initializing => "INITIALIZING",
            WorkerState::Running => "RUNNING",
            WorkerState::Draining => "DRAINING",
            WorkerState::Stopped => "STOPPED",
        };
        write!(f, "{}", name)
    }
}

/// A record the handler gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRecord {
    /// Position in the batch
    pub index: usize,
    pub reason: String,
}

/// What the handler did with a batch it accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub processed: usize,
    /// Handled in log-only mode
    pub skipped: usize,
    pub failed: Vec<FailedRecord>,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        let offset = self.processed + self.skipped + self.failed.len();
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed.extend(other.failed.into_iter().map(|mut f| {
            f.index += offset;
            f
        }));
    }
}

/// Infrastructure failure that fails the whole batch.
#[derive(Debug, Clone)]
pub struct BatchError(pub String);

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch failed: {}", self.0)
    }
}

impl std::error::Error for BatchError {}

/// Processing callback for one batch.
///
/// A record-level failure belongs in [`BatchReport::failed`]; only errors
/// that make the whole batch unprocessable are returned as `Err`.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, worker: &str, records: &[Record]) -> Result<BatchReport, BatchError>;
}

/// Error type for the consumption engine
#[derive(Debug)]
pub enum ConsumerError {
    /// Connecting exhausted its retries
    InitializationFailed { worker: String, source: SourceError },
    Subscribe { worker: String, source: SourceError },
    /// Polling failed too many times in a row
    PollFailed { worker: String, source: SourceError },
    Join(String),
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::InitializationFailed { worker, source } => {
                write!(f, "{} initialization failed: {}", worker, source)
            }
            ConsumerError::Subscribe { worker, source } => write!(f, "{} subscribe failed: {}", worker, source),
            ConsumerError::PollFailed { worker, source } => write!(f, "{} polling failed: {}", worker, source),
            ConsumerError::Join(msg) => write!(f, "Worker task failed: {}", msg),
        }
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsumerError::InitializationFailed { source, .. }
            | ConsumerError::Subscribe { source, .. }
            | ConsumerError::PollFailed { source, .. } => Some(source),
            ConsumerError::Join(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub topics: Vec<String>,
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    /// Connecting to the broker
    pub init_retry: RetryPolicy,
    /// Processing and committing one batch
    pub batch_retry: RetryPolicy,
    /// Consecutive poll failures tolerated before the worker stops
    pub max_poll_failures: u32,
    /// Dead-letter topic; `None` disables forwarding
    pub dlq_topic: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            poll_timeout: Duration::from_millis(1000),
            max_poll_records: 100,
            init_retry: RetryPolicy::exponential(5, Duration::from_millis(500), Duration::from_secs(30)),
            batch_retry: RetryPolicy::fixed(3, Duration::from_millis(1000)),
            max_poll_failures: 10,
            dlq_topic: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: u64,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub batches_abandoned: u64,
    pub dead_lettered: u64,
}

pub struct Worker {
    id: usize,
    tag: String,
    connector: Arc<dyn SourceConnector>,
    handler: Arc<dyn BatchHandler>,
    dlq: Option<Arc<dyn DlqSink>>,
    settings: WorkerSettings,
    running: Arc<AtomicBool>,
    state: WorkerState,
    stats: WorkerStats,
    /// Processed but not yet committed
    pending: PartitionOffsets,
}

impl Worker {
    pub fn new(
        id: usize,
        connector: Arc<dyn SourceConnector>,
        handler: Arc<dyn BatchHandler>,
        dlq: Option<Arc<dyn DlqSink>>,
        settings: WorkerSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            tag: format!("[CID:worker-{}]", id),
            connector,
            handler,
            dlq,
            settings,
            running,
            state: WorkerState::Uninitialized,
            stats: WorkerStats::default(),
            pending: PartitionOffsets::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::info!("{} {} -> {}", self.tag, self.state, next);
        self.state = next;
    }

    /// Run until the running flag is cleared. Returns the final counters.
    pub async fn run(&mut self) -> Result<WorkerStats, ConsumerError> {
        self.transition(WorkerState::Initializing);
        let connector = self.connector.clone();
        let id = self.id;
        let label = format!("{} connect", self.tag);
        let mut source = match self.settings.init_retry.run(&label, |_| connector.connect(id)).await {
            Ok(source) => source,
            Err(e) => {
                self.transition(WorkerState::Stopped);
                return Err(ConsumerError::InitializationFailed {
                    worker: self.tag.clone(),
                    source: e,
                });
            }
        };

        if let Err(e) = source.subscribe(&self.settings.topics).await {
            let _ = source.close().await;
            self.transition(WorkerState::Stopped);
            return Err(ConsumerError::Subscribe {
                worker: self.tag.clone(),
                source: e,
            });
        }

        self.transition(WorkerState::Running);
        let outcome = self.poll_loop(source.as_mut()).await;

        self.transition(WorkerState::Draining);
        self.drain(source.as_mut()).await;
        self.transition(WorkerState::Stopped);

        tracing::info!("{} stopped: {:?}", self.tag, self.stats);
        outcome.map(|_| self.stats.clone())
    }

    async fn poll_loop(&mut self, source: &mut dyn MessageSource) -> Result<(), ConsumerError> {
        let mut poll_failures = 0;
        while self.running.load(Ordering::SeqCst) {
            let records = match source
                .poll_batch(self.settings.poll_timeout, self.settings.max_poll_records)
                .await
            {
                Ok(records) => {
                    poll_failures = 0;
                    records
                }
                Err(e) => {
                    poll_failures += 1;
                    if poll_failures >= self.settings.max_poll_failures {
                        tracing::error!("{} giving up after {} poll failures: {}", self.tag, poll_failures, e);
                        return Err(ConsumerError::PollFailed {
                            worker: self.tag.clone(),
                            source: e,
                        });
                    }
                    tracing::warn!("{} poll failed ({}): {}", self.tag, poll_failures, e);
                    tokio::time::sleep(self.settings.batch_retry.delay_after(poll_failures)).await;
                    continue;
                }
            };

            if records.is_empty() {
                continue;
            }
            self.process_batch(source, &records).await;
        }
        Ok(())
    }

    /// Handle then commit one batch, retrying up to the batch cap. Handling
    /// is not repeated once it succeeded; only the commit is retried.
    async fn process_batch(&mut self, source: &mut dyn MessageSource, records: &[Record]) {
        let policy = self.settings.batch_retry.clone();
        let offsets = PartitionOffsets::covering(records);
        tracing::debug!("{} polled {} records {}", self.tag, records.len(), offsets);

        let mut handled = false;
        for attempt in 1..=policy.max_attempts {
            if !handled {
                match self.handler.handle_batch(&self.tag, records).await {
                    Ok(report) => {
                        handled = true;
                        self.pending.merge(&offsets);
                        self.account(records, report).await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "{} batch attempt {}/{} failed: {}",
                            self.tag,
                            attempt,
                            policy.max_attempts,
                            e
                        );
                        if attempt < policy.max_attempts {
                            tokio::time::sleep(policy.delay_after(attempt)).await;
                        }
                        continue;
                    }
                }
            }

            match source.commit(&self.pending).await {
                Ok(()) => {
                    tracing::debug!("{} committed {}", self.tag, self.pending);
                    self.pending.clear();
                    self.stats.batches += 1;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "{} commit attempt {}/{} failed: {}",
                        self.tag,
                        attempt,
                        policy.max_attempts,
                        e
                    );
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        if handled {
            // Processed; the offsets stay pending for the next commit
            tracing::error!("{} commit of {} still pending after retries", self.tag, self.pending);
            self.stats.batches += 1;
            return;
        }

        self.stats.batches_abandoned += 1;
        tracing::error!(
            "{} abandoning batch of {} records {} after {} attempts; it will be redelivered",
            self.tag,
            records.len(),
            offsets,
            policy.max_attempts
        );
        if let Err(e) = source.abandon(records).await {
            tracing::error!("{} failed to release abandoned batch: {}", self.tag, e);
        }
    }

    /// Update counters and dead-letter the records the handler gave up on.
    async fn account(&mut self, records: &[Record], report: BatchReport) {
        self.stats.records_processed += report.processed as u64;
        self.stats.records_skipped += report.skipped as u64;
        self.stats.records_failed += report.failed.len() as u64;

        for failed in &report.failed {
            let Some(record) = records.get(failed.index) else {
                continue;
            };
            tracing::warn!("{} {} failed: {}", self.tag, record.tag(), failed.reason);
            let (Some(dlq), Some(topic)) = (&self.dlq, &self.settings.dlq_topic) else {
                continue;
            };
            match dlq.send(topic, record.key.as_deref(), &record.payload).await {
                Ok(()) => {
                    self.stats.dead_lettered += 1;
                    tracing::info!("{} {} routed to DLQ {}", self.tag, record.tag(), topic);
                }
                Err(e) => tracing::error!("{} {} DLQ forward failed: {}", self.tag, record.tag(), e),
            }
        }
    }

    /// Best-effort commit of processed offsets, then release the connection.
    async fn drain(&mut self, source: &mut dyn MessageSource) {
        if !self.pending.is_empty() {
            match source.commit(&self.pending).await {
                Ok(()) => self.pending.clear(),
                Err(e) => tracing::warn!("{} final commit failed: {}", self.tag, e),
            }
        }
        if let Err(e) = source.close().await {
            tracing::warn!("{} close failed: {}", self.tag, e);
        }
    }
}
