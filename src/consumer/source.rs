//! Broker capabilities consumed by the workers.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

/// One record pulled from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: String,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Record {
    /// `[REC:<partition>/<offset>]` log tag
    pub fn tag(&self) -> String {
        format!("[REC:{}/{}]", self.partition, self.offset)
    }
}

/// Next offset to commit, per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOffsets(BTreeMap<String, u64>);

impl PartitionOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets covering every record in `records`: last offset + 1 per
    /// partition.
    pub fn covering(records: &[Record]) -> Self {
        let mut offsets = Self::new();
        for record in records {
            offsets.track(record);
        }
        offsets
    }

    pub fn track(&mut self, record: &Record) {
        let next = record.offset + 1;
        let entry = self.0.entry(record.partition.clone()).or_insert(next);
        if *entry < next {
            *entry = next;
        }
    }

    /// Keep the higher offset of each partition.
    pub fn merge(&mut self, other: &PartitionOffsets) {
        for (partition, next) in other.iter() {
            let entry = self.0.entry(partition.clone()).or_insert(*next);
            if *entry < *next {
                *entry = *next;
            }
        }
    }

    pub fn get(&self, partition: &str) -> Option<u64> {
        self.0.get(partition).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl fmt::Display for PartitionOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(p, o)| format!("{}@{}", p, o)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Error type for message sources
#[derive(Debug, Clone)]
pub enum SourceError {
    Connect(String),
    Poll(String),
    Commit(String),
    Closed,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Connect(msg) => write!(f, "Failed to connect to broker: {}", msg),
            SourceError::Poll(msg) => write!(f, "Poll failed: {}", msg),
            SourceError::Commit(msg) => write!(f, "Offset commit failed: {}", msg),
            SourceError::Closed => write!(f, "Source is closed"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Error type for the dead-letter sink
#[derive(Debug, Clone)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dead-letter send failed: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// A partitioned record source owned by exactly one worker.
#[async_trait]
pub trait MessageSource: Send {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError>;

    /// Up to `max_records` records, waiting at most `timeout`. An empty batch
    /// is not an error.
    async fn poll_batch(
        &mut self,
        timeout: std::time::Duration,
        max_records: usize,
    ) -> Result<Vec<Record>, SourceError>;

    /// Mark everything before each offset as consumed.
    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<(), SourceError>;

    /// Give uncommitted records back so a later poll redelivers them.
    async fn abandon(&mut self, records: &[Record]) -> Result<(), SourceError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}

/// Opens one source per worker.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, worker_id: usize) -> Result<Box<dyn MessageSource>, SourceError>;
}

/// Side channel for records that cannot be made to succeed.
#[async_trait]
pub trait DlqSink: Send + Sync {
    async fn send(&self, topic: &str, key: Option<&str>, value: &[u8]) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: &str, offset: u64) -> Record {
        Record {
            partition: partition.to_string(),
            offset,
            key: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_offsets_cover_last_record_per_partition() {
        let offsets = PartitionOffsets::covering(&[
            record("p0", 4),
            record("p1", 0),
            record("p0", 7),
            record("p0", 5),
        ]);
        assert_eq!(offsets.get("p0"), Some(8));
        assert_eq!(offsets.get("p1"), Some(1));
        assert_eq!(offsets.to_string(), "{p0@8, p1@1}");
    }

    #[test]
    fn test_record_tag() {
        assert_eq!(record("users.0", 12).tag(), "[REC:users.0/12]");
    }
}
