//! Batch consumption engine.
//!
//! A fixed pool of workers, each owning one broker connection, polls record
//! batches, hands them to a [`BatchHandler`] and commits offsets only once a
//! batch has been handled. Brokers plug in through [`SourceConnector`] and
//! [`MessageSource`]; NATS JetStream lives in [`crate::nats`], an in-memory
//! broker in [`memory`].

pub mod memory;
pub mod pool;
pub mod retry;
pub mod source;
pub mod worker;

pub use memory::{MemoryBroker, MemoryConnector, MemoryDlq, MemorySource};
pub use pool::WorkerPool;
pub use retry::RetryPolicy;
pub use source::{DlqSink, MessageSource, PartitionOffsets, Record, SinkError, SourceConnector, SourceError};
pub use worker::{
    BatchError, BatchHandler, BatchReport, ConsumerError, FailedRecord, Worker, WorkerSettings, WorkerState,
    WorkerStats,
};
