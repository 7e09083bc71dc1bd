//! Destinations for transformed entity graphs.

use std::fmt;
use std::sync::Arc;

use crate::config::OutputMode;
use crate::entity::TransformedEntityGraph;
use crate::ingestion::{IngestError, IngestReport, IngestionCoordinator};

/// Error type for output sinks
#[derive(Debug)]
pub enum OutputError {
    Ingest(IngestError),
    Serialize(serde_json::Error),
}

impl OutputError {
    /// Worth retrying the whole batch
    pub fn is_transient(&self) -> bool {
        matches!(self, OutputError::Ingest(e) if e.is_transient())
    }
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::Ingest(e) => write!(f, "{}", e),
            OutputError::Serialize(e) => write!(f, "Failed to serialize graph: {}", e),
        }
    }
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::Ingest(e) => Some(e),
            OutputError::Serialize(e) => Some(e),
        }
    }
}

impl From<IngestError> for OutputError {
    fn from(err: IngestError) -> Self {
        OutputError::Ingest(err)
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(err: serde_json::Error) -> Self {
        OutputError::Serialize(err)
    }
}

/// Accepts one graph per record. Blocking; callers on the async runtime go
/// through `spawn_blocking`.
pub trait OutputSink: Send + Sync {
    fn mode(&self) -> OutputMode;

    /// `tag` is the record's log tag
    fn accept(&self, tag: &str, graph: &TransformedEntityGraph) -> Result<Option<IngestReport>, OutputError>;
}

/// Logs the graph summary, and the full graph at debug level.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn mode(&self) -> OutputMode {
        OutputMode::Log
    }

    fn accept(&self, tag: &str, graph: &TransformedEntityGraph) -> Result<Option<IngestReport>, OutputError> {
        tracing::info!("{} transformed: {}", tag, graph.summary());
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("{} graph: {}", tag, serde_json::to_string(graph)?);
        }
        Ok(None)
    }
}

/// Persists through the ingestion coordinator.
#[derive(Clone)]
pub struct DatabaseSink {
    coordinator: IngestionCoordinator,
}

impl DatabaseSink {
    pub fn new(coordinator: IngestionCoordinator) -> Self {
        Self { coordinator }
    }
}

impl OutputSink for DatabaseSink {
    fn mode(&self) -> OutputMode {
        OutputMode::Database
    }

    fn accept(&self, tag: &str, graph: &TransformedEntityGraph) -> Result<Option<IngestReport>, OutputError> {
        let report = self.coordinator.ingest(graph)?;
        tracing::info!("{} ingested {} rows ({})", tag, report.total(), graph.summary());
        Ok(Some(report))
    }
}

/// Sink for the configured mode. `coordinator` is required for the database
/// mode; without it the log sink is used.
pub fn sink_for(mode: OutputMode, coordinator: Option<IngestionCoordinator>) -> Arc<dyn OutputSink> {
    match (mode, coordinator) {
        (OutputMode::Database, Some(coordinator)) => Arc::new(DatabaseSink::new(coordinator)),
        (OutputMode::Database, None) => {
            tracing::warn!("Database output requested without a store; falling back to log output");
            Arc::new(LogSink)
        }
        (OutputMode::Log, _) => Arc::new(LogSink),
    }
}
