//! Fixed-size worker pool.
//!
//! Each worker runs on its own tokio task with its own connection. The only
//! shared state is the running flag; shutdown clears it, waits up to the
//! grace period for the workers to drain, then aborts the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};

use super::source::{DlqSink, SourceConnector};
use super::worker::{BatchHandler, ConsumerError, Worker, WorkerSettings, WorkerStats};

type WorkerResult = Result<WorkerStats, ConsumerError>;

pub struct WorkerPool {
    running: Arc<AtomicBool>,
    workers: JoinSet<WorkerResult>,
    size: usize,
    grace: Duration,
}

fn joined(result: Result<WorkerResult, JoinError>) -> WorkerResult {
    match result {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ConsumerError::Join("aborted after grace period".to_string())),
        Err(e) => Err(ConsumerError::Join(e.to_string())),
    }
}

impl WorkerPool {
    /// Spawn `size` workers. Must be called inside a tokio runtime.
    pub fn start(
        size: usize,
        connector: Arc<dyn SourceConnector>,
        handler: Arc<dyn BatchHandler>,
        dlq: Option<Arc<dyn DlqSink>>,
        settings: WorkerSettings,
        grace: Duration,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let size = size.max(1);
        tracing::info!("Starting {} workers on {:?}", size, settings.topics);

        let mut workers = JoinSet::new();
        for id in 0..size {
            let mut worker = Worker::new(
                id,
                connector.clone(),
                handler.clone(),
                dlq.clone(),
                settings.clone(),
                running.clone(),
            );
            workers.spawn(async move { worker.run().await });
        }

        Self {
            running,
            workers,
            size,
            grace,
        }
    }

    /// Shared flag; clearing it asks every worker to drain.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolves when a worker stops while the pool is still running, which
    /// only happens on a fatal error (initialization or polling gave up).
    /// `None` once every worker has been collected.
    pub async fn next_exit(&mut self) -> Option<WorkerResult> {
        self.workers.join_next().await.map(joined)
    }

    /// Wait for every remaining worker to finish on its own.
    pub async fn join(mut self) -> Vec<WorkerResult> {
        let mut results = Vec::with_capacity(self.workers.len());
        while let Some(result) = self.workers.join_next().await {
            results.push(joined(result));
        }
        results
    }

    /// Stop polling, let in-flight batches finish within the grace period,
    /// then abort whatever is still running.
    pub async fn shutdown(mut self) -> Vec<WorkerResult> {
        tracing::info!("Shutting down worker pool (grace {:?})", self.grace);
        self.running.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + self.grace;
        let mut results = Vec::with_capacity(self.workers.len());
        loop {
            match tokio::time::timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(result)) => results.push(joined(result)),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "{} workers did not stop within grace period; aborting",
                        self.workers.len()
                    );
                    self.workers.abort_all();
                    while let Some(result) = self.workers.join_next().await {
                        results.push(joined(result));
                    }
                    break;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::retry::RetryPolicy;
    use crate::consumer::source::{MessageSource, Record, SourceError};
    use crate::consumer::worker::{BatchError, BatchReport};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl SourceConnector for Unreachable {
        async fn connect(&self, _worker_id: usize) -> Result<Box<dyn MessageSource>, SourceError> {
            Err(SourceError::Connect("connection refused".to_string()))
        }
    }

    struct Accepts;

    #[async_trait]
    impl BatchHandler for Accepts {
        async fn handle_batch(&self, _worker: &str, records: &[Record]) -> Result<BatchReport, BatchError> {
            Ok(BatchReport {
                processed: records.len(),
                ..Default::default()
            })
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            topics: vec!["users".to_string()],
            poll_timeout: Duration::from_millis(5),
            init_retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialization_failure_ends_the_pool() {
        let mut pool = WorkerPool::start(
            2,
            Arc::new(Unreachable),
            Arc::new(Accepts),
            None,
            settings(),
            Duration::from_secs(1),
        );

        let first = tokio::time::timeout(Duration::from_secs(5), pool.next_exit())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Err(ConsumerError::InitializationFailed { .. })));

        let rest = pool.shutdown().await;
        assert_eq!(rest.len(), 1);
        assert!(rest.iter().all(|r| matches!(r, Err(ConsumerError::InitializationFailed { .. }))));
    }
}
