use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use entity_fabric::consumer::{
    BatchError, BatchHandler, BatchReport, ConsumerError, MemoryBroker, MemoryDlq, Record, RetryPolicy, WorkerPool,
    WorkerSettings,
};
use entity_fabric::diesel_runtime::{EntityKind, MemoryStore, StoreError, TransactionWork, TransactionalStore};
use entity_fabric::ingestion::IngestionCoordinator;
use entity_fabric::output::DatabaseSink;
use entity_fabric::processing::EntityProcessor;
use entity_fabric::transformer::{registration, MicrosoftEntityTransformer, TransformerFactory};
use entity_fabric::VendorType;
use serde_json::json;

/// Refuses connections for the first `outages` transactions.
struct Flaky {
    inner: Arc<MemoryStore>,
    outages: AtomicU32,
}

impl TransactionalStore for Flaky {
    fn in_transaction(&self, work: &mut TransactionWork<'_>) -> Result<(), StoreError> {
        let remaining = self.outages.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outages.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        self.inner.in_transaction(work)
    }
}

fn settings(max_attempts: u32) -> WorkerSettings {
    WorkerSettings {
        topics: vec!["entities".to_string()],
        poll_timeout: Duration::from_millis(5),
        max_poll_records: 10,
        init_retry: RetryPolicy::fixed(1, Duration::from_millis(1)),
        batch_retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
        max_poll_failures: 3,
        dlq_topic: Some("dlq.entities".to_string()),
    }
}

fn processor(store: Arc<dyn TransactionalStore>) -> EntityProcessor {
    let factory = TransformerFactory::new(vec![registration(VendorType::Microsoft, MicrosoftEntityTransformer::new())]);
    EntityProcessor::new(
        Arc::new(factory),
        Arc::new(DatabaseSink::new(IngestionCoordinator::new(store))),
        true,
    )
}

fn user(id: &str, groups: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "vendor": "microsoft",
        "type": "users",
        "tenant": "T1",
        "data": {"id": id, "department": "Eng", "groups": groups}
    }))
    .unwrap()
}

async fn wait_for(done: impl Fn() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pool_ingests_and_dead_letters() {
    let broker = MemoryBroker::new();
    broker.publish("entities.0", Some("u1"), user("U1", json!([])));
    broker.publish("entities.1", Some("bad"), b"{not json".to_vec());
    broker.publish("entities.1", Some("u2"), user("U2", json!([{"id": "G1"}])));
    broker.publish("entities.0", Some("u3"), user("U3", json!([{"id": "G1"}])));

    let store = Arc::new(MemoryStore::new());
    let dlq = MemoryDlq::new();
    let pool = WorkerPool::start(
        2,
        Arc::new(broker.connector()),
        Arc::new(processor(store.clone())),
        Some(Arc::new(dlq.clone())),
        settings(3),
        Duration::from_secs(5),
    );

    wait_for(|| broker.lag() == 0).await;
    let results = pool.shutdown().await;
    assert!(results.iter().all(|r| r.is_ok()));

    assert_eq!(broker.lag(), 0);
    assert_eq!(broker.committed("entities.0"), 2);
    assert_eq!(broker.committed("entities.1"), 2);

    let state = store.snapshot();
    assert_eq!(state.count(EntityKind::User), 3);
    assert_eq!(state.count(EntityKind::Department), 1);
    assert_eq!(state.count(EntityKind::Group), 1);
    assert_eq!(state.count(EntityKind::UserGroup), 2);

    let sent = dlq.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "dlq.entities");
    assert_eq!(sent[0].1.as_deref(), Some("bad"));
}

#[tokio::test]
async fn test_ingest_failure_only_fails_its_record() {
    let broker = MemoryBroker::new();
    broker.publish("entities.0", Some("u1"), user("U1", json!([])));
    broker.publish("entities.0", Some("u2"), user("U2", json!([{"id": "G1"}])));

    let store = Arc::new(MemoryStore::new());
    store.fail_on(EntityKind::Group);
    let dlq = MemoryDlq::new();
    let pool = WorkerPool::start(
        1,
        Arc::new(broker.connector()),
        Arc::new(processor(store.clone())),
        Some(Arc::new(dlq.clone())),
        settings(3),
        Duration::from_secs(5),
    );

    wait_for(|| broker.lag() == 0).await;
    pool.shutdown().await;

    // U2's graph rolled back as a whole
    let state = store.snapshot();
    assert_eq!(state.count(EntityKind::User), 1);
    assert_eq!(state.count(EntityKind::UserDepartment), 1);
    assert_eq!(dlq.sent().len(), 1);
    assert_eq!(dlq.sent()[0].1.as_deref(), Some("u2"));
}

#[tokio::test]
async fn test_store_outage_retries_batch() {
    let broker = MemoryBroker::new();
    broker.publish("entities.0", Some("u1"), user("U1", json!([])));
    broker.publish("entities.0", Some("u2"), user("U2", json!([])));

    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(Flaky {
        inner: store.clone(),
        outages: AtomicU32::new(2),
    });
    let dlq = MemoryDlq::new();
    let pool = WorkerPool::start(
        1,
        Arc::new(broker.connector()),
        Arc::new(processor(flaky)),
        Some(Arc::new(dlq.clone())),
        settings(5),
        Duration::from_secs(5),
    );

    wait_for(|| broker.lag() == 0).await;
    let results = pool.shutdown().await;

    assert_eq!(broker.committed("entities.0"), 2);
    assert_eq!(store.snapshot().count(EntityKind::User), 2);
    assert!(dlq.sent().is_empty());
    let stats = results.into_iter().next().unwrap().unwrap();
    assert_eq!(stats.batches_abandoned, 0);
}

#[tokio::test]
async fn test_abandoned_batch_is_not_committed() {
    let broker = MemoryBroker::new();
    broker.publish("entities.0", Some("u1"), user("U1", json!([])));

    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(Flaky {
        inner: store.clone(),
        outages: AtomicU32::new(u32::MAX),
    });
    let pool = WorkerPool::start(
        1,
        Arc::new(broker.connector()),
        Arc::new(processor(flaky)),
        None,
        settings(2),
        Duration::from_secs(5),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let results = pool.shutdown().await;

    assert_eq!(broker.committed("entities.0"), 0);
    assert_eq!(broker.lag(), 1);
    assert_eq!(store.snapshot().total(), 0);
    let stats = results.into_iter().next().unwrap().unwrap();
    assert!(stats.batches_abandoned >= 1);
}

/// Never finishes a batch within any reasonable grace period.
struct Stuck;

#[async_trait]
impl BatchHandler for Stuck {
    async fn handle_batch(&self, _worker: &str, _records: &[Record]) -> Result<BatchReport, BatchError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(BatchReport::default())
    }
}

#[tokio::test]
async fn test_shutdown_commits_processed_offsets() {
    let broker = MemoryBroker::new();
    broker.publish("entities.0", Some("u1"), user("U1", json!([])));
    // Every in-loop commit attempt fails; only the drain commit lands
    broker.fail_commits(3);

    let store = Arc::new(MemoryStore::new());
    let pool = WorkerPool::start(
        1,
        Arc::new(broker.connector()),
        Arc::new(processor(store.clone())),
        None,
        settings(3),
        Duration::from_secs(5),
    );

    wait_for(|| store.snapshot().count(EntityKind::User) == 1).await;
    assert_eq!(broker.committed("entities.0"), 0);

    let results = pool.shutdown().await;
    assert_eq!(broker.committed("entities.0"), 1);
    assert_eq!(broker.lag(), 0);

    let stats = results.into_iter().next().unwrap().unwrap();
    assert_eq!(stats.records_processed, 1);
    assert_eq!(stats.batches_abandoned, 0);
}

#[tokio::test]
async fn test_shutdown_aborts_stuck_worker_after_grace() {
    let broker = MemoryBroker::new();
    broker.publish("entities.0", Some("u1"), user("U1", json!([])));

    let pool = WorkerPool::start(
        1,
        Arc::new(broker.connector()),
        Arc::new(Stuck),
        None,
        settings(1),
        Duration::from_millis(50),
    );
    // Let the worker pick up the batch
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let results = pool.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(ConsumerError::Join(reason)) => assert!(reason.contains("grace period")),
        other => panic!("expected an aborted worker, got {:?}", other),
    }
    assert_eq!(broker.committed("entities.0"), 0);
}
