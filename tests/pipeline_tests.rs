use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::memory::InMemory;
use object_store::path::Path;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tigerscope::config::WriterConfig;
use tigerscope::event::{TelemetryEvent, Validator};
use tigerscope::gateway::{Publisher, RetryPolicy};
use tigerscope::log::{DuckDbLog, EventLog, MemoryLog};
use tigerscope::writer::{
    run_writers, BatchCompression, BatchEncoder, BatchSink, BatchUploader, CommitPolicy,
    UploadError, WriterStats,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "telemetry.events";
const GROUP: &str = "tigerscope-writer";

/// Uploads to an in-memory store, failing the first `failures` attempts, and
/// remembers successful keys in upload order.
struct KeepingSink {
    uploader: BatchUploader,
    failures: u32,
    attempts: AtomicU32,
    keys: Mutex<Vec<Path>>,
}

impl KeepingSink {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            uploader: BatchUploader::new(Arc::new(InMemory::new()), "telemetry"),
            failures,
            attempts: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn batches(&self) -> Vec<Vec<TelemetryEvent>> {
        let keys = self.keys.lock().unwrap().clone();
        let mut batches = Vec::new();
        for key in keys {
            let data = self.uploader.fetch(key.as_ref()).await.unwrap();
            batches.push(BatchEncoder::decode(data).unwrap());
        }
        batches
    }

    async fn batch_sizes(&self) -> Vec<usize> {
        self.batches().await.iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl BatchSink for KeepingSink {
    async fn upload(&self, data: Bytes, at: DateTime<Utc>) -> Result<Path, UploadError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(UploadError::Config("store offline".to_string()));
        }
        let key = self.uploader.upload(data, at).await?;
        self.keys.lock().unwrap().push(key.clone());
        Ok(key)
    }
}

fn raw_event(customer_id: &str, seq: i32) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "service": "auth",
        "customer_id": customer_id,
        "endpoint": "/login",
        "method": "POST",
        "status_code": 200,
        "latency_ms": seq,
    }))
    .unwrap()
}

async fn publish_all(log: Arc<dyn EventLog>, events: &[(&str, i32)]) -> Vec<TelemetryEvent> {
    let validator = Validator::new("test");
    let publisher = Publisher::new(log, TOPIC, RetryPolicy::default());
    let mut published = Vec::new();
    for (customer_id, seq) in events {
        let event = validator.validate(&raw_event(customer_id, *seq)).unwrap();
        publisher.publish(&event).await.unwrap();
        published.push(event);
    }
    published
}

fn writer_config(flush_max_events: usize, flush_interval: Duration, commit: CommitPolicy) -> WriterConfig {
    WriterConfig {
        flush_max_events,
        flush_interval,
        commit,
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

fn spawn_writers(
    log: Arc<dyn EventLog>,
    config: WriterConfig,
    sink: Arc<KeepingSink>,
) -> (CancellationToken, JoinHandle<WriterStats>) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        let encoder = BatchEncoder::new(BatchCompression::Snappy, "pipeline-test");
        run_writers(log, TOPIC, &config, encoder, sink, token)
            .await
            .unwrap()
    });
    (shutdown, handle)
}

/// Wait until the writer group has committed `total` records across all partitions.
async fn wait_for_commits(log: &MemoryLog, total: u64) {
    let partitions = log.partition_count(TOPIC).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let committed: u64 = (0..partitions)
                .filter_map(|p| log.committed_offset(TOPIC, GROUP, p))
                .sum();
            if committed >= total {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("writers caught up");
}

#[tokio::test]
async fn test_every_event_persisted_once_in_customer_order() {
    let memory = Arc::new(MemoryLog::new(TOPIC, 6));
    let log: Arc<dyn EventLog> = memory.clone();
    let sink = KeepingSink::new(0);
    let (shutdown, handle) = spawn_writers(
        log.clone(),
        writer_config(25, Duration::from_secs(3600), CommitPolicy::OnAppend),
        sink.clone(),
    );

    let customers = ["acme", "globex", "initech", "umbrella", "hooli"];
    let plan: Vec<(&str, i32)> = (0..200)
        .map(|n| (customers[n % customers.len()], (n / customers.len()) as i32))
        .collect();
    let published = publish_all(log, &plan).await;

    wait_for_commits(&memory, 200).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.received, 200);
    assert_eq!(stats.flushed_events, 200);
    assert_eq!(stats.dropped, 0);

    let persisted: Vec<TelemetryEvent> = sink.batches().await.into_iter().flatten().collect();
    assert_eq!(persisted.len(), 200);

    let published_ids: HashSet<_> = published.iter().map(|e| e.trace_id.clone()).collect();
    let persisted_ids: HashSet<_> = persisted.iter().map(|e| e.trace_id.clone()).collect();
    assert_eq!(published_ids, persisted_ids);

    let mut per_customer: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for event in &persisted {
        per_customer
            .entry(event.customer_id.as_str())
            .or_default()
            .push(event.latency_ms);
    }
    for (customer, sequence) in per_customer {
        assert_eq!(sequence, (0..40).collect::<Vec<_>>(), "order broken for {}", customer);
    }
}

#[tokio::test]
async fn test_size_threshold_flushes_after_exactly_n_events() {
    let memory = Arc::new(MemoryLog::new(TOPIC, 6));
    let log: Arc<dyn EventLog> = memory.clone();
    let sink = KeepingSink::new(0);
    let (shutdown, handle) = spawn_writers(
        log.clone(),
        writer_config(500, Duration::from_secs(3600), CommitPolicy::OnAppend),
        sink.clone(),
    );

    let plan: Vec<(&str, i32)> = (0..501).map(|n| ("c1", n)).collect();
    publish_all(log, &plan).await;
    wait_for_commits(&memory, 501).await;
    assert_eq!(sink.batch_sizes().await, vec![500]);

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(sink.batch_sizes().await, vec![500, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_a_quiet_partition() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new(TOPIC, 6));
    let sink = KeepingSink::new(0);
    let (shutdown, handle) = spawn_writers(
        log.clone(),
        writer_config(500, Duration::from_secs(5), CommitPolicy::OnAppend),
        sink.clone(),
    );

    publish_all(log, &[("c1", 0), ("c1", 1), ("c1", 2)]).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(sink.batch_sizes().await, vec![3]);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(sink.batch_sizes().await, vec![3]);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_is_retried_on_the_next_trigger() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new(TOPIC, 6));
    let sink = KeepingSink::new(1);
    let (shutdown, handle) = spawn_writers(
        log.clone(),
        writer_config(500, Duration::from_secs(5), CommitPolicy::OnAppend),
        sink.clone(),
    );

    let published = publish_all(log, &[("c1", 0), ("c1", 1), ("c1", 2)]).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(sink.attempts(), 1);
    assert!(sink.batch_sizes().await.is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sink.attempts(), 2);

    shutdown.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.failed_flushes, 1);

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    let trace_ids: Vec<_> = batches[0].iter().map(|e| e.trace_id.clone()).collect();
    let expected: Vec<_> = published.iter().map(|e| e.trace_id.clone()).collect();
    assert_eq!(trace_ids, expected);
}

#[tokio::test]
async fn test_commit_after_upload_replays_unpersisted_events() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.duckdb");

    {
        let log: Arc<dyn EventLog> = Arc::new(DuckDbLog::open(&path, TOPIC, 3).unwrap());
        publish_all(log.clone(), &[("c1", 0), ("c2", 1), ("c3", 2), ("c1", 3)]).await;

        let offline = KeepingSink::new(u32::MAX);
        let (shutdown, handle) = spawn_writers(
            log,
            writer_config(500, Duration::from_secs(3600), CommitPolicy::AfterUpload),
            offline.clone(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.flushed_events, 0);
    }

    let log: Arc<dyn EventLog> = Arc::new(DuckDbLog::open(&path, TOPIC, 3).unwrap());
    let sink = KeepingSink::new(0);
    let (shutdown, handle) = spawn_writers(
        log,
        writer_config(500, Duration::from_secs(3600), CommitPolicy::AfterUpload),
        sink.clone(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.received, 4);

    let mut latencies: Vec<i32> = sink
        .batches()
        .await
        .into_iter()
        .flatten()
        .map(|e| e.latency_ms)
        .collect();
    latencies.sort();
    assert_eq!(latencies, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_commit_on_append_does_not_replay() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.duckdb");

    {
        let log: Arc<dyn EventLog> = Arc::new(DuckDbLog::open(&path, TOPIC, 3).unwrap());
        publish_all(log.clone(), &[("c1", 0), ("c2", 1)]).await;

        let offline = KeepingSink::new(u32::MAX);
        let (shutdown, handle) = spawn_writers(
            log,
            writer_config(500, Duration::from_secs(3600), CommitPolicy::OnAppend),
            offline,
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        assert_eq!(handle.await.unwrap().received, 2);
    }

    let log: Arc<dyn EventLog> = Arc::new(DuckDbLog::open(&path, TOPIC, 3).unwrap());
    let sink = KeepingSink::new(0);
    let (shutdown, handle) = spawn_writers(
        log,
        writer_config(500, Duration::from_secs(3600), CommitPolicy::OnAppend),
        sink.clone(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    assert_eq!(handle.await.unwrap().received, 0);
    assert!(sink.batch_sizes().await.is_empty());
}
