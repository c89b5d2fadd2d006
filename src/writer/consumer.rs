use crate::config::types::WriterConfig;
use crate::event::TelemetryEvent;
use crate::log::{EventLog, LogEntry, LogError, PartitionClaim};
use crate::writer::accumulator::Accumulator;
use crate::writer::encoder::{BatchEncoder, EncodeError};
use crate::writer::uploader::{BatchSink, UploadError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed read before asking the log again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// When a consumed offset is committed back to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// As soon as the event is buffered. A crash before the next successful
    /// upload loses the buffered batch.
    #[default]
    OnAppend,
    /// Only once the batch holding the event has been uploaded. A crash
    /// replays the batch instead.
    AfterUpload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub received: u64,
    pub dropped: u64,
    pub flushed_batches: u64,
    pub flushed_events: u64,
    pub failed_flushes: u64,
}

impl std::ops::AddAssign for WriterStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.dropped += other.dropped;
        self.flushed_batches += other.flushed_batches;
        self.flushed_events += other.flushed_events;
        self.failed_flushes += other.failed_flushes;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Timer,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Size => write!(f, "size"),
            FlushReason::Timer => write!(f, "timer"),
            FlushReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Single-task loop for one claimed partition.
///
/// Message arrival, the flush timer and shutdown are multiplexed in one
/// `select!`, so an append and a flush never overlap on the same buffer.
pub struct PartitionWriter {
    claim: Box<dyn PartitionClaim>,
    accumulator: Accumulator,
    encoder: BatchEncoder,
    sink: Arc<dyn BatchSink>,
    commit: CommitPolicy,
    flush_interval: Duration,
    shutdown_grace: Duration,
    /// Offset after the last entry handed to this writer
    handled_through: Option<u64>,
    /// Set after a failed flush; the next attempt waits for this instant
    retry_at: Option<Instant>,
    stats: WriterStats,
}

impl PartitionWriter {
    pub fn new(
        claim: Box<dyn PartitionClaim>,
        config: &WriterConfig,
        encoder: BatchEncoder,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self {
            claim,
            accumulator: Accumulator::new(config.flush_max_events, config.flush_interval),
            encoder,
            sink,
            commit: config.commit,
            flush_interval: config.flush_interval,
            shutdown_grace: config.shutdown_grace,
            handled_through: None,
            retry_at: None,
            stats: WriterStats::default(),
        }
    }

    pub fn partition(&self) -> u32 {
        self.claim.partition()
    }

    /// Consume until `shutdown` fires, then flush what is buffered (bounded by
    /// the shutdown grace) and return the counters.
    pub async fn run(mut self, shutdown: CancellationToken) -> WriterStats {
        let partition = self.partition();
        info!(
            partition,
            committed = ?self.claim.committed(),
            commit_policy = ?self.commit,
            "Partition writer started"
        );

        loop {
            let deadline = self.retry_at.unwrap_or_else(|| self.accumulator.deadline());

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = tokio::time::sleep_until(deadline), if !self.accumulator.is_empty() => {
                    if self.accumulator.should_flush_at(deadline) {
                        self.flush(FlushReason::Timer).await;
                    }
                }

                entry = self.claim.next() => match entry {
                    Ok(entry) => self.handle(entry).await,
                    Err(LogError::Closed) => {
                        warn!(partition, "Log closed, stopping partition writer");
                        break;
                    }
                    Err(e) => {
                        error!(partition, error = %e, "Failed to read from log");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                        }
                    }
                },
            }
        }

        if !self.accumulator.is_empty() {
            let buffered = self.accumulator.len();
            match tokio::time::timeout(self.shutdown_grace, self.flush(FlushReason::Shutdown)).await {
                Ok(true) => {}
                Ok(false) => error!(
                    partition,
                    buffered, "Final flush failed, buffered events are lost"
                ),
                Err(_) => error!(
                    partition,
                    buffered,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "Final flush did not finish within the shutdown grace period"
                ),
            }
        }

        info!(
            partition,
            received = self.stats.received,
            dropped = self.stats.dropped,
            flushed_batches = self.stats.flushed_batches,
            flushed_events = self.stats.flushed_events,
            failed_flushes = self.stats.failed_flushes,
            "Partition writer stopped"
        );
        self.stats
    }

    async fn handle(&mut self, entry: LogEntry) {
        self.stats.received += 1;
        let next_offset = entry.offset + 1;

        match TelemetryEvent::from_log_payload(&entry.value) {
            Ok(event) => {
                self.accumulator.append(event);
                self.handled_through = Some(next_offset);
                if self.commit == CommitPolicy::OnAppend {
                    self.commit(next_offset).await;
                }

                // While a failed batch waits for its retry, neither trigger
                // starts another attempt.
                if self.retry_at.is_none() && self.accumulator.should_flush() {
                    let reason = if self.accumulator.is_full() {
                        FlushReason::Size
                    } else {
                        FlushReason::Timer
                    };
                    self.flush(reason).await;
                }
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!(
                    partition = entry.partition,
                    offset = entry.offset,
                    error = %e,
                    "Dropping unparseable message"
                );
                self.handled_through = Some(next_offset);
                if self.commit == CommitPolicy::OnAppend || self.accumulator.is_empty() {
                    self.commit(next_offset).await;
                }
            }
        }
    }

    async fn commit(&mut self, next_offset: u64) {
        if let Err(e) = self.claim.commit(next_offset).await {
            error!(
                partition = self.claim.partition(),
                offset = next_offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }

    /// Encode and upload the buffer. The buffer is drained only once the
    /// upload has succeeded; on failure it is kept intact for the next trigger.
    async fn flush(&mut self, reason: FlushReason) -> bool {
        if self.accumulator.is_empty() {
            return true;
        }

        let partition = self.claim.partition();
        debug!(partition, %reason, buffered = self.accumulator.len(), "Flushing batch");
        let result = match self.encoder.encode(self.accumulator.pending(), partition) {
            Ok(data) => {
                let bytes = data.len();
                self.sink
                    .upload(data, Utc::now())
                    .await
                    .map(|key| (key, bytes))
                    .map_err(ConsumerError::from)
            }
            Err(e) => Err(ConsumerError::from(e)),
        };

        match result {
            Ok((key, bytes)) => {
                let batch = self.accumulator.drain();
                self.retry_at = None;
                self.stats.flushed_batches += 1;
                self.stats.flushed_events += batch.len() as u64;
                info!(
                    partition,
                    %key,
                    events = batch.len(),
                    bytes,
                    %reason,
                    "Flushed batch"
                );

                if self.commit == CommitPolicy::AfterUpload {
                    if let Some(next_offset) = self.handled_through {
                        self.commit(next_offset).await;
                    }
                }
                true
            }
            Err(e) => {
                self.stats.failed_flushes += 1;
                self.retry_at = Some(Instant::now() + self.flush_interval);
                error!(
                    partition,
                    %reason,
                    buffered = self.accumulator.len(),
                    error = %e,
                    "Flush failed, batch retained for the next trigger"
                );
                false
            }
        }
    }
}

/// Claim the configured partitions and run one [`PartitionWriter`] per
/// partition until `shutdown` fires. Returns the summed counters.
pub async fn run_writers(
    log: Arc<dyn EventLog>,
    topic: &str,
    config: &WriterConfig,
    encoder: BatchEncoder,
    sink: Arc<dyn BatchSink>,
    shutdown: CancellationToken,
) -> Result<WriterStats, ConsumerError> {
    let count = log.partition_count(topic).await?;
    let partitions: Vec<u32> = match &config.partitions {
        Some(list) => list.clone(),
        None => (0..count).collect(),
    };

    let mut handles = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let claim = log.claim(topic, &config.group, partition).await?;
        let writer = PartitionWriter::new(claim, config, encoder.clone(), sink.clone());
        handles.push(tokio::spawn(writer.run(shutdown.clone())));
    }

    info!(
        topic,
        group = %config.group,
        writers = handles.len(),
        "Batch writers running"
    );

    let mut total = WriterStats::default();
    for result in futures::future::join_all(handles).await {
        total += result?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::make_event;
    use crate::log::{MemoryLog, OutboundRecord};
    use crate::writer::encoder::BatchCompression;
    use crate::writer::test_support::{FlakySink, RecordingSink};

    const TOPIC: &str = "telemetry.events";
    const GROUP: &str = "tigerscope-writer";

    fn config(max_events: usize, interval_secs: u64, commit: CommitPolicy) -> WriterConfig {
        WriterConfig {
            flush_max_events: max_events,
            flush_interval: Duration::from_secs(interval_secs),
            commit,
            ..Default::default()
        }
    }

    fn encoder() -> BatchEncoder {
        BatchEncoder::new(BatchCompression::Snappy, "test-writer")
    }

    async fn publish_events(log: &MemoryLog, customer: &str, range: std::ops::Range<i64>) {
        for n in range {
            let event = make_event(customer, n);
            log.publish(
                TOPIC,
                OutboundRecord {
                    key: event.customer_id.clone(),
                    value: event.to_log_payload().unwrap(),
                    headers: vec![],
                    producer: None,
                },
            )
            .await
            .unwrap();
        }
    }

    async fn publish_raw(log: &MemoryLog, value: &[u8]) {
        log.publish(
            TOPIC,
            OutboundRecord {
                key: "c1".to_string(),
                value: value.to_vec(),
                headers: vec![],
                producer: None,
            },
        )
        .await
        .unwrap();
    }

    async fn spawn_writer(
        log: &MemoryLog,
        config: &WriterConfig,
        sink: Arc<dyn BatchSink>,
    ) -> (CancellationToken, tokio::task::JoinHandle<WriterStats>) {
        let claim = log.claim(TOPIC, GROUP, 0).await.unwrap();
        let writer = PartitionWriter::new(claim, config, encoder(), sink);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(writer.run(shutdown.clone()));
        (shutdown, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch_once() {
        let log = MemoryLog::new(TOPIC, 1);
        let sink = Arc::new(RecordingSink::default());
        publish_events(&log, "c1", 0..3).await;

        let (shutdown, handle) = spawn_writer(&log, &config(500, 5, CommitPolicy::OnAppend), sink.clone()).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(sink.batches().len(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.batch_sizes(), vec![3]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sink.batch_sizes(), vec![3]);

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.flushed_batches, 1);
        assert_eq!(stats.flushed_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upload_is_retried_without_loss() {
        let log = MemoryLog::new(TOPIC, 1);
        let sink = Arc::new(FlakySink::new(1));
        publish_events(&log, "c1", 0..3).await;

        let (shutdown, handle) = spawn_writer(&log, &config(500, 5, CommitPolicy::OnAppend), sink.clone()).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.attempts(), 1);
        assert!(sink.inner.batches().is_empty());

        publish_events(&log, "c1", 3..5).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.attempts(), 2);

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.flushed_batches, 1);

        let batches = sink.inner.batches();
        assert_eq!(batches.len(), 1);
        let latencies: Vec<i32> = batches[0].iter().map(|e| e.latency_ms).collect();
        assert_eq!(latencies, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_message_is_committed_and_skipped() {
        let log = MemoryLog::new(TOPIC, 1);
        let sink = Arc::new(RecordingSink::default());
        publish_raw(&log, b"{definitely not an event").await;
        publish_events(&log, "c1", 0..1).await;

        let (shutdown, handle) = spawn_writer(&log, &config(500, 5, CommitPolicy::OnAppend), sink.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(log.committed_offset(TOPIC, GROUP, 0), Some(2));

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(sink.batch_sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_upload_defers_commit() {
        let log = MemoryLog::new(TOPIC, 1);
        let sink = Arc::new(RecordingSink::default());
        publish_events(&log, "c1", 0..2).await;

        let (shutdown, handle) =
            spawn_writer(&log, &config(500, 5, CommitPolicy::AfterUpload), sink.clone()).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(log.committed_offset(TOPIC, GROUP, 0), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.batch_sizes(), vec![2]);
        assert_eq!(log.committed_offset(TOPIC, GROUP, 0), Some(2));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_buffer() {
        let log = MemoryLog::new(TOPIC, 1);
        let sink = Arc::new(RecordingSink::default());
        publish_events(&log, "c1", 0..7).await;

        let (shutdown, handle) = spawn_writer(&log, &config(500, 60, CommitPolicy::OnAppend), sink.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sink.batches().is_empty());

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(sink.batch_sizes(), vec![7]);
        assert_eq!(stats.flushed_events, 7);
    }

    /// Accepts uploads and never finishes them.
    struct StalledSink;

    #[async_trait::async_trait]
    impl BatchSink for StalledSink {
        async fn upload(
            &self,
            _data: bytes::Bytes,
            _at: chrono::DateTime<Utc>,
        ) -> Result<object_store::path::Path, UploadError> {
            std::future::pending().await
        }
    }

    /// A claim whose log is permanently unreachable.
    struct UnreachableClaim;

    #[async_trait::async_trait]
    impl PartitionClaim for UnreachableClaim {
        fn partition(&self) -> u32 {
            0
        }

        async fn next(&mut self) -> Result<LogEntry, LogError> {
            Err(LogError::Unavailable("connection refused".to_string()))
        }

        async fn commit(&mut self, _next_offset: u64) -> Result<(), LogError> {
            Ok(())
        }

        fn committed(&self) -> Option<u64> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_is_bounded_by_grace() {
        let log = MemoryLog::new(TOPIC, 1);
        publish_events(&log, "c1", 0..4).await;

        let config = WriterConfig {
            shutdown_grace: Duration::from_secs(2),
            ..config(500, 60, CommitPolicy::OnAppend)
        };
        let (shutdown, handle) = spawn_writer(&log, &config, Arc::new(StalledSink)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let cancelled_at = Instant::now();
        shutdown.cancel();
        let stats = handle.await.unwrap();

        let waited = cancelled_at.elapsed();
        assert!(waited >= Duration::from_secs(2), "{:?}", waited);
        assert!(waited < Duration::from_secs(3), "{:?}", waited);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.flushed_batches, 0);
        assert_eq!(stats.flushed_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_read_error_backoff() {
        let writer = PartitionWriter::new(
            Box::new(UnreachableClaim),
            &config(500, 5, CommitPolicy::OnAppend),
            encoder(),
            Arc::new(RecordingSink::default()),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(writer.run(shutdown.clone()));

        // Let the writer hit the first read error and start backing off.
        tokio::time::sleep(READ_ERROR_BACKOFF / 2).await;

        let cancelled_at = Instant::now();
        shutdown.cancel();
        let stats = handle.await.unwrap();

        assert!(cancelled_at.elapsed() < READ_ERROR_BACKOFF / 2);
        assert_eq!(stats.received, 0);
    }

    #[tokio::test]
    async fn test_size_trigger_fires_on_the_limit() {
        let log = MemoryLog::new(TOPIC, 1);
        let sink = Arc::new(RecordingSink::default());
        publish_events(&log, "c1", 0..501).await;

        let (shutdown, handle) = spawn_writer(&log, &config(500, 3600, CommitPolicy::OnAppend), sink.clone()).await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while log.committed_offset(TOPIC, GROUP, 0) != Some(501) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.batch_sizes(), vec![500]);

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(sink.batch_sizes(), vec![500, 1]);
    }

    #[tokio::test]
    async fn test_run_writers_covers_every_partition() {
        let log = Arc::new(MemoryLog::new(TOPIC, 4));
        let sink = Arc::new(RecordingSink::default());
        for customer in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            publish_events(&log, customer, 0..5).await;
        }

        let shutdown = CancellationToken::new();
        let task = {
            let log: Arc<dyn EventLog> = log.clone();
            let sink: Arc<dyn BatchSink> = sink.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let config = config(500, 3600, CommitPolicy::OnAppend);
                run_writers(log, TOPIC, &config, encoder(), sink, shutdown).await
            })
        };

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let committed: u64 = (0..4)
                    .filter_map(|p| log.committed_offset(TOPIC, GROUP, p))
                    .sum();
                if committed == 40 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.received, 40);
        assert_eq!(stats.flushed_events, 40);
        let total: usize = sink.batch_sizes().iter().sum();
        assert_eq!(total, 40);
    }
}
