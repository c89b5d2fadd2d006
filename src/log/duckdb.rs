use super::partitioner::partition_for_key;
use super::{
    EventLog, LedgerCheck, LogEntry, LogError, LogPosition, OutboundRecord, PartitionClaim,
    ProducerLedger,
};
use async_trait::async_trait;
use chrono::Utc;
use duckdb::Connection;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Records pulled from the database per read round trip.
const FETCH_LIMIT: i64 = 256;

impl From<duckdb::Error> for LogError {
    fn from(e: duckdb::Error) -> Self {
        LogError::Storage(e.to_string())
    }
}

fn join_error(e: tokio::task::JoinError) -> LogError {
    LogError::Storage(format!("Task join error: {}", e))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, LogError> {
    conn.lock()
        .map_err(|_| LogError::Storage("connection lock poisoned".to_string()))
}

/// Single-topic durable log on a DuckDB file.
///
/// DuckDB holds an exclusive lock on its file, so the gateway and the writer
/// share one `DuckDbLog` inside one process. Readers are woken through
/// per-partition high-water marks rather than by polling the table.
pub struct DuckDbLog {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    high_water: Arc<Vec<watch::Sender<u64>>>,
    ledger: Arc<Mutex<ProducerLedger>>,
}

impl DuckDbLog {
    /// Open (or create) the log file and register `topic` with `partitions`.
    ///
    /// Reopening an existing topic with a different partition count is refused,
    /// since it would silently remap every key.
    pub fn open<P: AsRef<Path>>(path: P, topic: &str, partitions: u32) -> Result<Self, LogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LogError::Storage(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, topic, partitions)
    }

    pub fn in_memory(topic: &str, partitions: u32) -> Result<Self, LogError> {
        Self::from_connection(Connection::open_in_memory()?, topic, partitions)
    }

    fn from_connection(conn: Connection, topic: &str, partitions: u32) -> Result<Self, LogError> {
        if partitions == 0 {
            return Err(LogError::Storage(format!(
                "topic {} needs at least one partition",
                topic
            )));
        }

        init_schema(&conn)?;
        register_topic(&conn, topic, partitions)?;
        let marks = load_high_water(&conn, topic, partitions)?;

        tracing::info!(
            "Log topic {} ready with {} partitions ({} records)",
            topic,
            partitions,
            marks.iter().sum::<u64>()
        );

        let high_water = marks.into_iter().map(|m| watch::channel(m).0).collect();
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            topic: topic.to_string(),
            high_water: Arc::new(high_water),
            ledger: Arc::new(Mutex::new(ProducerLedger::default())),
        })
    }

    fn check_topic(&self, topic: &str) -> Result<(), LogError> {
        if topic == self.topic {
            Ok(())
        } else {
            Err(LogError::UnknownTopic(topic.to_string()))
        }
    }
}

fn init_schema(conn: &Connection) -> Result<(), LogError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS log_topics (
            topic VARCHAR PRIMARY KEY,
            partitions INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS log_records (
            topic VARCHAR NOT NULL,
            partition_id INTEGER NOT NULL,
            log_offset BIGINT NOT NULL,
            record_key VARCHAR NOT NULL,
            payload BLOB NOT NULL,
            headers VARCHAR NOT NULL,
            appended_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (topic, partition_id, log_offset)
        );
        CREATE TABLE IF NOT EXISTS consumer_offsets (
            group_id VARCHAR NOT NULL,
            topic VARCHAR NOT NULL,
            partition_id INTEGER NOT NULL,
            next_offset BIGINT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (group_id, topic, partition_id)
        );",
    )?;
    Ok(())
}

fn register_topic(conn: &Connection, topic: &str, partitions: u32) -> Result<(), LogError> {
    let mut stmt = conn.prepare("SELECT partitions FROM log_topics WHERE topic = ?")?;
    let mut rows = stmt.query(duckdb::params![topic])?;
    if let Some(row) = rows.next()? {
        let existing: i32 = row.get(0)?;
        if existing as u32 != partitions {
            return Err(LogError::Storage(format!(
                "topic {} was created with {} partitions but {} were requested",
                topic, existing, partitions
            )));
        }
        return Ok(());
    }

    conn.execute(
        "INSERT INTO log_topics (topic, partitions) VALUES (?, ?)",
        duckdb::params![topic, partitions as i32],
    )?;
    Ok(())
}

fn load_high_water(conn: &Connection, topic: &str, partitions: u32) -> Result<Vec<u64>, LogError> {
    let mut marks = vec![0u64; partitions as usize];
    let mut stmt = conn.prepare(
        "SELECT partition_id, max(log_offset) FROM log_records WHERE topic = ? GROUP BY partition_id",
    )?;
    let mut rows = stmt.query(duckdb::params![topic])?;
    while let Some(row) = rows.next()? {
        let partition: i32 = row.get(0)?;
        let max_offset: i64 = row.get(1)?;
        if let Some(mark) = marks.get_mut(partition as usize) {
            *mark = max_offset as u64 + 1;
        }
    }
    Ok(marks)
}

#[async_trait]
impl EventLog for DuckDbLog {
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<LogPosition, LogError> {
        self.check_topic(topic)?;

        let conn = self.conn.clone();
        let ledger = self.ledger.clone();
        let marks = self.high_water.clone();
        let topic = self.topic.clone();

        tokio::task::spawn_blocking(move || {
            let mut ledger = ledger
                .lock()
                .map_err(|_| LogError::Storage("producer ledger lock poisoned".to_string()))?;
            if let LedgerCheck::Duplicate(position) = ledger.check(record.producer.as_ref())? {
                return Ok(position);
            }

            let partition = partition_for_key(&record.key, marks.len() as u32);
            let mark = marks
                .get(partition as usize)
                .ok_or_else(|| LogError::UnknownPartition {
                    topic: topic.clone(),
                    partition,
                })?;
            let offset = *mark.borrow();
            let headers = serde_json::to_string(&record.headers)
                .map_err(|e| LogError::Storage(format!("cannot encode headers: {}", e)))?;

            {
                let conn = lock(&conn)?;
                conn.execute(
                    "INSERT INTO log_records (topic, partition_id, log_offset, record_key, payload, headers, appended_at)
                     VALUES (?, ?, ?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                    duckdb::params![
                        topic,
                        partition as i32,
                        offset as i64,
                        record.key,
                        record.value,
                        headers,
                        Utc::now().timestamp_micros(),
                    ],
                )?;
            }
            mark.send_replace(offset + 1);

            let position = LogPosition { partition, offset };
            ledger.record(record.producer.as_ref(), position);
            Ok(position)
        })
        .await
        .map_err(join_error)?
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, LogError> {
        self.check_topic(topic)?;
        Ok(self.high_water.len() as u32)
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Box<dyn PartitionClaim>, LogError> {
        self.check_topic(topic)?;
        let high_water = self
            .high_water
            .get(partition as usize)
            .ok_or_else(|| LogError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?
            .subscribe();

        let conn = self.conn.clone();
        let (topic_owned, group_owned) = (topic.to_string(), group.to_string());
        let committed = tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT next_offset FROM consumer_offsets
                 WHERE group_id = ? AND topic = ? AND partition_id = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![group_owned, topic_owned, partition as i32])?;
            match rows.next()? {
                Some(row) => Ok::<_, LogError>(Some(row.get::<_, i64>(0)? as u64)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_error)??;

        Ok(Box::new(DuckDbClaim {
            conn: self.conn.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            partition,
            cursor: committed.unwrap_or(0),
            committed,
            high_water,
            buffered: VecDeque::new(),
        }))
    }
}

struct DuckDbClaim {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    group: String,
    partition: u32,
    /// Offset of the next record handed out by `next`
    cursor: u64,
    committed: Option<u64>,
    high_water: watch::Receiver<u64>,
    buffered: VecDeque<LogEntry>,
}

impl DuckDbClaim {
    async fn fetch(&self) -> Result<Vec<LogEntry>, LogError> {
        let conn = self.conn.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        let from = self.cursor as i64;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT log_offset, record_key, payload, headers FROM log_records
                 WHERE topic = ? AND partition_id = ? AND log_offset >= ?
                 ORDER BY log_offset
                 LIMIT ?",
            )?;
            let mut rows =
                stmt.query(duckdb::params![topic, partition as i32, from, FETCH_LIMIT])?;

            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let headers: String = row.get(3)?;
                let headers: Vec<(String, String)> = serde_json::from_str(&headers)
                    .map_err(|e| LogError::Storage(format!("corrupt record headers: {}", e)))?;
                entries.push(LogEntry {
                    partition,
                    offset: row.get::<_, i64>(0)? as u64,
                    key: row.get(1)?,
                    value: row.get(2)?,
                    headers,
                });
            }
            Ok(entries)
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl PartitionClaim for DuckDbClaim {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Result<LogEntry, LogError> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                self.cursor = entry.offset + 1;
                return Ok(entry);
            }

            let high_water = *self.high_water.borrow_and_update();
            if self.cursor < high_water {
                let fetched = self.fetch().await?;
                if fetched.is_empty() {
                    return Err(LogError::Storage(format!(
                        "partition {} has no record at offset {} below high-water mark {}",
                        self.partition, self.cursor, high_water
                    )));
                }
                self.buffered.extend(fetched);
                continue;
            }

            self.high_water
                .changed()
                .await
                .map_err(|_| LogError::Closed)?;
        }
    }

    async fn commit(&mut self, next_offset: u64) -> Result<(), LogError> {
        let conn = self.conn.clone();
        let group = self.group.clone();
        let topic = self.topic.clone();
        let partition = self.partition;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO consumer_offsets (group_id, topic, partition_id, next_offset, updated_at)
                 VALUES (?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![
                    group,
                    topic,
                    partition as i32,
                    next_offset as i64,
                    Utc::now().timestamp_micros(),
                ],
            )?;
            Ok::<(), LogError>(())
        })
        .await
        .map_err(join_error)??;

        self.committed = Some(next_offset);
        Ok(())
    }

    fn committed(&self) -> Option<u64> {
        self.committed
    }
}
