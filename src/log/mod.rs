//! Durable partitioned log contract and the backends that implement it.
//!
//! The gateway only ever calls [`EventLog::publish`]; the writer only ever
//! holds [`PartitionClaim`]s. Records with the same key always land on the same
//! partition (see [`partitioner`]), which is what gives per-customer ordering.

pub mod duckdb;
pub mod memory;
pub mod partitioner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub use self::duckdb::DuckDbLog;
pub use memory::MemoryLog;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("producer {producer_id} sent sequence {sequence} after {last}")]
    OutOfOrderSequence {
        producer_id: Uuid,
        sequence: u64,
        last: u64,
    },

    #[error("log storage error: {0}")]
    Storage(String),

    #[error("log closed")]
    Closed,
}

impl LogError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Unavailable(_))
    }
}

/// Identity of an idempotent producer attempt.
///
/// A retry carries the same stamp as the original attempt, letting the log
/// answer with the original position instead of appending twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStamp {
    pub producer_id: Uuid,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub producer: Option<ProducerStamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub partition: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a record keyed by `record.key` and report where it landed.
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<LogPosition, LogError>;

    async fn partition_count(&self, topic: &str) -> Result<u32, LogError>;

    /// Take exclusive read ownership of one partition for a consumer group.
    /// Reading resumes at the group's committed offset, or at the start of the
    /// partition when nothing has been committed yet.
    async fn claim(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Box<dyn PartitionClaim>, LogError>;
}

#[async_trait]
pub trait PartitionClaim: Send {
    fn partition(&self) -> u32;

    /// Wait for the record at the read cursor.
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the cursor
    /// where it was, so it can sit in a `select!` next to a timer.
    async fn next(&mut self) -> Result<LogEntry, LogError>;

    /// Mark every record before `next_offset` as handled by this group.
    async fn commit(&mut self, next_offset: u64) -> Result<(), LogError>;

    /// Last offset committed through this claim (or loaded when it was taken).
    fn committed(&self) -> Option<u64>;
}

pub(crate) enum LedgerCheck {
    Fresh,
    Duplicate(LogPosition),
}

/// Last accepted sequence per producer, for duplicate suppression on retry.
#[derive(Debug, Default)]
pub(crate) struct ProducerLedger {
    last: HashMap<Uuid, (u64, LogPosition)>,
}

impl ProducerLedger {
    pub(crate) fn check(&self, stamp: Option<&ProducerStamp>) -> Result<LedgerCheck, LogError> {
        let Some(stamp) = stamp else {
            return Ok(LedgerCheck::Fresh);
        };
        match self.last.get(&stamp.producer_id) {
            Some((last, position)) if *last == stamp.sequence => {
                Ok(LedgerCheck::Duplicate(*position))
            }
            Some((last, _)) if *last > stamp.sequence => Err(LogError::OutOfOrderSequence {
                producer_id: stamp.producer_id,
                sequence: stamp.sequence,
                last: *last,
            }),
            _ => Ok(LedgerCheck::Fresh),
        }
    }

    pub(crate) fn record(&mut self, stamp: Option<&ProducerStamp>, position: LogPosition) {
        if let Some(stamp) = stamp {
            self.last
                .insert(stamp.producer_id, (stamp.sequence, position));
        }
    }
}
