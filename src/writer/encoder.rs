//! Parquet encoding of drained batches, and the matching reader used by
//! `tigerscope batches show`.
//!
//! Column layout is a contract with downstream readers. `attributes` is not
//! persisted.

use crate::event::{TelemetryEvent, SCHEMA_VERSION};
use arrow::array::{Array, ArrayRef, Int32Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::errors::ParquetError;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

pub const CONTENT_TYPE: &str = "application/vnd.apache.parquet";
pub const FILE_EXTENSION: &str = "parquet";

pub const META_SCHEMA_VERSION: &str = "tigerscope:schema_version";
pub const META_WRITER: &str = "tigerscope:writer";
pub const META_PARTITION: &str = "tigerscope:partition";
pub const META_EVENT_COUNT: &str = "tigerscope:event_count";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("refusing to encode an empty batch")]
    Empty,

    #[error("row {row} is missing required fields: {}", .fields.join(", "))]
    InvalidRow {
        row: usize,
        fields: Vec<&'static str>,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("column '{0}' is missing or has an unexpected type")]
    Column(String),

    #[error("column '{column}' row {row} holds an out-of-range timestamp")]
    Timestamp { column: &'static str, row: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchCompression {
    #[default]
    Snappy,
    Zstd,
    None,
}

impl BatchCompression {
    fn codec(self) -> Compression {
        match self {
            BatchCompression::Snappy => Compression::SNAPPY,
            BatchCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            BatchCompression::None => Compression::UNCOMPRESSED,
        }
    }
}

/// Schema of every persisted batch.
pub fn batch_schema() -> SchemaRef {
    let millis_utc = DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()));
    Arc::new(Schema::new(vec![
        Field::new("timestamp", millis_utc.clone(), false),
        Field::new("service", DataType::Utf8, false),
        Field::new("customer_id", DataType::Utf8, false),
        Field::new("endpoint", DataType::Utf8, false),
        Field::new("method", DataType::Utf8, false),
        Field::new("status_code", DataType::Int32, false),
        Field::new("latency_ms", DataType::Int32, false),
        Field::new("trace_id", DataType::Utf8, false),
        Field::new("error", DataType::Utf8, true),
        Field::new("environment", DataType::Utf8, false),
        Field::new("schema_version", DataType::Int32, false),
        Field::new("ingested_at", millis_utc, false),
    ]))
}

#[derive(Debug, Clone)]
pub struct BatchEncoder {
    compression: BatchCompression,
    writer_id: String,
}

impl BatchEncoder {
    pub fn new(compression: BatchCompression, writer_id: impl Into<String>) -> Self {
        Self {
            compression,
            writer_id: writer_id.into(),
        }
    }

    /// Encode `events` as one Parquet file. Any invalid row fails the whole
    /// batch; nothing is ever written partially.
    pub fn encode(&self, events: &[TelemetryEvent], partition: u32) -> Result<Bytes, EncodeError> {
        if events.is_empty() {
            return Err(EncodeError::Empty);
        }
        for (row, event) in events.iter().enumerate() {
            let fields = event.missing_fields();
            if !fields.is_empty() {
                return Err(EncodeError::InvalidRow { row, fields });
            }
        }

        let schema = batch_schema();
        let strings = |f: fn(&TelemetryEvent) -> &str| -> ArrayRef {
            Arc::new(StringArray::from(events.iter().map(f).collect::<Vec<_>>()))
        };
        let ints = |f: fn(&TelemetryEvent) -> i32| -> ArrayRef {
            Arc::new(Int32Array::from(events.iter().map(f).collect::<Vec<_>>()))
        };
        let millis = |f: fn(&TelemetryEvent) -> DateTime<Utc>| -> ArrayRef {
            Arc::new(
                TimestampMillisecondArray::from(
                    events.iter().map(|e| f(e).timestamp_millis()).collect::<Vec<_>>(),
                )
                .with_timezone("UTC"),
            )
        };
        let errors: ArrayRef = Arc::new(StringArray::from(
            events.iter().map(|e| e.error.as_deref()).collect::<Vec<_>>(),
        ));

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                millis(|e| e.timestamp),
                strings(|e| &e.service),
                strings(|e| &e.customer_id),
                strings(|e| &e.endpoint),
                strings(|e| &e.method),
                ints(|e| e.status_code),
                ints(|e| e.latency_ms),
                strings(|e| &e.trace_id),
                errors,
                strings(|e| &e.environment),
                ints(|e| e.schema_version),
                millis(|e| e.ingested_at),
            ],
        )?;

        let metadata = vec![
            KeyValue::new(META_SCHEMA_VERSION.to_string(), SCHEMA_VERSION.to_string()),
            KeyValue::new(META_WRITER.to_string(), self.writer_id.clone()),
            KeyValue::new(META_PARTITION.to_string(), partition.to_string()),
            KeyValue::new(META_EVENT_COUNT.to_string(), events.len().to_string()),
        ];
        let properties = WriterProperties::builder()
            .set_compression(self.compression.codec())
            .set_key_value_metadata(Some(metadata))
            .build();

        let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(properties))?;
        writer.write(&batch)?;
        Ok(Bytes::from(writer.into_inner()?))
    }

    /// Read a persisted batch back into events. `attributes` is always empty
    /// and `request_id` is not stored, so it comes back blank.
    pub fn decode(bytes: Bytes) -> Result<Vec<TelemetryEvent>, EncodeError> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;

        let mut events = Vec::new();
        for batch in reader {
            let batch = batch?;
            let timestamp = column::<TimestampMillisecondArray>(&batch, "timestamp")?;
            let service = column::<StringArray>(&batch, "service")?;
            let customer_id = column::<StringArray>(&batch, "customer_id")?;
            let endpoint = column::<StringArray>(&batch, "endpoint")?;
            let method = column::<StringArray>(&batch, "method")?;
            let status_code = column::<Int32Array>(&batch, "status_code")?;
            let latency_ms = column::<Int32Array>(&batch, "latency_ms")?;
            let trace_id = column::<StringArray>(&batch, "trace_id")?;
            let error = column::<StringArray>(&batch, "error")?;
            let environment = column::<StringArray>(&batch, "environment")?;
            let schema_version = column::<Int32Array>(&batch, "schema_version")?;
            let ingested_at = column::<TimestampMillisecondArray>(&batch, "ingested_at")?;

            for row in 0..batch.num_rows() {
                events.push(TelemetryEvent {
                    timestamp: millis_at(timestamp, "timestamp", row)?,
                    service: service.value(row).to_string(),
                    customer_id: customer_id.value(row).to_string(),
                    endpoint: endpoint.value(row).to_string(),
                    method: method.value(row).to_string(),
                    status_code: status_code.value(row),
                    latency_ms: latency_ms.value(row),
                    trace_id: trace_id.value(row).to_string(),
                    error: (!error.is_null(row)).then(|| error.value(row).to_string()),
                    attributes: BTreeMap::new(),
                    request_id: String::new(),
                    ingested_at: millis_at(ingested_at, "ingested_at", row)?,
                    schema_version: schema_version.value(row),
                    environment: environment.value(row).to_string(),
                });
            }
        }
        Ok(events)
    }

    /// Key-value metadata stored in the file footer.
    pub fn read_metadata(bytes: Bytes) -> Result<HashMap<String, String>, EncodeError> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let pairs = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .map(|kv| {
                kv.iter()
                    .filter(|kv| kv.key.starts_with("tigerscope:"))
                    .map(|kv| (kv.key.clone(), kv.value.clone().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(pairs)
    }
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, EncodeError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| EncodeError::Column(name.to_string()))
}

fn millis_at(
    array: &TimestampMillisecondArray,
    column: &'static str,
    row: usize,
) -> Result<DateTime<Utc>, EncodeError> {
    DateTime::from_timestamp_millis(array.value(row)).ok_or(EncodeError::Timestamp { column, row })
}
