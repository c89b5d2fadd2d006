//! Log consumer that turns partitions into Parquet batches in object storage.

pub mod accumulator;
pub mod consumer;
pub mod encoder;
pub mod uploader;

pub use accumulator::{Accumulator, Batch};
pub use consumer::{run_writers, CommitPolicy, ConsumerError, PartitionWriter, WriterStats};
pub use encoder::{BatchCompression, BatchEncoder, EncodeError};
pub use uploader::{BatchSink, BatchUploader, UploadError};
