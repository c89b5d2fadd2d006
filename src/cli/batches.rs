use crate::cli::run::{require_config, RunError};
use crate::writer::{BatchEncoder, BatchUploader};
use std::io::{self, Write};
use std::path::Path;

fn uploader(config_path: Option<&Path>) -> Result<BatchUploader, RunError> {
    let config = require_config(config_path)?;
    Ok(BatchUploader::from_config(
        &config.object_store,
        &config.writer.key_prefix,
    )?)
}

pub async fn list(config_path: Option<&Path>, prefix: Option<&str>) -> Result<(), RunError> {
    let uploader = uploader(config_path)?;
    list_batches(&uploader, prefix, &mut io::stdout().lock()).await
}

pub async fn show(config_path: Option<&Path>, key: &str) -> Result<(), RunError> {
    let uploader = uploader(config_path)?;
    show_batch(&uploader, key, &mut io::stdout().lock()).await
}

/// One line per object: key, size in bytes, last modified.
pub async fn list_batches<W: Write>(
    uploader: &BatchUploader,
    prefix: Option<&str>,
    out: &mut W,
) -> Result<(), RunError> {
    for meta in uploader.list(prefix).await? {
        writeln!(
            out,
            "{}\t{}\t{}",
            meta.location,
            meta.size,
            meta.last_modified.to_rfc3339()
        )?;
    }
    Ok(())
}

/// Every event in the batch at `key`, as JSON lines.
pub async fn show_batch<W: Write>(
    uploader: &BatchUploader,
    key: &str,
    out: &mut W,
) -> Result<(), RunError> {
    let data = uploader.fetch(key).await?;
    for event in BatchEncoder::decode(data)? {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
    }
    Ok(())
}
