use crate::config::{load_config, Config, ConfigError, LogBackend, LogConfig};
use crate::event::Validator;
use crate::gateway::{serve, GatewayState, Publisher};
use crate::log::{DuckDbLog, EventLog, LogError, MemoryLog};
use crate::writer::{
    run_writers, BatchEncoder, BatchSink, BatchUploader, ConsumerError, EncodeError, UploadError,
    WriterStats,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "config not found\nSearched locations:\n  ~/.config/tigerscope/config.yml\n  /etc/tigerscope/config.yml\n\n\
         Use --config <path> to specify a config file, or run 'tigerscope config init' to generate one."
    )]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("object store error: {0}")]
    Upload(#[from] UploadError),

    #[error("writer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("gateway error: {0}")]
    Gateway(#[source] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cannot read batch: {0}")]
    Decode(#[from] EncodeError),

    #[error("cannot print batch: {0}")]
    Json(#[from] serde_json::Error),

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

/// Load the config at `config_path`, failing with the searched locations
/// when no file was found.
pub fn require_config(config_path: Option<&Path>) -> Result<Config, RunError> {
    let path = config_path.ok_or(RunError::ConfigNotFound)?;
    info!(config_path = %path.display(), "Loading configuration");
    Ok(load_config(path)?)
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config = require_config(config_path.as_deref())?;

    let log = open_log(&config.log)?;
    let sink: Arc<dyn BatchSink> = Arc::new(BatchUploader::from_config(
        &config.object_store,
        &config.writer.key_prefix,
    )?);

    let shutdown = CancellationToken::new();
    let services = Services::start(&config, log, sink, shutdown.clone()).await?;

    info!("Tigerscope started, press Ctrl+C to shutdown");
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Cannot listen for Ctrl+C, shutting down"),
        },
        _ = services.stopped() => {
            error!("A service stopped unexpectedly, shutting down");
        }
    }
    shutdown.cancel();

    let stats = services.wait().await?;
    info!(
        received = stats.received,
        dropped = stats.dropped,
        flushed_batches = stats.flushed_batches,
        flushed_events = stats.flushed_events,
        failed_flushes = stats.failed_flushes,
        "Shutdown complete"
    );
    Ok(())
}

pub fn open_log(config: &LogConfig) -> Result<Arc<dyn EventLog>, RunError> {
    let log: Arc<dyn EventLog> = match config.backend {
        LogBackend::Memory => {
            info!(topic = %config.topic, partitions = config.partitions, "Using in-memory log");
            Arc::new(MemoryLog::new(&config.topic, config.partitions))
        }
        LogBackend::DuckDb => {
            info!(path = %config.path.display(), topic = %config.topic, "Opening log");
            Arc::new(DuckDbLog::open(&config.path, &config.topic, config.partitions)?)
        }
    };
    Ok(log)
}

/// Identifies this process in the metadata of every object it writes.
pub fn writer_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

/// The gateway and the writer, running over one shared log until `shutdown`.
pub struct Services {
    gateway_addr: Option<SocketAddr>,
    /// Cancelled as soon as either half's task ends, for any reason.
    stopped: CancellationToken,
    gateway: Option<JoinHandle<Result<(), std::io::Error>>>,
    writers: Option<JoinHandle<Result<WriterStats, ConsumerError>>>,
}

impl Services {
    pub async fn start(
        config: &Config,
        log: Arc<dyn EventLog>,
        sink: Arc<dyn BatchSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, RunError> {
        let topic = config.log.topic.clone();
        let stopped = CancellationToken::new();

        let (gateway_addr, gateway) = if config.gateway.enabled {
            let listener = TcpListener::bind(&config.gateway.listen)
                .await
                .map_err(|source| RunError::Bind {
                    addr: config.gateway.listen.clone(),
                    source,
                })?;
            let addr = listener.local_addr().map_err(RunError::Gateway)?;

            let publisher = Publisher::new(
                log.clone(),
                topic.clone(),
                config.gateway.publish.retry_policy(),
            );
            let state = Arc::new(GatewayState {
                validator: Validator::new(config.gateway.environment.clone()),
                publisher: Arc::new(publisher),
                request_timeout: config.gateway.request_timeout,
            });
            let shutdown = shutdown.clone();
            let on_exit = stopped.clone().drop_guard();
            let handle = tokio::spawn(async move {
                let _on_exit = on_exit;
                serve(listener, state, shutdown).await
            });
            (Some(addr), Some(handle))
        } else {
            info!("Gateway disabled");
            (None, None)
        };

        let writers = if config.writer.enabled {
            let encoder = BatchEncoder::new(config.writer.compression, writer_id());
            let writer_config = config.writer.clone();
            let shutdown = shutdown.clone();
            let on_exit = stopped.clone().drop_guard();
            Some(tokio::spawn(async move {
                let _on_exit = on_exit;
                run_writers(log, &topic, &writer_config, encoder, sink, shutdown).await
            }))
        } else {
            info!("Writer disabled");
            None
        };

        Ok(Self {
            gateway_addr,
            stopped,
            gateway,
            writers,
        })
    }

    /// Bound gateway address, useful when `listen` asked for port 0.
    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway_addr
    }

    /// Resolves once the gateway or the writers have stopped, whether they
    /// finished, failed or panicked.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Wait for both halves to stop. Call after cancelling the shutdown token.
    ///
    /// The writers are always awaited, so their final flush runs even when the
    /// gateway has failed. A gateway failure is reported first.
    pub async fn wait(self) -> Result<WriterStats, RunError> {
        let gateway = match self.gateway {
            Some(gateway) => match gateway.await {
                Ok(result) => result.map_err(RunError::Gateway),
                Err(e) => Err(RunError::Join(e)),
            },
            None => Ok(()),
        };
        let writers = match self.writers {
            Some(writers) => match writers.await {
                Ok(result) => result.map_err(RunError::Consumer),
                Err(e) => Err(RunError::Join(e)),
            },
            None => Ok(WriterStats::default()),
        };
        gateway?;
        writers
    }
}
