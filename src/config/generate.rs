pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# TIGERSCOPE CONFIGURATION
# =============================================================================
# Tigerscope accepts telemetry events over HTTP, appends them to a partitioned
# log keyed by customer, and writes them out as Parquet batches in object
# storage.
#
# One binary runs both halves. Disable either with `enabled: false`:
#
#   gateway:   HTTP ingestion (validate, normalise, publish to the log)
#   writer:    log consumer (accumulate, encode, upload, commit)
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/tigerscope/config.yml
#   3. /etc/tigerscope/config.yml
#
# Any value may reference an environment variable as $env{NAME}.

# =============================================================================
# LOG
# =============================================================================
# The durable, partitioned log between the gateway and the writer. Events with
# the same customer_id always land on the same partition.

log:
  # 'duckdb' (persistent, offsets survive restarts) or 'memory' (testing only)
  backend: duckdb
  path: ~/.local/share/tigerscope/log.duckdb
  topic: telemetry.events
  partitions: 6

# =============================================================================
# GATEWAY
# =============================================================================

gateway:
  enabled: true
  listen: 0.0.0.0:8080
  # Stamped on every accepted event
  environment: local
  # Time allowed for the log to acknowledge an event before the client gets 504.
  # The event may still be published after a timeout.
  request_timeout: 3s
  publish:
    # Retries for transient log failures, with exponential backoff
    max_retries: 5
    initial_backoff: 100ms
    max_backoff: 2s

# =============================================================================
# WRITER
# =============================================================================

writer:
  enabled: true
  # Consumer group; committed offsets are stored per group and partition
  group: tigerscope-writer
  # Claim only these partitions (default: all of them)
  # partitions: [0, 1, 2]
  # A batch is flushed when it holds this many events...
  flush_max_events: 500
  # ...or when this much time has passed since the last flush
  flush_interval: 5s
  # 'on_append': commit as soon as an event is buffered (a crash loses the
  #              buffered batch)
  # 'after_upload': commit once the batch is uploaded (a crash replays it)
  commit: on_append
  # Upper bound on the final flush at shutdown
  shutdown_grace: 10s
  # Objects are written under <key_prefix>/parquet/date=YYYY-MM-DD/hour=HH/
  key_prefix: telemetry
  # 'snappy', 'zstd' or 'none'
  compression: snappy

# =============================================================================
# OBJECT STORE
# =============================================================================

object_store:
  # 'memory' (testing only), 'local' or 's3'
  backend: local
  path: ~/.local/share/tigerscope/lake

  # S3 or MinIO:
  # backend: s3
  # bucket: telemetry
  # region: us-east-1
  # endpoint: http://localhost:9000
  # access_key_id: $env{AWS_ACCESS_KEY_ID}
  # secret_access_key: $env{AWS_SECRET_ACCESS_KEY}
  # allow_http: true
"#
    .to_string()
}
