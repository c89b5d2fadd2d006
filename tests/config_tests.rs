use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tigerscope::config::generate::generate_starter_config;
use tigerscope::config::{load_config, ConfigError, LogBackend, ObjectStoreBackend};
use tigerscope::writer::{BatchCompression, CommitPolicy};

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, generate_starter_config()).unwrap();

    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.log.backend, LogBackend::DuckDb);
    assert_eq!(config.log.topic, "telemetry.events");
    assert_eq!(config.log.partitions, 6);
    assert_eq!(config.gateway.listen, "0.0.0.0:8080");
    assert_eq!(config.gateway.request_timeout, Duration::from_secs(3));
    assert_eq!(config.gateway.publish.max_backoff, Duration::from_secs(2));
    assert_eq!(config.writer.flush_max_events, 500);
    assert_eq!(config.writer.flush_interval, Duration::from_secs(5));
    assert_eq!(config.writer.commit, CommitPolicy::OnAppend);
    assert_eq!(config.writer.compression, BatchCompression::Snappy);
    assert_eq!(config.writer.key_prefix, "telemetry");
    assert_eq!(config.object_store.backend, ObjectStoreBackend::Local);
    assert!(config.writer.partitions.is_none());
}

#[test]
fn test_minio_style_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    std::env::set_var("TIGERSCOPE_IT_SECRET", "minio-secret");
    fs::write(
        &config_path,
        r#"
log:
  backend: duckdb
  path: /tmp/tigerscope-it/log.duckdb
writer:
  commit: after_upload
  compression: zstd
  partitions: [1, 2]
object_store:
  backend: s3
  bucket: telemetry
  endpoint: http://localhost:9000
  region: us-east-1
  access_key_id: minio
  secret_access_key: $env{TIGERSCOPE_IT_SECRET}
  allow_http: true
"#,
    )
    .unwrap();

    let config = load_config(&config_path).unwrap();
    std::env::remove_var("TIGERSCOPE_IT_SECRET");

    assert_eq!(config.object_store.secret_access_key.as_deref(), Some("minio-secret"));
    assert_eq!(config.object_store.endpoint.as_deref(), Some("http://localhost:9000"));
    assert_eq!(config.writer.partitions, Some(vec![1, 2]));
    assert_eq!(config.writer.commit, CommitPolicy::AfterUpload);
}

#[test]
fn test_invalid_config_reports_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(
        &config_path,
        "log:\n  partitions: 0\n  topic: ''\nwriter:\n  flush_interval: 0s\n",
    )
    .unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert!(errors.iter().any(|e| e.contains("log.partitions")));
            assert!(errors.iter().any(|e| e.contains("log.topic")));
            assert!(errors.iter().any(|e| e.contains("writer.flush_interval")));
        }
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}
