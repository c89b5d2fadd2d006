use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, env_var_pattern};
use std::collections::HashSet;
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config_str(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;
    Ok(config)
}

/// Parse a config document: env expansion, YAML, tilde expansion, validation.
pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.log.path = expand_tilde(&config.log.path);
    if let Some(path) = config.object_store.path.as_mut() {
        *path = expand_tilde(path);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if !config.gateway.enabled && !config.writer.enabled {
        errors.push("at least one of 'gateway' or 'writer' must be enabled".to_string());
    }

    validate_log(&config.log, &mut errors);
    if config.gateway.enabled {
        validate_gateway(&config.gateway, &mut errors);
    }
    if config.writer.enabled {
        validate_writer(&config.writer, config.log.partitions, &mut errors);
        validate_object_store(&config.object_store, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_log(log: &LogConfig, errors: &mut Vec<String>) {
    if log.topic.trim().is_empty() {
        errors.push("log.topic cannot be empty".to_string());
    }
    if log.partitions == 0 {
        errors.push("log.partitions must be at least 1".to_string());
    }
    if log.backend == LogBackend::DuckDb && log.path.as_os_str().is_empty() {
        errors.push("log.path is required for the duckdb backend".to_string());
    }
}

fn validate_gateway(gateway: &GatewayConfig, errors: &mut Vec<String>) {
    if let Err(e) = gateway.listen.parse::<SocketAddr>() {
        errors.push(format!(
            "gateway.listen: invalid address '{}': {}",
            gateway.listen, e
        ));
    }
    if gateway.environment.trim().is_empty() {
        errors.push("gateway.environment cannot be empty".to_string());
    }
    if gateway.request_timeout.is_zero() {
        errors.push("gateway.request_timeout must be greater than zero".to_string());
    }
    if gateway.publish.initial_backoff > gateway.publish.max_backoff {
        errors.push(
            "gateway.publish.initial_backoff cannot exceed gateway.publish.max_backoff"
                .to_string(),
        );
    }
}

fn validate_writer(writer: &WriterConfig, log_partitions: u32, errors: &mut Vec<String>) {
    if writer.group.trim().is_empty() {
        errors.push("writer.group cannot be empty".to_string());
    }
    if writer.flush_max_events == 0 {
        errors.push("writer.flush_max_events must be at least 1".to_string());
    }
    if writer.flush_interval.is_zero() {
        errors.push("writer.flush_interval must be greater than zero".to_string());
    }

    if let Some(partitions) = &writer.partitions {
        if partitions.is_empty() {
            errors.push("writer.partitions must list at least one partition".to_string());
        }
        let mut seen = HashSet::new();
        for partition in partitions {
            if *partition >= log_partitions {
                errors.push(format!(
                    "writer.partitions: partition {} does not exist (log.partitions is {})",
                    partition, log_partitions
                ));
            } else if !seen.insert(partition) {
                errors.push(format!(
                    "writer.partitions: partition {} listed twice",
                    partition
                ));
            }
        }
    }
}

fn validate_object_store(store: &ObjectStoreConfig, errors: &mut Vec<String>) {
    match store.backend {
        ObjectStoreBackend::Memory => {}
        ObjectStoreBackend::Local => {
            if store.path.is_none() {
                errors.push("object_store.path is required for the local backend".to_string());
            }
        }
        ObjectStoreBackend::S3 => {
            if store.bucket.as_deref().map_or(true, |b| b.trim().is_empty()) {
                errors.push("object_store.bucket is required for the s3 backend".to_string());
            }
            if store.access_key_id.is_some() != store.secret_access_key.is_some() {
                errors.push(
                    "object_store.access_key_id and object_store.secret_access_key must be set together"
                        .to_string(),
                );
            }
        }
    }
}
