use std::env;
use std::time::Duration;

use crate::broker::{ConsumerDefinition, DEFAULT_FILTER_SUBJECT};
use crate::sync_worker::{
    ApplyFailurePolicy, WorkerOptions, DEFAULT_MAX_PULL_FAILURES, DEFAULT_PULL_BACKOFF,
};

pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_STREAM_NAME: &str = "keycloak-admin-event-stream";
pub const DEFAULT_CONSUMER_NAME: &str = "user-service-consumer";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Worker configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub nats_url: String,
    pub stream_name: String,
    pub consumer_name: String,
    pub filter_subject: String,
    /// Optional resource type token narrowing the filter subject.
    pub resource_scope: Option<String>,
    pub database_url: String,
    pub database_pool_size: usize,
    pub run_migrations: bool,
    pub failure_policy: ApplyFailurePolicy,
    pub max_pull_failures: u32,
    pub pull_backoff: Duration,
    pub log_level: tracing::Level,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let text = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let database_url =
            var("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let database_pool_size = parse_number(&var, "DATABASE_POOL_SIZE", 8)?;

        let run_migrations = match var("SYNC_RUN_MIGRATIONS").as_deref() {
            None => true,
            Some(value) => parse_bool("SYNC_RUN_MIGRATIONS", value)?,
        };

        let failure_policy = match var("SYNC_APPLY_FAILURE_POLICY").as_deref() {
            None | Some("ack") => ApplyFailurePolicy::AckAfterAttempt,
            Some("redeliver") => ApplyFailurePolicy::Redeliver {
                max_deliveries: parse_number(&var, "SYNC_MAX_DELIVERIES", 5)?,
                delay: Duration::from_secs(parse_number(&var, "SYNC_REDELIVERY_DELAY_SECS", 5)?),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "SYNC_APPLY_FAILURE_POLICY".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let max_pull_failures =
            parse_number(&var, "SYNC_MAX_PULL_FAILURES", DEFAULT_MAX_PULL_FAILURES)?;
        let pull_backoff = Duration::from_millis(parse_number(
            &var,
            "SYNC_PULL_BACKOFF_MS",
            DEFAULT_PULL_BACKOFF.as_millis() as u64,
        )?);

        let log_level = match var("SYNC_LOG_LEVEL") {
            None => tracing::Level::INFO,
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                var: "SYNC_LOG_LEVEL".to_string(),
                value,
            })?,
        };

        Ok(Self {
            nats_url: text("NATS_URL", DEFAULT_NATS_URL),
            stream_name: text("SYNC_STREAM_NAME", DEFAULT_STREAM_NAME),
            consumer_name: text("SYNC_CONSUMER_NAME", DEFAULT_CONSUMER_NAME),
            filter_subject: text("SYNC_FILTER_SUBJECT", DEFAULT_FILTER_SUBJECT),
            resource_scope: var("SYNC_RESOURCE_SCOPE"),
            database_url,
            database_pool_size,
            run_migrations,
            failure_policy,
            max_pull_failures,
            pull_backoff,
            log_level,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.nats_url.contains("://") {
            return Err(ConfigError::InvalidValue {
                var: "NATS_URL".to_string(),
                value: self.nats_url.clone(),
            });
        }

        if self.database_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DATABASE_POOL_SIZE".to_string(),
                value: "0".to_string(),
            });
        }

        if self.max_pull_failures == 0 {
            return Err(ConfigError::InvalidValue {
                var: "SYNC_MAX_PULL_FAILURES".to_string(),
                value: "0".to_string(),
            });
        }

        if let ApplyFailurePolicy::Redeliver { max_deliveries, .. } = self.failure_policy {
            if max_deliveries == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "SYNC_MAX_DELIVERIES".to_string(),
                    value: "0".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn consumer_definition(&self) -> ConsumerDefinition {
        let definition = ConsumerDefinition::new(
            self.stream_name.clone(),
            self.consumer_name.clone(),
            self.filter_subject.clone(),
        );

        match &self.resource_scope {
            Some(scope) => definition.scoped_to_resource(scope),
            None => definition,
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            failure_policy: self.failure_policy,
            max_pull_failures: self.max_pull_failures,
            pull_backoff: self.pull_backoff,
        }
    }

    /// Human-readable configuration summary (no secrets)
    pub fn summary(&self) -> String {
        let policy = match self.failure_policy {
            ApplyFailurePolicy::AckAfterAttempt => "ack after attempt".to_string(),
            ApplyFailurePolicy::Redeliver {
                max_deliveries,
                delay,
            } => format!(
                "redeliver (max {} deliveries, {}s delay)",
                max_deliveries,
                delay.as_secs()
            ),
        };

        format!(
            "Identity Sync Configuration:\n\
             - NATS: {}\n\
             - Stream: {}\n\
             - Consumer: {}\n\
             - Filter: {}\n\
             - Database pool: {}\n\
             - Migrations: {}\n\
             - Apply failures: {}\n\
             - Pull failures: give up after {} ({}ms initial backoff)\n\
             - Log level: {}",
            self.nats_url,
            self.stream_name,
            self.consumer_name,
            self.consumer_definition().filter_subject,
            self.database_pool_size,
            if self.run_migrations { "enabled" } else { "disabled" },
            policy,
            self.max_pull_failures,
            self.pull_backoff.as_millis(),
            self.log_level,
        )
    }
}

fn parse_number<T, V>(var: &V, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: name.to_string(),
            value,
        }),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: name.to_string(),
            value: value.to_string(),
        }),
    }
}
