use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::replica_storage::StorageError;

/// Process-level errors for the identity sync worker.
///
/// Per-message failures (decode, resolution, apply) never surface here; the
/// consumer loop logs and settles them. Everything in this enum stops the
/// process.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            SyncError::Config(_) => "config_invalid",
            SyncError::Broker(BrokerError::ConnectionFailed { .. }) => "broker_unreachable",
            SyncError::Broker(BrokerError::StreamUnavailable { .. }) => "stream_unavailable",
            SyncError::Broker(BrokerError::ConsumerDeclarationFailed { .. }) => {
                "consumer_declaration_failed"
            }
            SyncError::Broker(_) => "broker_error",
            SyncError::Storage(StorageError::ConnectionError(_)) => "database_unreachable",
            SyncError::Storage(StorageError::ConfigurationError(_)) => "database_misconfigured",
            SyncError::Storage(_) => "storage_error",
            SyncError::Worker(_) => "worker_failed",
        }
    }

    /// Exit status for the worker binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => 78,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SyncError::from(BrokerError::ConnectionFailed {
            url: "nats://localhost:4222".to_string(),
            cause: "refused".to_string(),
        });
        assert_eq!(err.error_code(), "broker_unreachable");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(
            err.to_string(),
            "Broker error: Connection to broker nats://localhost:4222 failed: refused"
        );

        let err = SyncError::from(ConfigError::MissingVar("DATABASE_URL".to_string()));
        assert_eq!(err.error_code(), "config_invalid");
        assert_eq!(err.exit_code(), 78);
    }

    #[test]
    fn test_storage_errors_convert() {
        let err: SyncError = StorageError::ConnectionError("down".to_string()).into();
        assert_eq!(err.error_code(), "database_unreachable");
    }
}
