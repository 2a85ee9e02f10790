//! Service error types.

use msg::MsgError;
use saga::SagaError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can stop the service from starting or running.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid log filter: {0}")]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to install tracing subscriber: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Messaging error: {0}")]
    Message(#[from] MsgError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for service results.
pub type Result<T> = std::result::Result<T, ServiceError>;
