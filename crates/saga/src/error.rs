//! Saga error types.

use common::SagaId;
use msg::{BoxError, MsgError};
use thiserror::Error;

/// Errors that can occur while defining, running or storing sagas.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The instance points at a step the definition does not have.
    #[error("Current step is out of bounds: expected 0..{steps}, got {step}")]
    StepOutOfBounds { step: i32, steps: usize },

    /// A failure reply arrived while the saga was already compensating.
    #[error("Received a failure outcome while compensating step {step}")]
    DoubleFailure { step: i32 },

    /// No instance exists for the saga name and id.
    #[error("Saga instance not found: {saga_name}/{saga_id}")]
    InstanceNotFound { saga_name: String, saga_id: SagaId },

    /// An instance with the same saga name and id was already saved.
    #[error("Saga instance already exists: {saga_name}/{saga_id}")]
    DuplicateInstance { saga_name: String, saga_id: SagaId },

    /// A step reply handler rejected the reply.
    #[error("Reply handler error: {0}")]
    ReplyHandler(BoxError),

    /// A saga definition failed validation.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// Store configuration failed validation.
    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Messaging or serialization error.
    #[error("Message error: {0}")]
    Message(#[from] MsgError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

impl From<SagaError> for MsgError {
    fn from(e: SagaError) -> Self {
        match e {
            SagaError::Message(e) => e,
            other => MsgError::Handler(Box::new(other)),
        }
    }
}
