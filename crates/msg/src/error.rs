use thiserror::Error;

/// Boxed error used at trait seams where callers supply their own error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while building, routing or transporting messages.
#[derive(Debug, Error)]
pub enum MsgError {
    /// A routing header required by the receiver is absent.
    #[error("Missing required header: {0}")]
    MissingHeader(String),

    /// A message was published without a destination channel.
    #[error("Message has no destination channel")]
    DestinationMissing,

    /// No type is registered under the given name.
    #[error("Type not registered: {0}")]
    UnregisteredType(String),

    /// A payload was decoded under a name that belongs to another type.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The producer or consumer failed.
    #[error("Transport error: {0}")]
    Transport(BoxError),

    /// Beginning, committing or rolling back a transaction failed.
    #[error("Transaction error: {0}")]
    Transaction(BoxError),

    /// A message handler returned an error.
    #[error("Handler error: {0}")]
    Handler(BoxError),

    /// Middleware was registered after receivers were subscribed.
    #[error("Middleware must be registered before any subscription is made")]
    MiddlewareAfterSubscribe,
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MsgError>;
