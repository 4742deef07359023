use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Field '{field}' of type '{type_name}' has no duplication policy")]
    MissingFieldPolicy { type_name: String, field: String },

    #[error("Type '{0}' is not registered")]
    UnknownType(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Store initialization failed: {0}")]
    StoreInit(String),

    #[error("Store is closed")]
    StoreClosed,

    #[error("Reference from '{from}' to '{target}' could not be resolved: {reason}")]
    ReferenceResolution {
        from: String,
        target: String,
        reason: String,
    },

    #[error("Action '{key}' failed: {message}")]
    ActionDispatch { key: String, message: String },

    #[error("Object '{id}' is still referenced by {referrers:?}")]
    StillReferenced { id: String, referrers: Vec<String> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl<T> From<std::sync::PoisonError<T>> for GraphError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Wraps an I/O failure with the operation that produced it.
pub fn io_error(context: &str, err: std::io::Error) -> GraphError {
    GraphError::Io(format!("{}: {}", context, err))
}

/// Wraps a serializer failure with the operation that produced it.
pub fn serde_error(context: &str, err: impl std::fmt::Display) -> GraphError {
    GraphError::Serialization(format!("{}: {}", context, err))
}
