//! Error types for the task queue

use thiserror::Error;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the broker, client, and server
#[derive(Error, Debug)]
pub enum Error {
    /// A task with the same id is already present in the queue
    #[error("task id already exists: {id}")]
    TaskIdConflict { id: String },

    /// Another task holding the same unique key is still in flight
    #[error("task with the same unique key is already enqueued")]
    DuplicateUnique,

    /// The targeted task does not exist
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Administrative operation targeted an unknown queue
    #[error("queue not found: {queue}")]
    QueueNotFound { queue: String },

    /// Administrative operation requires the queue to be empty
    #[error("queue is not empty: {queue}")]
    QueueNotEmpty { queue: String },

    /// Settle attempted for a task whose lease is no longer owned;
    /// the recoverer takes over from here
    #[error("lease expired for task: {id}")]
    LeaseExpired { id: String },

    /// Redis connection or command errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Task message encode/decode errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid caller-supplied input
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The server is shutting down and no longer accepts work
    #[error("server is shutting down")]
    Shutdown,
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether the operation may succeed on retry (routed to the syncer)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Redis(err) => !err.is_unrecoverable_error(),
            Error::TaskIdConflict { .. } => false,
            Error::DuplicateUnique => false,
            Error::TaskNotFound { .. } => false,
            Error::QueueNotFound { .. } => false,
            Error::QueueNotEmpty { .. } => false,
            Error::LeaseExpired { .. } => false,
            Error::Serialization(_) => false,
            Error::InvalidArgument { .. } => false,
            Error::Shutdown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_errors_are_permanent() {
        let err = Error::from(serde_json::from_str::<String>("{").unwrap_err());
        assert!(!err.is_transient());
    }

    #[test]
    fn conflict_errors_are_permanent() {
        assert!(!Error::TaskIdConflict { id: "a".into() }.is_transient());
        assert!(!Error::DuplicateUnique.is_transient());
        assert!(!Error::LeaseExpired { id: "a".into() }.is_transient());
    }
}
