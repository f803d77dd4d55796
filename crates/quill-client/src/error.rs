//! Error types.

use thiserror::Error;

/// Result type for client operations.
pub type QuillResult<T> = Result<T, QuillError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum QuillError {
    /// The server script rejected the operation. The script uses a single
    /// error channel for every client-visible violation, so the message is
    /// the only discriminator.
    #[error("Domain error: {0}")]
    Domain(String),

    /// A heartbeat or completion was refused because the job is no longer
    /// owned by this worker.
    #[error("Lost lock on job {jid}")]
    LostLock { jid: String },

    /// Connection-level failure talking to the server.
    #[error("Redis error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Failed to check a connection out of the pool.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The server returned a payload we could not decode.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `Events::on` was given an event name outside the published set.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Invalid client or worker configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker runtime error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Filesystem error (sandbox management).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuillError {
    /// Returns true for connection-level failures that worker loops must
    /// propagate rather than swallow.
    pub fn is_transport(&self) -> bool {
        matches!(self, QuillError::Transport(_) | QuillError::Pool(_))
    }
}

/// An error produced by a user job processor.
///
/// Never propagates out of `Job::process`: it is converted into a `fail`
/// invocation with group `<queue>-<kind>`.
#[derive(Debug, Clone)]
pub struct ProcessingError {
    /// Categorical mode of failure, used to group similar errors.
    pub kind: String,
    /// Job-specific detail, e.g. an error chain rendering.
    pub message: String,
}

impl ProcessingError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProcessingError {}

impl From<String> for ProcessingError {
    fn from(message: String) -> Self {
        Self::new("Error", message)
    }
}

impl From<&str> for ProcessingError {
    fn from(message: &str) -> Self {
        Self::new("Error", message)
    }
}
