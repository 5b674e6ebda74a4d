//! Error types for the SMS relay.

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the forwarding backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

/// Errors raised by job handlers.
///
/// The runner uses [`JobError::is_fatal`] to decide between requeueing the
/// job with backoff and marking it permanently failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Payload could not be deserialized. Retrying cannot help.
    #[error("Malformed job payload: {0}")]
    MalformedPayload(String),

    /// No handler is registered for this job kind. Retrying cannot help.
    #[error("No handler registered for job kind {0}")]
    UnknownKind(String),

    /// A precondition for running the job is not met yet (missing record,
    /// missing settings). Expected to succeed on a later attempt once the
    /// environment changes.
    #[error("Precondition not met: {0}")]
    Precondition(String),

    /// Storage failure while running the job.
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

impl JobError {
    /// Fatal errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedPayload(_) | Self::UnknownKind(_))
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
