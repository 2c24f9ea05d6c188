use thiserror::Error;

pub type Result<T> = core::result::Result<T, InAppError>;

/// Errors returned by collaborators supplied by the host (fetcher, reporter, ...).
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum InAppError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Sync failed: {0}")]
    SyncFailure(String),

    #[error("Display rejected: {0}")]
    DisplayRejected(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Displayer can only be invoked from the UI lane")]
    NotOnUiLane,

    #[error("Engine lane is no longer running: {0}")]
    LaneClosed(&'static str),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A single payload entry that could not be normalized into a message.
///
/// `message_id` is set whenever the entry carried an id, so the caller can
/// report it as consumed and stop the server from sending it again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to parse in-app message ({}): {reason}", .message_id.as_deref().unwrap_or("no id"))]
pub struct ParseError {
    pub reason: String,
    pub message_id: Option<String>,
}

impl ParseError {
    pub(crate) fn new(reason: impl Into<String>, message_id: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            message_id,
        }
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database is corrupt: {0}")]
    Corrupt(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
