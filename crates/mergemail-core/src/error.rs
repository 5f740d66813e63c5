use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    /// Missing template or source file; raised before a session starts.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read source file {}: {reason}", .path.display())]
    SourceRead { path: PathBuf, reason: String },

    #[error("no email column found in {}", .0.display())]
    MissingColumn(PathBuf),

    /// Handshake or authentication with the relay failed.
    #[error("relay connection failed: {0}")]
    Connection(String),

    #[error("invalid recipient address: {0}")]
    RecipientInvalid(String),

    #[error("duplicate recipient: {0}")]
    RecipientDuplicate(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("delivery timed out after {0:?}")]
    DeliveryTimeout(Duration),

    #[error("failed to read attachment {}: {reason}", .path.display())]
    AttachmentRead { path: PathBuf, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("status export failed: {0}")]
    Export(String),
}

impl MergeError {
    /// Fatal errors end the run before any row is processed. Everything else
    /// is recorded against a recipient or logged, and the run continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MergeError::Config(_)
                | MergeError::SourceRead { .. }
                | MergeError::MissingColumn(_)
                | MergeError::Connection(_)
        )
    }

    pub fn source_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MergeError::SourceRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn attachment_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MergeError::AttachmentRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<sqlx::Error> for MergeError {
    fn from(err: sqlx::Error) -> Self {
        MergeError::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for MergeError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        MergeError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        MergeError::Persistence(err.to_string())
    }
}
