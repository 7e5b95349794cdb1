//! Error types shared across the turn pipeline

use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised while processing a turn.
///
/// Lower layers (storage, state, memory) only ever propagate these; the
/// adapter's turn error handler is the one place that turns an error into a
/// user-visible recovery action.
#[derive(Debug, Error)]
pub enum Error {
    /// The inbound activity is missing a correlation id needed by the turn
    #[error("invalid activity: {0}")]
    InvalidActivity(String),

    /// A dialog id was referenced that no reachable `DialogSet` knows about
    #[error("dialog not found: {0}")]
    DialogNotFound(String),

    /// Storage failure, including ETag conflicts
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A dialog step (user code) failed
    #[error("dialog '{dialog_id}' failed: {message}")]
    Step { dialog_id: String, message: String },

    /// A memory path expression could not be parsed or written
    #[error("invalid memory path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// An operation was attempted in a state that does not allow it
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The turn's cancellation token fired
    #[error("turn cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn step(dialog_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            dialog_id: dialog_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the underlying failure is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Conflict { .. }))
    }
}
