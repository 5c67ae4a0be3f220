use std::time::Duration;

use thiserror::Error;

use crate::model::Collection;

/// Result type alias for sync core operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur inside the sync core.
///
/// Most variants are anticipated failures that the core recovers from locally
/// (see [`SyncError::is_recoverable`]). The rest are reserved for genuinely
/// unexpected conditions and are the only ones a mutation reports as a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// The daily request budget is spent
  #[error("Daily request quota exceeded ({count}/{max})")]
  QuotaExceeded { count: u32, max: u32 },

  /// Offline mode is switched on
  #[error("Offline mode is active")]
  OfflineModeActive,

  /// The remote call did not finish within its bounded wait
  #[error("Remote call timed out after {0:?}")]
  RemoteTimeout(Duration),

  /// The remote collaborator answered with an explicit error
  #[error("Remote rejected the request: {0}")]
  RemoteRejected(String),

  /// The remote collaborator has no current identity
  #[error("Not authenticated against the remote service")]
  NotAuthenticated,

  /// Persisted local data could not be parsed
  #[error("Malformed local data under '{key}': {message}")]
  MalformedLocalData { key: String, message: String },

  /// Rows returned by the remote collaborator did not match the record shape
  #[error("Malformed {collection} data from remote: {message}")]
  MalformedRemoteData {
    collection: Collection,
    message: String,
  },

  /// No owner is active, so nothing can be keyed
  #[error("No active owner")]
  NoActiveOwner,

  /// The record to update or delete is unknown both remotely and locally
  #[error("{collection} record {id} not found")]
  RecordNotFound { collection: Collection, id: String },

  /// Serialization bug while building or applying a payload
  #[error("Serialization error: {0}")]
  Serialization(String),

  /// The durable key-value store failed
  #[error("Storage error: {0}")]
  Storage(String),

  /// Background work was requested with no Tokio runtime to run it on
  #[error("No Tokio runtime available for background work")]
  NoRuntime,
}

impl SyncError {
  /// Whether this failure is part of the anticipated taxonomy and is handled
  /// by falling back to local data.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      Self::QuotaExceeded { .. }
        | Self::OfflineModeActive
        | Self::RemoteTimeout(_)
        | Self::RemoteRejected(_)
        | Self::NotAuthenticated
        | Self::MalformedLocalData { .. }
        | Self::MalformedRemoteData { .. }
    )
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::Serialization(err.to_string())
  }
}
