//! # Error Handling
//!
//! Error taxonomy for the coordination layer.
//!
//! - **StorageError**: failures reported by a [`CoordinationStorage`](crate::storage::CoordinationStorage) backend
//! - **ClientError**: failures reported by the local topology runtime
//! - **CoordinationError**: everything the leader and coordinator surface to callers
//!
//! Periodic loops never abort on these errors. They log them and try again on
//! the next cycle; only public one-shot operations hand them back to the caller.

/// Errors reported by a coordination storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// No worker record exists under this name.
  #[error("Worker not found: {0}")]
  WorkerNotFound(String),

  /// No topology record exists under this uuid.
  #[error("Topology not found: {0}")]
  TopologyNotFound(String),

  /// Backend-specific failure (connection, timeout, conflict, ...).
  #[error("Storage backend error: {0}")]
  Backend(String),

  /// Record or payload could not be (de)serialized.
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl StorageError {
  /// Returns true if the error means the requested record does not exist.
  #[must_use]
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      StorageError::WorkerNotFound(_) | StorageError::TopologyNotFound(_)
    )
  }
}

/// Errors reported by the local topology runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  /// Operation on a specific topology failed.
  #[error("Topology {uuid} failed: {reason}")]
  Topology {
    /// Topology the operation targeted.
    uuid: String,
    /// Failure description.
    reason: String,
  },

  /// Other runtime error.
  #[error("Runtime error: {0}")]
  Other(String),
}

/// Errors surfaced by the leader and the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
  /// Storage call failed.
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),

  /// Local runtime call failed.
  #[error("Client error: {0}")]
  Client(#[from] ClientError),

  /// Mailbox message carried a payload that does not match its command.
  #[error("Invalid message '{cmd}': {reason}")]
  InvalidMessage {
    /// Command name found in the message.
    cmd: String,
    /// Why the payload was rejected.
    reason: String,
  },

  /// Configuration rejected by validation or parsing.
  #[error("Invalid configuration: {0}")]
  Config(String),
}

/// Result alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;
