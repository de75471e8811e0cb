//! Error taxonomy for database operations
//!
//! Infrastructure failures are reported through [`DatabaseError`]. Conditional write
//! outcomes (`NO_SUCH_TABLE`, `PRECONDITION_VIOLATION`, `ABORTED`) are not errors; they
//! come back as data inside [`crate::WriteResult`].

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseError {
    /// A submit or RPC did not complete within its window. Callers may retry.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Snapshot encode/decode failed. The affected node must be treated as unavailable.
    #[error("snapshot failure: {0}")]
    SnapshotFailure(String),

    /// No leader known or the cluster lacks quorum.
    #[error("consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("{operation} failed due to status: {status}")]
    UnexpectedStatus { operation: String, status: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl DatabaseError {
    pub fn unexpected_status(operation: impl Into<String>, status: impl ToString) -> Self {
        Self::UnexpectedStatus {
            operation: operation.into(),
            status: status.to_string(),
        }
    }

    /// Whether backing off and retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConsensusUnavailable(_) | Self::Messaging(_)
        )
    }

    /// Whether the node that produced this error can no longer serve requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SnapshotFailure(_))
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
