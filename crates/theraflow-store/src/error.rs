//! Error types for the store.

use std::fmt;

use thiserror::Error;

use crate::types::Collection;

/// Errors reported by a remote store adapter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the operation (permissions, validation, quota).
    #[error("remote store rejected {operation} on {collection}: {message}")]
    Rejected {
        collection: Collection,
        operation: &'static str,
        message: String,
    },

    /// Document not found.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: Collection, id: String },

    /// A document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// The step of the cascade delete protocol that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStep {
    /// Deleting the patient document.
    DeletePatient,
    /// Looking up the patient's sessions.
    QuerySessions,
    /// Batch-deleting the patient's sessions.
    DeleteSessions,
}

impl fmt::Display for CascadeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeStep::DeletePatient => write!(f, "delete patient"),
            CascadeStep::QuerySessions => write!(f, "query sessions"),
            CascadeStep::DeleteSessions => write!(f, "delete sessions"),
        }
    }
}

/// Errors that can occur in cache and context operations.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// A mutation was requested while no identity is bound.
    #[error("no identity is signed in")]
    SignedOut,

    /// A required identifier was empty.
    #[error("missing identifier: {0}")]
    MissingId(&'static str),

    /// Remote store error.
    #[error("remote store error: {0}")]
    Store(#[from] StoreError),

    /// Patient cascade delete failed part way through.
    #[error("cascade delete of patient {patient_id} failed at {step}: {source}")]
    Cascade {
        patient_id: String,
        step: CascadeStep,
        #[source]
        source: StoreError,
    },

    /// The context was constructed outside a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    /// A background remote operation panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}
