use thiserror::Error;

use crate::domain::DocumentLink;

/// Library-wide error type.
///
/// Design:
/// - `Validation` is rejected synchronously at creation; no task document is
///   ever persisted for it.
/// - `Gone` and `NotFound` are what late patches against expired or reaped
///   documents see; callers treat them as no-ops.
/// - `VersionConflict` is internal to the optimistic-update loop and is
///   retried by re-reading the document.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("document not found: {0}")]
    NotFound(DocumentLink),

    #[error("document gone or expired: {0}")]
    Gone(DocumentLink),

    #[error("document already exists: {0}")]
    AlreadyExists(DocumentLink),

    #[error("version conflict on {link}: expected {expected}, actual {actual}")]
    VersionConflict {
        link: DocumentLink,
        expected: u64,
        actual: u64,
    },

    #[error("no service registered for link {0}")]
    NoService(String),

    #[error("no resource adapter configured")]
    NoAdapter,

    #[error("adapter request failed: {0}")]
    Adapter(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether a caller should treat this error as a benign no-op
    /// (late delivery against a document that no longer exists).
    pub fn is_benign(&self) -> bool {
        matches!(self, EngineError::Gone(_) | EngineError::NotFound(_))
    }
}
