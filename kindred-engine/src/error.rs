//! Error types for kindred-engine
//!
//! Every variant except `Storage` and `Common` is an expected, recoverable
//! outcome the caller must handle (e.g. "this match is no longer available").
//! Storage faults propagate unmodified; retry policy belongs to the caller.
//! An exhausted daily queue is an empty `Vec`, never an error.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Acting on a MatchCandidate, request or Connection no longer in the expected state
    #[error("Stale state: {0}")]
    StaleState(String),

    /// Sender, reader or actor is not a participant
    #[error("User {user_id} is not a participant of {context}")]
    NotAParticipant { user_id: Uuid, context: String },

    /// Any interaction attempted on a blocked pair
    #[error("Connection {0} is blocked")]
    ConnectionBlocked(Uuid),

    /// Unknown id referenced
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Underlying store failure (infrastructure fault)
    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    /// Shared-layer failure (config, serialization, I/O)
    #[error(transparent)]
    Common(kindred_common::Error),
}

impl Error {
    /// Whether this is an expected domain outcome rather than an infrastructure fault
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Storage(_) | Error::Common(_))
    }

    pub(crate) fn not_a_participant(user_id: Uuid, context: impl Into<String>) -> Self {
        Error::NotAParticipant {
            user_id,
            context: context.into(),
        }
    }
}

impl From<kindred_common::Error> for Error {
    fn from(err: kindred_common::Error) -> Self {
        match err {
            kindred_common::Error::Database(e) => Error::Storage(e),
            kindred_common::Error::InvalidInput(what) => Error::InvalidInput(what),
            other => Error::Common(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Common(kindred_common::Error::Serialization(err))
    }
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
