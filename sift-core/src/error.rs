use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiftError {
    /// The coordination store could not be reached or rejected a command.
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// A lifecycle call was made from a state that does not allow it.
    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    /// The ledger is planned for a different filter than the one requested.
    /// Offsets from one scope never index into another scope's candidates.
    #[error("Ledger planned for scope {planned}, request has scope {requested}")]
    ScopeMismatch { planned: String, requested: String },

    /// A record in the store could not be decoded.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    #[error("Candidate resolution failed: {0}")]
    Candidates(String),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SiftError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SiftError::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(
        subject: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        SiftError::InvalidTransition {
            subject: subject.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Store failures must reach the caller; everything else is the caller's
    /// to classify.
    pub fn is_store(&self) -> bool {
        matches!(self, SiftError::Store(_))
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for SiftError {
    fn from(err: redis::RedisError) -> Self {
        SiftError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SiftError>;
