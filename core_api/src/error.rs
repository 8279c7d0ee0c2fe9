use {crate::crypto::PayloadError, relay_rpc::auth::AuthError};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the client core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Restore will override already set {0}")]
    RestoreWillOverride(String),

    #[error("No matching key. {context}: {key}")]
    NotFound { context: String, key: String },

    #[error("Mismatched topic for record {id}: expected {expected}, received {received}")]
    MismatchedTopic {
        id: u64,
        expected: String,
        received: String,
    },

    #[error("Invalid expirer target: {0}")]
    InvalidTarget(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl Error {
    pub fn not_found(context: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            context: context.into(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
