use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying key/value engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or refused the operation.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What the store was doing.
        message: String,
        /// Backend failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A stored blob could not be encoded or decoded with the expected schema.
    #[error("malformed value stored at `{key}`: {reason}")]
    Serialization {
        /// Key holding the value.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a serialization fault for the value stored under `key`.
    pub fn serialization(key: impl Into<String>, reason: impl ToString) -> Self {
        StorageError::Serialization {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
