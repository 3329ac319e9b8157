//! Error types for cache engine operations.

use std::fmt;

/// Errors produced by the cache engine.
///
/// `CacheMiss` is an expected outcome rather than a failure: callers branch on
/// it (see [`Error::is_cache_miss`]) to fall back to the data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Key absent or expired in the cache.
    CacheMiss(String),

    /// A value could not be encoded for storage.
    SerializationError(String),

    /// Stored bytes could not be decoded (malformed or foreign data).
    DeserializationError(String),

    /// Data source load/store failed.
    SourceError(String),

    /// Data source has no value for the key.
    NotFound(String),

    /// Data failed `DataSource::validate` or a validation transformer.
    ValidationError(String),

    /// Batch deletion still failing after every retry.
    RetryExhausted { attempts: u32, message: String },

    /// Cache service unavailable or a command failed.
    BackendError(String),

    /// Operation against a key holding the wrong kind of value.
    WrongType(String),

    /// Invalid configuration.
    ConfigError(String),

    /// A lifecycle hook aborted the hook chain.
    HookError { hook: String, message: String },

    /// A data transformer failed to transform or restore a payload.
    TransformError { transformer: String, message: String },
}

impl Error {
    /// True if this error only signals a missing key.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheMiss(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CacheMiss(key) => write!(f, "Cache miss: {}", key),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::SourceError(msg) => write!(f, "Data source error: {}", msg),
            Error::NotFound(key) => write!(f, "Not found in data source: {}", key),
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::RetryExhausted { attempts, message } => {
                write!(f, "Retries exhausted after {} attempts: {}", attempts, message)
            }
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::WrongType(key) => write!(f, "Wrong value type for key: {}", key),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Error::HookError { hook, message } => write!(f, "Hook '{}' failed: {}", hook, message),
            Error::TransformError {
                transformer,
                message,
            } => write!(f, "Transformer '{}' failed: {}", transformer, message),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
