use std::fmt::{Debug, Display};

use thiserror::Error;

/// Per-key failure reported by a [`BatchFunction`](crate::BatchFunction) whose batch otherwise
/// executed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The backend holds no value for the key.
    #[error("not found")]
    NotFound,

    /// The key could not be resolved for some other reason (invalid, rejected, ...).
    #[error("{0}")]
    Other(String),
}

/// Batch-level failure: the fetch could not run at all, so none of its keys resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FetchError {
    message: String,
}

impl FetchError {
    pub fn new(message: impl Display) -> Self {
        Self { message: message.to_string() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error observed by a caller of [`Loader::load`](crate::Loader::load).
///
/// Only `KeyNotFound` is ever cached by a loader; every other variant is delivered to the
/// requesters of the affected batch and then forgotten, so a later load retries the fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("no value for key {key}")]
    KeyNotFound { key: String },

    #[error("loading key {key} failed: {message}")]
    KeyFailed { key: String, message: String },

    #[error("batch fetch failed: {0}")]
    BatchFetchFailure(FetchError),

    /// The owning unit of work ended before the request resolved.
    #[error("loader was cancelled before the request resolved")]
    Cancelled,

    #[error("no loader registered for {0}")]
    Unregistered(&'static str),
}

impl LoadError {
    pub(crate) fn not_found<K: Debug>(key: &K) -> Self {
        LoadError::KeyNotFound { key: format!("{:?}", key) }
    }

    pub(crate) fn from_key_error<K: Debug>(key: &K, error: KeyError) -> Self {
        match error {
            KeyError::NotFound => LoadError::not_found(key),
            KeyError::Other(message) => LoadError::KeyFailed { key: format!("{:?}", key), message },
        }
    }

    /// Whether this outcome may be kept in a loader cache for the rest of the unit of work.
    pub(crate) fn is_cacheable(&self) -> bool {
        matches!(self, LoadError::KeyNotFound { .. })
    }
}
