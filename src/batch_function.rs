use async_trait::async_trait;

use crate::error::{FetchError, KeyError};

/// What a [`BatchFunction`] hands back for one batch: a per-key outcome for the keys it
/// could reach, or a single batch-level failure covering every key.
pub type BatchResult<K, V> = Result<Vec<(K, Result<V, KeyError>)>, FetchError>;

/// A `BatchFunction` defines the method through which some `Loader` may fetch
/// batched data from some resource. The `BatchFunction` receives a slice of keys
/// that have been requested during one accumulation window of the `Loader`, and some user
/// defined context struct. Several calls may be in flight at once.
///
/// Keys arrive deduplicated and in the order they were first requested. Results are matched back
/// to requesters by key, so the function may return its pairs in any order. A key for which no
/// pair is returned is reported to its requesters as not found.
///
/// Two failure shapes are distinguished:
///
/// * per key, through [`KeyError`]; only the requesters of that key observe it.
/// * per batch, through [`FetchError`]; every requester of every key in the batch observes it.
///
/// The function is invoked at most once per dispatched batch and never retried by the loader.
///
/// Multiple `BatchFunctions` (and therefore loaders) can share the same context (likely through an
/// `Arc`).
#[async_trait]
pub trait BatchFunction {
    type Key;
    type Value;
    type Context;

    async fn load(keys: &[Self::Key], context: &Self::Context)
        -> BatchResult<Self::Key, Self::Value>;
}
