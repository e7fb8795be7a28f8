use std::slice;

use tokio::sync::oneshot;

use crate::error::LoadError;
use crate::worker_stats::WorkerStats;

/// Set of possible requests that can be sent to the
/// [`LoaderWorker`](crate::loader_worker::LoaderWorker)
///
/// Load and Prime each have a single and many variant for convenience. Flush and Stats act on
/// the worker itself rather than on any key.
#[derive(Debug)]
pub enum LoaderOp<K, V> {
    /// Fetch data from the resource wrapped by this data loader (or the cache).
    Load(LoadRequest<K, V>),
    /// Add values to the cache that were fetched from elsewhere.
    Prime(K, V),
    PrimeMany(Vec<(K, V)>),
    /// Dispatch the staged batch now instead of waiting out the accumulation window.
    Flush,
    Stats(oneshot::Sender<WorkerStats>),
}

#[derive(Debug)]
pub enum LoadRequest<K, V> {
    One(K, oneshot::Sender<Result<V, LoadError>>),
    Many(Vec<K>, oneshot::Sender<Vec<Result<V, LoadError>>>),
}

impl<K, V> LoadRequest<K, V>
where
    V: Send + std::fmt::Debug,
{
    pub fn keys(&self) -> &[K] {
        match self {
            LoadRequest::One(ref key, _) => slice::from_ref(key),
            LoadRequest::Many(ref keys, _) => keys,
        }
    }

    /// Sends one result per requested key, in the order of [`LoadRequest::keys`].
    pub fn send_response<I>(self, values: I)
    where
        I: IntoIterator<Item = Result<V, LoadError>>,
    {
        match self {
            LoadRequest::One(_, response_tx) => {
                let response = values.into_iter().next().unwrap_or(Err(LoadError::Cancelled));
                if let Err(e) = response_tx.send(response) {
                    tracing::error!(?e, "receiver dropped");
                }
            }
            LoadRequest::Many(_, response_tx) => {
                let response = values.into_iter().collect::<Vec<_>>();
                if let Err(e) = response_tx.send(response) {
                    tracing::error!(?e, "receiver dropped");
                }
            }
        }
    }
}
