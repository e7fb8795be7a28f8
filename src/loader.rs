use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Drop;

use tokio::sync::{mpsc, oneshot};
use tracing_futures::Instrument;

use crate::{
    batch_function::BatchFunction,
    config::LoaderConfig,
    error::LoadError,
    loader_op::{LoadRequest, LoaderOp},
    loader_worker::LoaderWorker,
    worker_stats::WorkerStats,
};

/// Batch loads values from some expensive resource, primarily intended for mitigating GraphQL's
/// N+1 problem.
///
/// Users can call [`Loader::load`] and [`Loader::load_many`] to fetch values from the underlying
/// resource or cache. Values can be added to the cache out-of-band through the use of
/// [`Loader::prime`] and [`Loader::prime_many`]. There is deliberately no way to evict a single
/// key: a loader and its cache live exactly as long as one unit of work (typically one incoming
/// request), see [`LoaderRegistry`](crate::LoaderRegistry).
///
/// The `Loader` struct acts as an intermediary between the async domain in which `load` calls are
/// invoked and the pseudo-single-threaded domain of the `LoaderWorker`. Callers can invoke the
/// `Loader` from multiple parallel tasks, and the loader will enqueue the requested operations on
/// the request queue for processing by its `LoaderWorker`. The worker processes the requests
/// sequentially and provides results via response oneshot channels back to the Loader.
///
/// Dropping the `Loader` (or calling [`Loader::cancel`]) stops the worker. Every request that
/// has not been answered yet resolves to [`LoadError::Cancelled`], and the result of a batch
/// that was in flight is discarded.
pub struct Loader<K, V>
where
    K: 'static + Eq + Debug + Clone + Send,
    V: 'static + Send + Debug + Clone,
{
    request_tx: mpsc::UnboundedSender<LoaderOp<K, V>>,
    load_task_handle: tokio::task::JoinHandle<()>,
}

impl<K, V> Drop for Loader<K, V>
where
    K: 'static + Eq + Debug + Clone + Send,
    V: 'static + Send + Debug + Clone,
{
    fn drop(&mut self) {
        self.load_task_handle.abort();
    }
}

impl<K, V> Loader<K, V>
where
    K: 'static + Eq + Debug + Clone + Hash + Send + Sync,
    V: 'static + Send + Debug + Clone,
{
    /// Creates a new Loader for the provided BatchFunction and its context, with the default
    /// [`LoaderConfig`].
    ///
    /// Note: the batch function is passed in as a marker for type inference.
    ///
    /// Must be called from within a tokio runtime, since the loader spawns its worker task.
    pub fn new<F>(batch_fn: F, context: F::Context) -> Self
    where
        F: 'static + BatchFunction<Key = K, Value = V> + Send,
        F::Context: Send + Sync + 'static,
    {
        Self::with_config(batch_fn, context, LoaderConfig::default())
    }

    pub fn with_config<F>(_: F, context: F::Context, config: LoaderConfig) -> Self
    where
        F: 'static + BatchFunction<Key = K, Value = V> + Send,
        F::Context: Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::trace_span!("LoaderWorker", kv = std::any::type_name::<(K, V)>());
        let worker = LoaderWorker::<K, V, F, HashMap<K, Result<V, LoadError>>, F::Context>::new(
            HashMap::new(),
            rx,
            context,
            config,
        );
        let load_task_handle = tokio::task::spawn(worker.start().instrument(span));
        Self { request_tx: tx, load_task_handle }
    }
}

impl<K, V> Loader<K, V>
where
    K: 'static + Eq + Debug + Clone + Send + Sync,
    V: 'static + Send + Debug + Clone,
{
    /// Loads a value from the underlying resource.
    ///
    /// If the value (or a cached not-found outcome) is already in the loader cache, it is returned
    /// as soon as the request is processed. Otherwise, the requested key joins the batch that the
    /// loader is currently accumulating; concurrent callers asking for the same key share one
    /// fetch and one result.
    pub async fn load(&self, key: K) -> Result<V, LoadError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LoaderOp::Load(LoadRequest::One(key, response_tx)))?;
        response_rx.await.map_err(|_| LoadError::Cancelled)?
    }

    /// Loads many values at once.
    ///
    /// Results are returned in the order of `keys`, one per key, so a failure for one key does not
    /// affect the others.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<Result<V, LoadError>> {
        let count = keys.len();
        let (response_tx, response_rx) = oneshot::channel();
        if self.send(LoaderOp::Load(LoadRequest::Many(keys, response_tx))).is_err() {
            return cancelled(count);
        }
        response_rx.await.unwrap_or_else(|_| cancelled(count))
    }

    /// Adds a value to the cache.
    ///
    /// A primed key that is waiting for the next batch is taken out of it, and its requesters
    /// receive the primed value. Fails with [`LoadError::Cancelled`] once the loader is stopped.
    pub async fn prime(&self, key: K, value: V) -> Result<(), LoadError> {
        self.send(LoaderOp::Prime(key, value))
    }

    /// Adds many values to the cache at once.
    pub async fn prime_many(&self, key_vals: Vec<(K, V)>) -> Result<(), LoadError> {
        self.send(LoaderOp::PrimeMany(key_vals))
    }

    /// Dispatches the keys accumulated so far without waiting for the accumulation window to
    /// close. Intended for the end of a traversal pass.
    pub fn flush(&self) {
        let _ = self.send(LoaderOp::Flush);
    }

    /// Returns a snapshot of the worker's batching statistics, or `None` once it was cancelled.
    pub async fn stats(&self) -> Option<WorkerStats> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LoaderOp::Stats(response_tx)).ok()?;
        response_rx.await.ok()
    }

    /// Stops the worker. Outstanding and future loads resolve to [`LoadError::Cancelled`].
    pub fn cancel(&self) {
        self.load_task_handle.abort();
    }

    fn send(&self, op: LoaderOp<K, V>) -> Result<(), LoadError> {
        self.request_tx.send(op).map_err(|_| {
            tracing::trace!("LoaderWorker is gone");
            LoadError::Cancelled
        })
    }
}

fn cancelled<V>(count: usize) -> Vec<Result<V, LoadError>> {
    (0..count).map(|_| Err(LoadError::Cancelled)).collect()
}
