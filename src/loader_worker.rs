use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::{
    batch_function::{BatchFunction, BatchResult},
    cache::Cache,
    config::LoaderConfig,
    error::LoadError,
    loader_op::{LoadRequest, LoaderOp},
    worker_stats::WorkerStats,
};

/// One dispatched chunk: its keys and whatever the batch function returned for them.
type Fetch<K, V> = BoxFuture<'static, (Vec<K>, BatchResult<K, V>)>;

/// A load request waiting on one or more keys that are staged or in flight.
struct PendingLoad<K, V> {
    request: LoadRequest<K, V>,
    results: Vec<Option<Result<V, LoadError>>>,
    remaining: usize,
}

impl<K, V> PendingLoad<K, V>
where
    V: Send + Debug + Clone,
{
    fn fill(&mut self, index: usize, result: &Result<V, LoadError>) {
        if self.results[index].is_none() {
            self.results[index] = Some(result.clone());
            self.remaining -= 1;
        }
    }

    fn respond(self) {
        let results = self.results.into_iter().map(|r| r.unwrap_or(Err(LoadError::Cancelled)));
        self.request.send_response(results);
    }
}

/// A `LoaderWorker` is the "single-thread" worker task that actually does the loading work. It is
/// the only owner of the cache and of the batch being accumulated, so none of that state is ever
/// shared between tasks.
///
/// Once started, it runs in a loop until the parent Loader aborts it's `JoinHandle` or drops the
/// request queue tx channel.
///
/// Each turn of the loop waits for whichever comes first:
///
/// 1. An op on the request queue.
/// 2. A dispatched batch returning from the `BatchFunction`.
/// 3. The accumulation window of the staged batch closing.
///
/// Load requests that can be answered from the cache are answered immediately, even while
/// batches are in flight. Missing keys that nobody is waiting on yet are staged (deduplicated, in
/// first-seen order) for the next batch; keys that are already staged or in flight only gain
/// another waiter, so each key is fetched by at most one batch at a time.
///
/// The staged batch is dispatched once its [`LoaderConfig::wait`] window closes, `max_batch` keys
/// are staged, or a Flush op arrives. Dispatching hands chunks of at most `max_batch` keys to the
/// `BatchFunction` and immediately starts a new, empty batch. When a chunk returns, values and
/// not-found outcomes are inserted into the cache and every waiter of each key is resolved.
/// Failures that are not cacheable (per-key failures and batch-level failures) are delivered to
/// the waiters only.
pub struct LoaderWorker<K, V, F, CacheT, ContextT>
where
    K: 'static + Eq + Hash + Debug + Clone + Send + Sync,
    V: 'static + Send + Debug + Clone,
    F: 'static + BatchFunction<Key = K, Value = V, Context = ContextT> + Send,
    CacheT: Cache<K = K, V = Result<V, LoadError>>,
    ContextT: Send + Sync + 'static,
{
    cache: CacheT,
    request_rx: mpsc::UnboundedReceiver<LoaderOp<K, V>>,
    config: LoaderConfig,
    /// Keys of the batch being accumulated, in first-seen order.
    keys_to_load: Vec<K>,
    staged: HashSet<K>,
    /// When the batch being accumulated has to be dispatched at the latest.
    window: Option<Instant>,
    dispatch_now: bool,
    /// Requesters of every staged or in-flight key, as (request id, position in the request).
    waiters: HashMap<K, Vec<(u64, usize)>>,
    pending_requests: HashMap<u64, PendingLoad<K, V>>,
    next_request_id: u64,
    context: Arc<ContextT>,
    stats: WorkerStats,
    phantom_batch_function: PhantomData<F>,
}

impl<K, V, F, CacheT, ContextT> LoaderWorker<K, V, F, CacheT, ContextT>
where
    K: 'static + Eq + Hash + Debug + Clone + Send + Sync,
    V: 'static + Send + Debug + Clone,
    F: 'static + BatchFunction<Key = K, Value = V, Context = ContextT> + Send,
    CacheT: Cache<K = K, V = Result<V, LoadError>>,
    ContextT: Send + Sync + 'static,
{
    pub fn new(
        cache: CacheT,
        request_rx: mpsc::UnboundedReceiver<LoaderOp<K, V>>,
        context: ContextT,
        config: LoaderConfig,
    ) -> Self {
        Self {
            cache,
            request_rx,
            config,
            keys_to_load: Vec::new(),
            staged: HashSet::new(),
            window: None,
            dispatch_now: false,
            waiters: HashMap::new(),
            pending_requests: HashMap::new(),
            next_request_id: 0,
            context: Arc::new(context),
            stats: WorkerStats::new(std::any::type_name::<(K, V)>()),
            phantom_batch_function: PhantomData,
        }
    }

    pub async fn start(mut self) {
        let mut in_flight: FuturesUnordered<Fetch<K, V>> = FuturesUnordered::new();

        loop {
            let window = self.window;
            tokio::select! {
                op = self.request_rx.recv() => match op {
                    Some(op) => self.mux_op(op),
                    None => {
                        tracing::info!("Tx channel closed. Terminating LoaderWorker.");
                        return;
                    }
                },
                Some((keys, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete(keys, outcome);
                }
                _ = time::sleep_until(window.unwrap_or_else(Instant::now)), if window.is_some() => {
                    // Every requester of the staged batch is waiting on a result.
                    self.dispatch_now = true;
                }
            }

            // Let requests that are already queued join the batch before deciding on dispatch.
            if !self.drain_queue() {
                tracing::info!("Tx channel closed. Terminating LoaderWorker.");
                return;
            }
            if self.keys_to_load.is_empty() {
                continue;
            }
            if self.config.wait.is_zero() && !self.dispatch_now {
                // Give requesters that are already runnable one chance to join the batch.
                tokio::task::yield_now().await;
                if !self.drain_queue() {
                    return;
                }
                self.dispatch_now = true;
            }
            if self.dispatch_now || self.keys_to_load.len() >= self.config.max_batch {
                for fetch in self.dispatch() {
                    in_flight.push(fetch);
                }
            }
        }
    }

    /// Handles every op already queued without waiting. Returns false once the request channel
    /// is closed.
    fn drain_queue(&mut self) -> bool {
        loop {
            match self.request_rx.recv().now_or_never() {
                Some(Some(op)) => self.mux_op(op),
                Some(None) => return false,
                None => return true,
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn mux_op(&mut self, op: LoaderOp<K, V>) {
        match op {
            LoaderOp::Load(request) => self.stage(request),
            LoaderOp::Prime(key, value) => self.prime(key, value),
            LoaderOp::PrimeMany(key_vals) => {
                for (key, value) in key_vals {
                    self.prime(key, value);
                }
            }
            // A flush only applies to the batch being accumulated when it arrives.
            LoaderOp::Flush if self.keys_to_load.is_empty() => {
                tracing::trace!("nothing staged, ignoring flush");
            }
            LoaderOp::Flush => self.dispatch_now = true,
            LoaderOp::Stats(response_tx) => {
                if let Err(e) = response_tx.send(self.stats.clone()) {
                    tracing::error!(?e, "receiver dropped");
                }
            }
        }
    }

    fn stage(&mut self, request: LoadRequest<K, V>) {
        let keys = request.keys().to_vec();
        let results = self.cache.get(&keys).into_iter().map(|v| v.cloned()).collect::<Vec<_>>();
        let hits = results.iter().filter(|v| v.is_some()).count();
        self.stats.record_load_request(keys.len() as u32);
        self.stats.record_cache_hits(hits as u32);

        if hits == keys.len() {
            request.send_response(results.into_iter().flatten());
            return;
        }

        let id = self.next_request_id;
        self.next_request_id += 1;

        let mut keys_to_load = Vec::new();
        for (index, key) in keys.into_iter().enumerate() {
            if results[index].is_some() {
                continue;
            }
            let joins_existing = self.waiters.contains_key(&key);
            self.waiters.entry(key.clone()).or_default().push((id, index));
            if !joins_existing {
                keys_to_load.push(key);
            }
        }
        tracing::debug!(requested_keys = ?request.keys(), ?keys_to_load);
        for key in keys_to_load {
            if self.keys_to_load.is_empty() {
                self.window = Some(Instant::now() + self.config.wait);
            }
            self.staged.insert(key.clone());
            self.keys_to_load.push(key);
        }

        let remaining = results.iter().filter(|v| v.is_none()).count();
        self.pending_requests.insert(id, PendingLoad { request, results, remaining });
    }

    fn prime(&mut self, key: K, value: V) {
        // A primed key no longer needs fetching; its waiters resolve from the primed value.
        if self.staged.remove(&key) {
            self.keys_to_load.retain(|k| k != &key);
            if self.keys_to_load.is_empty() {
                self.window = None;
                self.dispatch_now = false;
            }
        }
        let result = Ok(value);
        if let Some(waiters) = self.waiters.remove(&key) {
            self.notify(waiters, &result);
        }
        self.cache.insert(key, result);
    }

    /// Moves the staged batch into fetches and starts a new, empty batch.
    fn dispatch(&mut self) -> Vec<Fetch<K, V>> {
        let keys = std::mem::take(&mut self.keys_to_load);
        self.staged.clear();
        self.window = None;
        self.dispatch_now = false;
        tracing::debug!(?keys, "dispatching batch");

        keys.chunks(self.config.max_batch.max(1))
            .map(|chunk| {
                self.stats.record_load_exec(chunk.len() as u32);
                let chunk = chunk.to_vec();
                let context = self.context.clone();
                async move {
                    let outcome = F::load(&chunk, &context).await;
                    (chunk, outcome)
                }
                .boxed()
            })
            .collect()
    }

    #[tracing::instrument(skip(self, outcome))]
    fn complete(&mut self, keys: Vec<K>, outcome: BatchResult<K, V>) {
        match outcome {
            Ok(loaded_keyvals) => {
                let mut loaded = loaded_keyvals.into_iter().collect::<HashMap<_, _>>();
                let mut loaded_count = 0;
                for key in &keys {
                    let result = match loaded.remove(key) {
                        Some(Ok(value)) => {
                            loaded_count += 1;
                            Ok(value)
                        }
                        Some(Err(e)) => Err(LoadError::from_key_error(key, e)),
                        None => Err(LoadError::not_found(key)),
                    };
                    self.settle(key, result);
                }
                if !loaded.is_empty() {
                    let unrequested = loaded.keys().collect::<Vec<_>>();
                    tracing::debug!(?unrequested, "ignoring unrequested keys");
                }
                tracing::debug!(loaded_count, "batch loaded");
                self.stats.record_load_exec_completed(loaded_count);
            }
            Err(error) => {
                tracing::warn!(%error, "batch fetch failed");
                self.stats.record_failed_load();
                for key in &keys {
                    self.settle(key, Err(LoadError::BatchFetchFailure(error.clone())));
                }
            }
        }
    }

    fn settle(&mut self, key: &K, result: Result<V, LoadError>) {
        // Keys primed while their fetch was in flight keep the primed value.
        let waiters = match self.waiters.remove(key) {
            Some(waiters) => waiters,
            None => return,
        };
        self.notify(waiters, &result);
        let cacheable = match &result {
            Ok(_) => true,
            Err(e) => e.is_cacheable(),
        };
        if cacheable {
            self.cache.insert(key.clone(), result);
        }
    }

    fn notify(&mut self, waiters: Vec<(u64, usize)>, result: &Result<V, LoadError>) {
        for (id, index) in waiters {
            let done = match self.pending_requests.get_mut(&id) {
                Some(pending) => {
                    pending.fill(index, result);
                    pending.remaining == 0
                }
                None => false,
            };
            if done {
                if let Some(pending) = self.pending_requests.remove(&id) {
                    pending.respond();
                }
            }
        }
    }
}

impl<K, V, F, CacheT, ContextT> Drop for LoaderWorker<K, V, F, CacheT, ContextT>
where
    K: 'static + Eq + Hash + Debug + Clone + Send + Sync,
    V: 'static + Send + Debug + Clone,
    F: 'static + BatchFunction<Key = K, Value = V, Context = ContextT> + Send,
    CacheT: Cache<K = K, V = Result<V, LoadError>>,
    ContextT: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cache.flush();
        tracing::debug!(
            worker_stats = ?self.stats,
            pending = self.pending_requests.len(),
            "LoaderWorker dropped"
        );
    }
}
