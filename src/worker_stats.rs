/// Batching statistics for one loader, accumulated over its unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    /// Human readable name used to identify this worker stats when it is reported.
    tag: &'static str,
    /// Number of `LoaderOp::Load` that were received by the worker.
    load_requests: u32,
    /// The total number of keys that were requested for loading (not necessarily unique).
    items_requested: u32,
    /// The number of keys that were immediately found in the loader cache.
    cache_hits: u32,
    /// Number of batches handed to the batch function.
    loads: u32,
    /// The average number of keys that were fetched during load operations.
    average_batch_size: f32,
    /// The max number of keys fetched during a single load.
    max_batch_size: u32,
    /// The min number of keys fetched during a single load.
    min_batch_size: u32,
    /// The total number of items that were actually loaded.
    items_loaded: u32,
    /// Number of batches that failed as a whole.
    failed_loads: u32,
}

impl WorkerStats {
    pub fn new(tag: &'static str) -> Self {
        Self { tag, min_batch_size: u32::MAX, ..Default::default() }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn load_requests(&self) -> u32 {
        self.load_requests
    }

    pub fn items_requested(&self) -> u32 {
        self.items_requested
    }

    pub fn cache_hits(&self) -> u32 {
        self.cache_hits
    }

    pub fn loads(&self) -> u32 {
        self.loads
    }

    pub fn average_batch_size(&self) -> f32 {
        self.average_batch_size
    }

    pub fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    /// `None` until the first batch was dispatched.
    pub fn min_batch_size(&self) -> Option<u32> {
        (self.loads > 0).then_some(self.min_batch_size)
    }

    pub fn items_loaded(&self) -> u32 {
        self.items_loaded
    }

    pub fn failed_loads(&self) -> u32 {
        self.failed_loads
    }

    pub fn record_load_request(&mut self, items_requested: u32) {
        self.load_requests += 1;
        self.items_requested += items_requested;
    }

    pub fn record_cache_hits(&mut self, hits: u32) {
        self.cache_hits += hits;
    }

    pub fn record_load_exec(&mut self, batch_size: u32) {
        let new_total_load = self.loads + 1;
        self.average_batch_size = (((self.average_batch_size as f64 * self.loads as f64)
            + batch_size as f64)
            / new_total_load as f64) as f32;
        self.loads = new_total_load;
        self.max_batch_size = self.max_batch_size.max(batch_size);
        self.min_batch_size = self.min_batch_size.min(batch_size);
    }

    pub fn record_load_exec_completed(&mut self, loaded_item_count: u32) {
        self.items_loaded += loaded_item_count;
    }

    pub fn record_failed_load(&mut self) {
        self.failed_loads += 1;
    }
}
