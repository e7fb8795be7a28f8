mod batch_function;
mod cache;
mod config;
mod error;
mod loader;
mod loader_op;
mod loader_worker;
mod registry;
mod worker_stats;

pub use batch_function::{BatchFunction, BatchResult};
pub use config::{ConfigError, LoaderConfig};
pub use error::{FetchError, KeyError, LoadError};
pub use loader::Loader;
pub use registry::LoaderRegistry;
pub use worker_stats::WorkerStats;
