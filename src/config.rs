use std::env;
use std::time::Duration;

use thiserror::Error;

pub const WAIT_MS_VAR: &str = "BATCHLOAD_WAIT_MS";
pub const MAX_BATCH_VAR: &str = "BATCHLOAD_MAX_BATCH";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: expected {expected}")]
    Invalid { var: &'static str, value: String, expected: &'static str },
}

/// Tuning for a loader's accumulation window.
///
/// Once a loader has keys staged it keeps accepting requests for at most `wait` before it
/// dispatches, unless `max_batch` keys are staged first or the batch is flushed explicitly.
/// A zero `wait` dispatches as soon as the requesting tasks have had one chance to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub wait: Duration,
    pub max_batch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { wait: Duration::from_millis(1), max_batch: 100 }
    }
}

impl LoaderConfig {
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Values below one are raised to one.
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Reads `BATCHLOAD_WAIT_MS` and `BATCHLOAD_MAX_BATCH`, keeping defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(WAIT_MS_VAR) {
            let millis = value.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                var: WAIT_MS_VAR,
                value: value.clone(),
                expected: "a whole number of milliseconds",
            })?;
            config.wait = Duration::from_millis(millis);
        }

        if let Some(value) = lookup(MAX_BATCH_VAR) {
            config.max_batch = match value.trim().parse::<usize>() {
                Ok(max_batch) if max_batch > 0 => max_batch,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: MAX_BATCH_VAR,
                        value,
                        expected: "a positive integer",
                    })
                }
            };
        }

        tracing::debug!(?config, "loaded loader config");
        Ok(config)
    }
}
