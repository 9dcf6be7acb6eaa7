//! Pipeline configuration.
//!
//! Defaults come from the environment:
//! - `HYPERPIPE_CONCURRENCY`: number of transfer slots (default 8)
//! - `HYPERPIPE_POLL_INTERVAL_MS`: upper bound on one multiplexed wait (default 1000)

use std::time::Duration;

const DEFAULT_CONCURRENCY: usize = 8;

/// Largest accepted slot count. Every slot owns a live transfer handle.
pub const MAX_CONCURRENCY: usize = 65_536;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of slots, fixed for the lifetime of the pipeline. Must be in
    /// `1..=MAX_CONCURRENCY`.
    pub concurrency: usize,
    /// The driver wakes at least this often while waiting for completions,
    /// to check for cancellation and report progress.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: env_parse("HYPERPIPE_CONCURRENCY").unwrap_or(DEFAULT_CONCURRENCY),
            poll_interval: env_parse::<u64>("HYPERPIPE_POLL_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }
}

impl PipelineConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
