use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

const fn default_min_threads() -> usize {
    1
}

fn default_max_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .max(2)
}

const fn default_idle_timeout_ms() -> u64 {
    2000
}

const fn default_progress_interval_ms() -> u64 {
    250
}

fn default_thread_name() -> String {
    "skein".to_string()
}

/// Runtime configuration.
///
/// Every field has a default, so an empty configuration source yields a usable configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RuntimeConfiguration {
    /// Number of shared-pool threads spawned by [`Scheduler::start`][crate::Scheduler::start] and kept alive while
    /// idle.
    ///
    /// Defaults to 1.
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,

    /// Upper bound on the number of shared-pool threads.
    ///
    /// Defaults to the available parallelism of the host, but never less than 2.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// How long, in milliseconds, a shared-pool thread above `min_threads` stays parked before retiring.
    ///
    /// Defaults to 2000ms.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Minimum interval, in milliseconds, between two non-terminal progress events emitted by the same task.
    ///
    /// Defaults to 250ms.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Prefix used when naming spawned threads.
    ///
    /// Shared-pool threads are named `<prefix>-pool-NN` and exclusive threads `<prefix>-excl-NN`. Defaults to
    /// `skein`.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,

    /// Stack size, in bytes, of every spawned thread.
    ///
    /// Defaults to the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_stack_size: Option<usize>,
}

impl RuntimeConfiguration {
    /// Returns the idle timeout of shared-pool threads.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Returns the minimum interval between non-terminal progress events.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Returns a thread builder named `name`, with the configured stack size.
    pub(crate) fn thread_builder(&self, name: String) -> std::thread::Builder {
        let builder = std::thread::Builder::new().name(name);
        match self.thread_stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }

    /// Returns the effective upper bound on shared-pool threads, which is never below `min_threads` or 1.
    pub(crate) fn effective_max_threads(&self) -> usize {
        self.max_threads.max(self.min_threads).max(1)
    }
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            idle_timeout_ms: default_idle_timeout_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            thread_name: default_thread_name(),
            thread_stack_size: None,
        }
    }
}
