// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime's configuration surface (spec §6.1).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which OS event-loop backend the reactor should bind to.
///
/// `Auto` lets [`polling`] pick the best backend available on the host
/// platform; the other variants are hints for diagnostics and are not
/// currently enforced (spec's Non-goals: no specific backend is mandated).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Auto,
    Epoll,
    Kqueue,
    Iocp,
}

/// The flat configuration struct described in spec §6.1.
///
/// Construct one with [`RuntimeConfig::builder`], or deserialize one with
/// `serde` from a config file or environment so an embedding application can
/// tune the runtime without recompiling it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fixed worker thread count. Defaults to [`std::thread::available_parallelism`].
    pub worker_threads: usize,
    /// Maximum number of tasks opportunistically taken in a single successful
    /// steal (spec §4.3's batch steal).
    pub steal_batch_size: usize,
    /// Bounded spin iterations a worker performs before parking the OS thread.
    pub spin_before_park: usize,
    /// Default deadline applied to reactor operations that don't specify
    /// their own. `None` means no default timeout.
    pub default_op_timeout: Option<Duration>,
    /// Event-loop backend selector.
    pub backend: Backend,
    /// Whether to maintain the observability counters described in spec §6.1
    /// ("emitted, not consumed by core").
    pub metrics_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            steal_batch_size: 32,
            spin_before_park: 200,
            default_op_timeout: None,
            backend: Backend::default(),
            metrics_enabled: true,
        }
    }
}

impl RuntimeConfig {
    /// Starts building a [`RuntimeConfig`] from the default values.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder { config: Self::default() }
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    #[must_use]
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.config.worker_threads = worker_threads;
        self
    }

    #[must_use]
    pub fn steal_batch_size(mut self, steal_batch_size: usize) -> Self {
        self.config.steal_batch_size = steal_batch_size;
        self
    }

    #[must_use]
    pub fn spin_before_park(mut self, spin_before_park: usize) -> Self {
        self.config.spin_before_park = spin_before_park;
        self
    }

    #[must_use]
    pub fn default_op_timeout(mut self, default_op_timeout: Option<Duration>) -> Self {
        self.config.default_op_timeout = default_op_timeout;
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    #[must_use]
    pub fn metrics_enabled(mut self, metrics_enabled: bool) -> Self {
        self.config.metrics_enabled = metrics_enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_threads_matches_available_parallelism() {
        let config = RuntimeConfig::default();
        assert!(config.worker_threads >= 1);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = RuntimeConfig::builder()
            .worker_threads(4)
            .steal_batch_size(64)
            .metrics_enabled(false)
            .build();

        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.steal_batch_size, 64);
        assert!(!config.metrics_enabled);
    }
}
