//! Benchmark support for the Ergane managed task-execution library.

use std::sync::Arc;

use ergane::{ConfigBuilder, ContextRegistry, ManagedExecutor};

/// Build an executor sized for benchmark runs.
///
/// # Panics
/// Panics when the configuration is rejected; benchmark setup is fatal.
#[must_use]
pub fn bench_executor(name: &str, core: usize, max: usize, queue_capacity: usize) -> ManagedExecutor {
    let config = ConfigBuilder::new(name)
        .core_size(core)
        .max_size(max)
        .queue_capacity(queue_capacity)
        .build()
        .expect("benchmark executor configuration");
    ManagedExecutor::new(config, Arc::new(ContextRegistry::new()))
        .expect("benchmark executor construction")
}
