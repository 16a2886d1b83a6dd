//! Managed executor implementation for the Ergane library.
//!
//! [`ManagedExecutor`] wraps a pool of worker threads sized between a core
//! and a maximum, with a queue policy derived from the configured capacity
//! (hand-off, bounded, or unbounded). [`ManagedScheduledExecutor`] extends
//! it with one-shot delays and fixed-rate/fixed-delay periodic scheduling.

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod executor;
pub mod queue;
pub mod scheduled;

pub use executor::ManagedExecutor;
pub use queue::{Take, Work, WorkQueue};
pub use scheduled::{ManagedScheduledExecutor, ScheduledTaskHandle};
