//! # workq
//!
//! Bounded-concurrency work dispatch queue.
//!
//! Accepts background tasks from any thread, lets at most a fixed number of
//! them run at once on an injected executor, and lets callers cancel or
//! promote submissions that have not started yet. Ships with tokio-backed,
//! manually stepped and inline executors, a broadcast event stream, env/TOML
//! configuration, and OpenTelemetry observability.

pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod model;
pub mod queue;
pub mod telemetry;

pub use error::{Error, Result};
pub use executor::{Executor, InlineExecutor, ManualExecutor, TokioExecutor};
pub use queue::{WorkItem, WorkQueue};
