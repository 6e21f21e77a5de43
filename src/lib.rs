//! Cyclebench: the execution core of a workload generator.
//!
//! A workload is a set of named operations with integer ratios. An [`Activity`] maps every
//! cycle number of a range onto one of those operations, deterministically, and runs the
//! range on a pool of concurrent motors, optionally paced by a [`RateLimiter`]. What an
//! operation actually does (a query, a request, a write) is up to the caller.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`DispatchTable`]: turns `(op, ratio)` pairs into a fixed cycle → op mapping. Two
//!   layouts exist, bucketed and interleaved, both repeating every `sum(ratios)` cycles.
//! - [`ActivityMotor`]: one concurrency slot. Claims cycles from a shared cursor, binds and
//!   runs the op, retries, and routes failures through the [`ErrorPolicy`].
//! - [`RateLimiter`]: a governor task feeding a semaphore with time ticks. Supports
//!   bursting to catch up on scheduling delay, and hot spec swaps.
//! - [`RunStateTally`]: per-state motor counts with `await_*` conditions that the
//!   controller and external callers block on.
//! - [`Activity`]: the controller. Validates the config, spawns motors, accepts live rate
//!   and dispatch updates, and reaps motors into an [`ActivitySummary`].
//! - [`RunReport`] and [`Reporter`]: derived figures and where to send them.
//! - [`TimeoutPredicate`]: a rate-limited, deadline-bounded condition check for readiness
//!   and shutdown polling.
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) functions, such as the refill
//!   planner of the rate limiter
//!
//! # Example
//!
//! ```rust,no_run
//! use cyclebench::{Activity, ActivityConfig, OpRegistry, RateSpec, Reporter, RunReport, StdoutReporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut registry = OpRegistry::new();
//!     registry
//!         .register_fn("read", |cycle, _| async move {
//!             // issue the read for `cycle`
//!             let _ = cycle;
//!             Ok(())
//!         })
//!         .register_fn("write", |_, _| async { Ok(()) });
//!
//!     let config = ActivityConfig::builder()
//!         .alias("mixed")
//!         .ops(vec![("read".into(), 3), ("write".into(), 1)])
//!         .rate(RateSpec::new(1_000.0)?)
//!         .build();
//!
//!     let activity = Activity::new(config, &registry)?;
//!     let summary = activity.run().await?;
//!     StdoutReporter.report(&RunReport::from(summary)).await
//! }
//! ```

/// The controller that spawns and reaps motors
pub mod activity;
/// Activity parameters and their string forms
pub mod config;
/// Cycle spans and the shared claim cursor
pub mod cycles;
pub mod error;
/// Per-phase timing hooks
pub mod metrics;
/// The per-slot worker loop
pub mod motor;
/// Error handler chains
pub mod policy;
/// Deadline-bounded condition polling
pub mod predicate;
pub mod rate;
/// Run reports and reporters
pub mod report;
/// Ratio-based cycle dispatch
pub mod sequencer;
/// Mergeable run accounting
pub mod summary;
/// Run-state counting and waiting
pub mod tally;

pub use activity::Activity;
pub use config::{ActivityConfig, ThreadSpec};
pub use cycles::{CycleRange, CycleSpan};
pub use error::{ActivityError, ConfigError, CycleExecutionError, DynError, StateTransitionError};
pub use metrics::{MetricsSink, NoopMetrics, Phase, PhaseRecorder};
pub use motor::{ActivityMotor, WorkerContext};
pub use policy::{CycleOutcome, ErrorDetail, ErrorHandler, ErrorPolicy};
pub use predicate::{PollingPredicate, PredicateResult, Status, TimeoutPredicate};
pub use rate::{RateLimiter, RateScope, RateSpec};
pub use report::{JsonReporter, Reporter, RunReport, StdoutReporter};
pub use sequencer::{DispatchTable, Op, OpDefinition, OpFactory, OpRegistry, SequencerKind};
pub use summary::{ActivitySummary, MotorSummary};
pub use tally::{RunState, RunStateImage, RunStateTally};
