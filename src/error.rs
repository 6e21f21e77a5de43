//! Error taxonomy for the engine.
//!
//! - [`ConfigError`]: invalid startup or reconfiguration input. The run never starts.
//! - [`CycleExecutionError`]: an op failed and the error policy decided to abort the motor.
//! - [`StateTransitionError`]: the run-state tally was asked to do something that breaks its
//!   accounting. This is an engine bug and aborts the whole run.
//! - [`ActivityError`]: what the controller surfaces to its caller.
//!
//! Timeouts are not errors here: timed waits return sentinel values
//! ([`crate::tally::RunStateImage::is_timeout`], [`crate::predicate::Status::Incomplete`]).
use thiserror::Error;

use crate::tally::RunState;

/// Opaque failure raised by an op, a binding step, or a predicate.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("thread count must be positive, got {0}")]
    InvalidThreads(i64),
    #[error("at least one op definition is required")]
    EmptyOpSet,
    #[error("op '{op}' has non-positive ratio {ratio}")]
    NonPositiveRatio { op: String, ratio: i64 },
    #[error("total op weight overflows i64")]
    WeightOverflow,
    #[error("interleaved sequence period {period} exceeds the limit of {limit} slots")]
    PeriodTooLarge { period: i64, limit: i64 },
    #[error("cycle range {start}..{end} is empty or inverted")]
    InvalidCycleRange { start: i64, end: i64 },
    #[error("rate must be a positive number of ops per second, got {0}")]
    NonPositiveRate(f64),
    #[error("burst ratio must be at least 1.0, got {0}")]
    InvalidBurst(f64),
    #[error("max tries must be at least 1, got {0}")]
    InvalidMaxTries(i64),
    #[error("no op named '{0}' is registered")]
    UnknownOp(String),
    #[error("unknown sequencer '{0}', expected 'bucket' or 'interleaved'")]
    UnknownSequencer(String),
    #[error("unknown error handler '{0}', expected one of log, store, rethrow or a result code")]
    UnknownErrorHandler(String),
    #[error("unknown rate scope '{0}', expected 'activity' or 'thread'")]
    UnknownRateScope(String),
    #[error("unable to parse {key}='{value}'")]
    Unparsable { key: String, value: String },
    #[error("the activity was started without a rate limiter; rate specs cannot be applied")]
    RateNotConfigured,
    #[error("rate scope is fixed at start ({running:?}); cannot switch to {requested:?}")]
    RateScopeChange {
        running: crate::rate::RateScope,
        requested: crate::rate::RateScope,
    },
}

impl ConfigError {
    pub(crate) fn unparsable(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Unparsable {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Raised when an accounting operation on the tally would break its invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    #[error("cannot remove {state}: no registered motor holds it")]
    NotHeld { state: RunState },
    #[error("cannot change {from} -> {to}: no registered motor holds {from}")]
    ChangeFromUnheld { from: RunState, to: RunState },
    #[error("illegal motor transition {from} -> {to}")]
    Illegal { from: RunState, to: RunState },
    #[error("tally counts sum to {sum} but {registered} motors are registered")]
    CountMismatch { sum: i64, registered: i64 },
}

/// An op failure the error policy chose to escalate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cycle {cycle} (op '{op}') failed after {tries} tries: {message}")]
pub struct CycleExecutionError {
    pub cycle: i64,
    pub op: String,
    pub tries: u32,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run aborted, tally is inconsistent: {0}")]
    StateTransition(#[from] StateTransitionError),
    #[error("activity '{0}' was already started")]
    AlreadyStarted(String),
    #[error("activity '{0}' has no running motors to join")]
    NotRunning(String),
}
