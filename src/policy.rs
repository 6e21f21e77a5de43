//! Per-cycle error policy.
//!
//! An [`ErrorPolicy`] is an ordered chain of [`ErrorHandler`]s. Each handler sees the failed
//! [`CycleOutcome`] and the [`ErrorDetail`] produced so far, and returns an updated detail.
//! The motor only looks at the final detail: `abort` ends that motor, anything else
//! continues with the recorded result code.
//!
//! Chains are written as comma-separated handler names:
//!
//! | name              | effect                                         |
//! |-------------------|------------------------------------------------|
//! | `log`, `warn`     | emit a `warn!` event for the failure           |
//! | `store`, `count`  | append an [`ErrorRecord`] to the policy store  |
//! | `stop`, `rethrow` | abort the motor                                |
//! | an integer        | set the result code reported for the cycle     |
//!
//! Handlers never reach other motors. Stopping the whole activity is the controller's call.
use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, CycleExecutionError, DynError};

/// Result code of a cycle that completed without error.
pub const SUCCESS_CODE: i32 = 0;
/// Result code of a handled error when the chain does not set one.
pub const DEFAULT_ERROR_CODE: i32 = 1;

/// Everything known about one finished cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    pub cycle: i64,
    pub op: String,
    pub error: Option<DynError>,
    pub message: Option<String>,
    /// Attempts made, the final one included.
    pub tries: u32,
    /// Wall-clock time of the final attempt.
    pub elapsed: Duration,
}

impl CycleOutcome {
    pub fn success(cycle: i64, op: impl Into<String>, tries: u32, elapsed: Duration) -> Self {
        Self {
            cycle,
            op: op.into(),
            error: None,
            message: None,
            tries,
            elapsed,
        }
    }

    pub fn failure(
        cycle: i64,
        op: impl Into<String>,
        error: DynError,
        tries: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            cycle,
            op: op.into(),
            message: Some(error.to_string()),
            error: Some(error),
            tries,
            elapsed,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_execution_error(&self) -> CycleExecutionError {
        CycleExecutionError {
            cycle: self.cycle,
            op: self.op.clone(),
            tries: self.tries,
            message: self.message.clone().unwrap_or_default(),
        }
    }
}

/// What the handler chain decided about a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDetail {
    pub result_code: i32,
    pub abort: bool,
}

impl Default for ErrorDetail {
    fn default() -> Self {
        Self {
            result_code: DEFAULT_ERROR_CODE,
            abort: false,
        }
    }
}

pub trait ErrorHandler: Send + Sync + fmt::Debug {
    fn handle(&self, outcome: &CycleOutcome, detail: ErrorDetail) -> ErrorDetail;
}

#[derive(Debug, Clone, Copy)]
pub struct LogHandler;

impl ErrorHandler for LogHandler {
    fn handle(&self, outcome: &CycleOutcome, detail: ErrorDetail) -> ErrorDetail {
        tracing::warn!(
            cycle = outcome.cycle,
            op = %outcome.op,
            tries = outcome.tries,
            error = outcome.message.as_deref().unwrap_or_default(),
            "cycle failed, continuing"
        );
        detail
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CodeHandler(pub i32);

impl ErrorHandler for CodeHandler {
    fn handle(&self, _: &CycleOutcome, detail: ErrorDetail) -> ErrorDetail {
        ErrorDetail {
            result_code: self.0,
            ..detail
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreHandler(pub ErrorStore);

impl ErrorHandler for StoreHandler {
    fn handle(&self, outcome: &CycleOutcome, detail: ErrorDetail) -> ErrorDetail {
        self.0.push(ErrorRecord {
            cycle: outcome.cycle,
            op: outcome.op.clone(),
            message: outcome.message.clone().unwrap_or_default(),
            tries: outcome.tries,
            elapsed: outcome.elapsed,
        });
        detail
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RethrowHandler;

impl ErrorHandler for RethrowHandler {
    fn handle(&self, _: &CycleOutcome, detail: ErrorDetail) -> ErrorDetail {
        ErrorDetail {
            abort: true,
            ..detail
        }
    }
}

/// A failure retained by a `store` handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub cycle: i64,
    pub op: String,
    pub message: String,
    pub tries: u32,
    pub elapsed: Duration,
}

/// Shared, append-only list of [`ErrorRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct ErrorStore(Arc<Mutex<Vec<ErrorRecord>>>);

impl ErrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: ErrorRecord) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the records out, in insertion order.
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// An ordered handler chain plus the store its `store` handlers write to.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    handlers: Vec<Arc<dyn ErrorHandler>>,
    store: ErrorStore,
}

impl Default for ErrorPolicy {
    /// Abort the motor on the first error.
    fn default() -> Self {
        Self::rethrow()
    }
}

impl ErrorPolicy {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            store: ErrorStore::new(),
        }
    }

    pub fn log_and_continue(result_code: i32) -> Self {
        Self::new()
            .with(LogHandler)
            .with(CodeHandler(result_code))
    }

    pub fn store_and_continue() -> Self {
        let policy = Self::new();
        let store = policy.store.clone();
        policy.with(StoreHandler(store))
    }

    pub fn rethrow() -> Self {
        Self::new().with(RethrowHandler)
    }

    pub fn with(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn store(&self) -> &ErrorStore {
        &self.store
    }

    pub fn handlers(&self) -> usize {
        self.handlers.len()
    }

    /// Runs the chain over a failed outcome.
    pub fn handle(&self, outcome: &CycleOutcome) -> ErrorDetail {
        self.handlers
            .iter()
            .fold(ErrorDetail::default(), |detail, handler| {
                handler.handle(outcome, detail)
            })
    }
}

impl FromStr for ErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut policy = ErrorPolicy::new();
        for word in s.split(',').map(str::trim).filter(|w| !w.is_empty()) {
            policy = match word.to_ascii_lowercase().as_str() {
                "log" | "warn" => policy.with(LogHandler),
                "store" | "count" => {
                    let store = policy.store.clone();
                    policy.with(StoreHandler(store))
                }
                "stop" | "rethrow" => policy.with(RethrowHandler),
                code => match code.parse::<i32>() {
                    Ok(code) => policy.with(CodeHandler(code)),
                    Err(_) => return Err(ConfigError::UnknownErrorHandler(word.to_string())),
                },
            };
        }
        if policy.handlers.is_empty() {
            return Err(ConfigError::unparsable("errors", s));
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(cycle: i64) -> CycleOutcome {
        CycleOutcome::failure(
            cycle,
            "write",
            "connection reset".into(),
            2,
            Duration::from_millis(3),
        )
    }

    #[test]
    fn log_and_continue_keeps_going_with_sentinel_code() {
        let detail = ErrorPolicy::log_and_continue(42).handle(&failed(7));
        assert_eq!(
            detail,
            ErrorDetail {
                result_code: 42,
                abort: false
            }
        );
    }

    #[test]
    fn store_and_continue_retains_records() {
        let policy = ErrorPolicy::store_and_continue();
        policy.handle(&failed(1));
        policy.handle(&failed(2));

        let records = policy.store().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].cycle, 2);
        assert_eq!(records[1].message, "connection reset");
        assert_eq!(records[1].tries, 2);
        assert!(!policy.handle(&failed(3)).abort);
    }

    #[test]
    fn rethrow_aborts() {
        assert!(ErrorPolicy::rethrow().handle(&failed(0)).abort);
        assert!(ErrorPolicy::default().handle(&failed(0)).abort);
    }

    #[test]
    fn outcome_converts_to_execution_error() {
        let err = failed(9).to_execution_error();
        assert_eq!(
            err.to_string(),
            "cycle 9 (op 'write') failed after 2 tries: connection reset"
        );
    }

    mod parsing {
        use super::*;

        #[test]
        fn composes_chain_in_order() {
            let policy: ErrorPolicy = "warn, count, 17".parse().unwrap();
            assert_eq!(policy.handlers(), 3);
            let detail = policy.handle(&failed(4));
            assert_eq!(detail.result_code, 17);
            assert!(!detail.abort);
            assert_eq!(policy.store().len(), 1);
        }

        #[test]
        fn stop_anywhere_aborts() {
            let policy: ErrorPolicy = "store,stop".parse().unwrap();
            assert!(policy.handle(&failed(4)).abort);
            assert_eq!(policy.store().len(), 1);
        }

        #[test]
        fn rejects_unknown_and_empty_chains() {
            assert!(matches!(
                "log,retry".parse::<ErrorPolicy>(),
                Err(ConfigError::UnknownErrorHandler(h)) if h == "retry"
            ));
            assert!(matches!(
                " , ".parse::<ErrorPolicy>(),
                Err(ConfigError::Unparsable { .. })
            ));
        }
    }
}
