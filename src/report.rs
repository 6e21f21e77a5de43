use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Write,
    sync::Mutex,
    time::Duration,
};

use crate::{error::DynError, policy::SUCCESS_CODE, summary::ActivitySummary, tally::RunState};

/// The derived view of an [`ActivitySummary`].
///
/// A [`RunReport`] is a pure data structure: it holds ratios and means computed from a
/// finished run and does no I/O. Feed it to a [`Reporter`] to display or export it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub activity: String,
    pub cycles: u64,
    pub errored: u64,
    pub retries: u64,
    /// Percentage of cycles that ended with an error.
    pub error_ratio: f64,
    /// Mean of execute time plus scheduling delay.
    pub mean_service_time: Duration,
    /// Cycles per second of wall-clock time.
    pub throughput: f64,
    pub elapsed: Duration,
    pub result_codes: BTreeMap<i32, u64>,
    pub final_states: BTreeMap<RunState, u64>,
    pub stored_errors: usize,
    /// Abort reasons by motor slot.
    pub aborts: BTreeMap<usize, String>,
}

impl RunReport {
    /// Whether every cycle succeeded and no motor ended in `Errored`.
    pub fn is_clean(&self) -> bool {
        self.errored == 0 && !self.final_states.contains_key(&RunState::Errored)
    }

    pub fn succeeded(&self) -> u64 {
        self.result_codes.get(&SUCCESS_CODE).copied().unwrap_or(0)
    }
}

impl From<ActivitySummary> for RunReport {
    fn from(value: ActivitySummary) -> Self {
        let mean_service_time = if value.cycles == 0 {
            Duration::ZERO
        } else {
            u64::try_from(value.service_time.as_nanos() / u128::from(value.cycles))
                .map(Duration::from_nanos)
                .unwrap_or(Duration::MAX)
        };
        let error_ratio = if value.cycles == 0 {
            0.0
        } else {
            (value.errored as f64 / value.cycles as f64) * 100.0
        };
        let secs = value.elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            value.cycles as f64 / secs
        } else {
            0.0
        };
        let aborts = value
            .motors
            .iter()
            .filter_map(|m| m.abort.clone().map(|reason| (m.slot, reason)))
            .collect();

        Self {
            activity: value.activity,
            cycles: value.cycles,
            errored: value.errored,
            retries: value.retries,
            error_ratio,
            mean_service_time,
            throughput,
            elapsed: value.elapsed,
            result_codes: value.result_codes,
            final_states: value.final_states,
            stored_errors: value.stored_errors.len(),
            aborts,
        }
    }
}

#[async_trait]
pub trait Reporter {
    async fn report(&self, report: &RunReport) -> Result<(), DynError>;
}

/// Prints the report to stdout as pretty JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, report: &RunReport) -> Result<(), DynError> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}

/// Writes one JSON document per report, newline-terminated.
#[derive(Debug)]
pub struct JsonReporter<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<W: Write + Send> Reporter for JsonReporter<W> {
    async fn report(&self, report: &RunReport) -> Result<(), DynError> {
        let value = serde_json::to_string(report)?;
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(out, "{value}")?;
        out.flush()?;
        Ok(())
    }
}
