//! Mergeable run accounting.
//!
//! Each motor fills in its own [`MotorSummary`]; the controller merges them into an
//! [`ActivitySummary`] once the motors are reaped. Merging is associative and commutative,
//! so the join order of motors does not matter. Derived figures (ratios, means) live in
//! [`crate::report::RunReport`].
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{policy::ErrorRecord, tally::RunState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorSummary {
    pub slot: usize,
    pub final_state: RunState,
    /// Cycles executed to completion, failed ones included.
    pub cycles: u64,
    pub errored: u64,
    /// Extra attempts beyond the first, summed over all cycles.
    pub retries: u64,
    pub result_codes: BTreeMap<i32, u64>,
    /// Execute time plus scheduling delay, summed over all cycles.
    pub service_time: Duration,
    /// Why the motor stopped early, if it did.
    pub abort: Option<String>,
}

impl MotorSummary {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            final_state: RunState::Uninitialized,
            cycles: 0,
            errored: 0,
            retries: 0,
            result_codes: BTreeMap::new(),
            service_time: Duration::ZERO,
            abort: None,
        }
    }

    pub fn record(&mut self, result_code: i32, errored: bool, tries: u32, service: Duration) {
        self.cycles += 1;
        if errored {
            self.errored += 1;
        }
        self.retries += u64::from(tries.saturating_sub(1));
        *self.result_codes.entry(result_code).or_default() += 1;
        self.service_time += service;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub activity: String,
    pub cycles: u64,
    pub errored: u64,
    pub retries: u64,
    pub result_codes: BTreeMap<i32, u64>,
    pub service_time: Duration,
    /// How many motors ended in each state.
    pub final_states: BTreeMap<RunState, u64>,
    pub motors: Vec<MotorSummary>,
    /// Records kept by `store` error handlers.
    pub stored_errors: Vec<ErrorRecord>,
    /// Wall-clock time from start to join.
    pub elapsed: Duration,
}

impl ActivitySummary {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            cycles: 0,
            errored: 0,
            retries: 0,
            result_codes: BTreeMap::new(),
            service_time: Duration::ZERO,
            final_states: BTreeMap::new(),
            motors: Vec::new(),
            stored_errors: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn consume(&mut self, motor: MotorSummary) {
        self.cycles += motor.cycles;
        self.errored += motor.errored;
        self.retries += motor.retries;
        for (code, count) in &motor.result_codes {
            *self.result_codes.entry(*code).or_default() += count;
        }
        self.service_time += motor.service_time;
        *self.final_states.entry(motor.final_state).or_default() += 1;
        let at = self.motors.partition_point(|m| m.slot < motor.slot);
        self.motors.insert(at, motor);
    }

    pub fn merge(&mut self, other: ActivitySummary) {
        for motor in other.motors {
            self.consume(motor);
        }
        self.stored_errors.extend(other.stored_errors);
        self.stored_errors.sort_by_key(|r| r.cycle);
        self.elapsed = self.elapsed.max(other.elapsed);
    }

    /// The most advanced final state any motor reached.
    pub fn max_state(&self) -> Option<RunState> {
        self.final_states.keys().next_back().copied()
    }

    pub fn count_in(&self, state: RunState) -> u64 {
        self.final_states.get(&state).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor(slot: usize, state: RunState, cycles: u64, errored: u64) -> MotorSummary {
        let mut summary = MotorSummary::new(slot);
        for i in 0..cycles {
            let failed = i < errored;
            summary.record(if failed { 1 } else { 0 }, failed, 1, Duration::from_millis(2));
        }
        summary.final_state = state;
        summary
    }

    #[test]
    fn record_counts_codes_and_retries() {
        let mut summary = MotorSummary::new(0);
        summary.record(0, false, 1, Duration::from_millis(1));
        summary.record(7, true, 3, Duration::from_millis(2));
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.result_codes, BTreeMap::from([(0, 1), (7, 1)]));
        assert_eq!(summary.service_time, Duration::from_millis(3));
    }

    #[test]
    fn merge_is_order_independent() {
        let a = motor(0, RunState::Finished, 10, 1);
        let b = motor(1, RunState::Errored, 3, 1);

        let mut ab = ActivitySummary::new("x");
        ab.consume(a.clone());
        ab.consume(b.clone());
        let mut ba = ActivitySummary::new("x");
        ba.consume(b);
        ba.consume(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.cycles, 13);
        assert_eq!(ab.errored, 2);
        assert_eq!(ab.count_in(RunState::Finished), 1);
        assert_eq!(ab.max_state(), Some(RunState::Errored));
        assert_eq!(ab.motors[0].slot, 0);
    }

    #[test]
    fn serializes_states_as_map_keys() {
        let mut summary = ActivitySummary::new("json");
        summary.consume(motor(0, RunState::Stopped, 1, 0));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["final_states"]["Stopped"], 1);
        assert_eq!(json["cycles"], 1);
    }
}
