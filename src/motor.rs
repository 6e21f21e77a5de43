//! The per-slot worker loop.
//!
//! An [`ActivityMotor`] owns one concurrency slot of an activity. Each iteration:
//!
//! 1. checks the stop token, moving to `Stopping` then `Stopped` when it is set,
//! 2. claims the next cycle, moving to `Finished` when the range is exhausted (open-ended
//!    runs wait for the range to be extended instead),
//! 3. resolves the op against the current dispatch snapshot and binds it,
//! 4. waits on the rate limiter, if any,
//! 5. runs the op, retrying up to `max_tries`,
//! 6. routes a failure through the error policy, moving to `Errored` on abort.
//!
//! Every state change goes through the motor's [`MotorSlot`] and the shared tally in one
//! step. A tally that refuses a change means the engine's own accounting is broken: the
//! motor records the fault, trips the activity's fault token and exits.
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::FutureExt;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    cycles::CycleRange,
    error::{CycleExecutionError, DynError, StateTransitionError},
    metrics::{GuardedMetrics, Phase},
    policy::{CycleOutcome, ErrorPolicy, SUCCESS_CODE},
    rate::RateLimiter,
    sequencer::{DispatchTable, Op},
    summary::MotorSummary,
    tally::{RunState, RunStateTally},
};

/// Per-worker state handed to every op factory of one motor.
///
/// Holds one value per type, for factories that need connections, buffers or generators
/// that must not be shared between motors.
pub struct WorkerContext {
    activity: Arc<str>,
    slot: usize,
    scratch: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("activity", &self.activity)
            .field("slot", &self.slot)
            .field("scratch", &self.scratch.len())
            .finish()
    }
}

impl WorkerContext {
    pub fn new(activity: impl Into<Arc<str>>, slot: usize) -> Self {
        Self {
            activity: activity.into(),
            slot,
            scratch: HashMap::new(),
        }
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.scratch
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.scratch
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.scratch
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast().ok())
            .map(|previous| *previous)
    }

    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.scratch
            .remove(&TypeId::of::<T>())
            .and_then(|previous| previous.downcast().ok())
            .map(|previous| *previous)
    }
}

/// The part of a motor the controller can still read after the task is gone.
#[derive(Debug)]
pub(crate) struct MotorSlot {
    pub(crate) state: RunState,
    pub(crate) summary: MotorSummary,
    pub(crate) fault: Option<StateTransitionError>,
}

impl MotorSlot {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            state: RunState::Uninitialized,
            summary: MotorSummary::new(slot),
            fault: None,
        }
    }
}

pub(crate) type SharedSlot = Arc<Mutex<MotorSlot>>;

pub(crate) fn lock_slot(slot: &SharedSlot) -> MutexGuard<'_, MotorSlot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// What every motor of one activity shares.
pub(crate) struct MotorShared {
    pub(crate) activity: Arc<str>,
    pub(crate) cycles: Arc<CycleRange>,
    pub(crate) dispatch: watch::Receiver<Arc<DispatchTable>>,
    pub(crate) tally: Arc<RunStateTally>,
    pub(crate) policy: ErrorPolicy,
    pub(crate) metrics: GuardedMetrics,
    pub(crate) max_tries: u32,
    /// Wait for `extend_to` on an exhausted range instead of finishing.
    pub(crate) open_ended: bool,
    /// Cooperative stop, checked between cycles.
    pub(crate) stop: CancellationToken,
    /// Tripped by a motor whose tally accounting failed.
    pub(crate) fault: CancellationToken,
}

enum Step {
    Continue,
    Abort(CycleExecutionError),
    LimiterClosed,
}

pub struct ActivityMotor {
    slot: usize,
    shared: Arc<MotorShared>,
    limiter: Option<Arc<RateLimiter>>,
    record: SharedSlot,
    ctx: WorkerContext,
}

impl fmt::Debug for ActivityMotor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityMotor")
            .field("activity", &self.shared.activity)
            .field("slot", &self.slot)
            .field("limited", &self.limiter.is_some())
            .finish()
    }
}

impl ActivityMotor {
    /// The slot must already be registered in the tally as `Uninitialized`.
    pub(crate) fn new(
        slot: usize,
        shared: Arc<MotorShared>,
        limiter: Option<Arc<RateLimiter>>,
        record: SharedSlot,
    ) -> Self {
        let ctx = WorkerContext::new(shared.activity.clone(), slot);
        Self {
            slot,
            shared,
            limiter,
            record,
            ctx,
        }
    }

    /// Runs until the range is exhausted, a stop is requested, or the policy aborts.
    pub async fn run(mut self) -> RunState {
        match self.drive().await {
            Ok(state) => {
                debug!(activity = %self.shared.activity, slot = self.slot, %state, "motor exited");
                state
            }
            Err(fault) => {
                error!(
                    activity = %self.shared.activity,
                    slot = self.slot,
                    %fault,
                    "run state accounting failed"
                );
                let mut record = lock_slot(&self.record);
                record.fault = Some(fault);
                self.shared.fault.cancel();
                record.state
            }
        }
    }

    async fn drive(&mut self) -> Result<RunState, StateTransitionError> {
        self.transition(RunState::Starting)?;
        if self.shared.stop.is_cancelled() {
            return self.stop_now();
        }
        self.transition(RunState::Running)?;

        loop {
            if self.shared.stop.is_cancelled() {
                return self.stop_now();
            }
            let Some(cycle) = self.shared.cycles.claim() else {
                if self.shared.open_ended {
                    trace!(slot = self.slot, "range exhausted, waiting for more cycles");
                    tokio::select! {
                        _ = self.shared.cycles.wait_for_more() => {}
                        _ = self.shared.stop.cancelled() => {}
                    }
                    continue;
                }
                self.transition(RunState::Finished)?;
                return Ok(RunState::Finished);
            };
            match self.run_cycle(cycle).await {
                Step::Continue => {}
                Step::LimiterClosed => {
                    debug!(slot = self.slot, cycle, "rate limiter closed, abandoning cycle");
                    return self.stop_now();
                }
                Step::Abort(err) => {
                    error!(activity = %self.shared.activity, slot = self.slot, %err, "motor aborted");
                    lock_slot(&self.record).summary.abort = Some(err.to_string());
                    self.transition(RunState::Errored)?;
                    return Ok(RunState::Errored);
                }
            }
        }
    }

    fn stop_now(&mut self) -> Result<RunState, StateTransitionError> {
        self.transition(RunState::Stopping)?;
        self.transition(RunState::Stopped)?;
        Ok(RunState::Stopped)
    }

    fn transition(&self, to: RunState) -> Result<(), StateTransitionError> {
        let mut record = lock_slot(&self.record);
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(StateTransitionError::Illegal { from, to });
        }
        self.shared.tally.change(from, to)?;
        record.state = to;
        record.summary.final_state = to;
        debug!(slot = self.slot, %from, %to, "motor transition");
        Ok(())
    }

    async fn run_cycle(&mut self, cycle: i64) -> Step {
        let metrics = &self.shared.metrics;

        let resolve_start = Instant::now();
        let (name, factory) = {
            let table = self.shared.dispatch.borrow().clone();
            let op = table.resolve(cycle);
            (op.name.clone(), op.factory.clone())
        };
        metrics.record_phase(self.slot, Phase::Resolve, resolve_start.elapsed());

        let delay = match &self.limiter {
            Some(limiter) => {
                let acquire_start = Instant::now();
                match limiter.acquire().await {
                    Ok(delay) => {
                        metrics.record_phase(self.slot, Phase::Acquire, acquire_start.elapsed());
                        delay
                    }
                    Err(_) => return Step::LimiterClosed,
                }
            }
            None => Duration::ZERO,
        };

        let execute_start = Instant::now();
        let mut tries = 0;
        let outcome = loop {
            tries += 1;
            let attempt_start = Instant::now();
            let bound = catch_unwind(AssertUnwindSafe(|| factory.bind(cycle, &mut self.ctx)))
                .unwrap_or_else(|panic| Err(panic_error(panic)));
            let result = match bound {
                Ok(op) => execute(op).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    break CycleOutcome::success(cycle, &name, tries, attempt_start.elapsed());
                }
                Err(err) if tries < self.shared.max_tries => {
                    trace!(slot = self.slot, cycle, tries, %err, "retrying cycle");
                }
                Err(err) => {
                    break CycleOutcome::failure(cycle, &name, err, tries, attempt_start.elapsed());
                }
            }
        };
        let executed = execute_start.elapsed();
        let service = executed + delay;
        metrics.record_phase(self.slot, Phase::Execute, executed);
        metrics.record_phase(self.slot, Phase::Service, service);

        if !outcome.is_error() {
            trace!(slot = self.slot, cycle, op = %name, "cycle complete");
            metrics.record_outcome(self.slot, &outcome, None);
            lock_slot(&self.record)
                .summary
                .record(SUCCESS_CODE, false, tries, service);
            return Step::Continue;
        }

        let detail = self.shared.policy.handle(&outcome);
        metrics.record_outcome(self.slot, &outcome, Some(&detail));
        lock_slot(&self.record)
            .summary
            .record(detail.result_code, true, tries, service);
        if detail.abort {
            Step::Abort(outcome.to_execution_error())
        } else {
            Step::Continue
        }
    }
}

/// Runs an op, turning a panic into an ordinary op error.
async fn execute(op: Op) -> Result<(), DynError> {
    match AssertUnwindSafe(op).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic)),
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> DynError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    error!(%message, "op panicked");
    format!("op panicked: {message}").into()
}
