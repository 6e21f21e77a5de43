//! The controller: builds an activity from its config, runs one motor per slot and
//! observes them through the shared tally.
//!
//! # Lifecycle
//! 1. [`Activity::new`] validates the config and builds the dispatch table. Invalid input
//!    fails here and nothing is spawned.
//! 2. [`Activity::start`] registers every slot in the tally as `Uninitialized`, creates the
//!    rate limiters and spawns the motors.
//! 3. While running, [`Activity::update_rate_spec`], [`Activity::update_dispatch`] and
//!    [`Activity::request_stop`] can be called from any task.
//! 4. [`Activity::join`] waits for every motor to reach a terminal state, aborts the ones
//!    that do not make it within the timeout, reaps them from the tally and merges their
//!    summaries.
use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ActivityConfig,
    cycles::{CycleRange, CycleSpan},
    error::{ActivityError, ConfigError, StateTransitionError},
    metrics::GuardedMetrics,
    motor::{ActivityMotor, MotorShared, MotorSlot, SharedSlot, lock_slot},
    rate::{RateLimiter, RateScope, RateSpec},
    sequencer::{DispatchTable, OpDefinition, OpRegistry},
    summary::ActivitySummary,
    tally::{RunState, RunStateImage, RunStateTally},
};

struct MotorHandle {
    slot: usize,
    record: SharedSlot,
    task: JoinHandle<RunState>,
}

struct Runtime {
    started_at: Instant,
    cycles: Arc<CycleRange>,
    limiters: Vec<Arc<RateLimiter>>,
    motors: Vec<MotorHandle>,
}

pub struct Activity {
    config: ActivityConfig,
    alias: Arc<str>,
    span: CycleSpan,
    threads: usize,
    dispatch: watch::Sender<Arc<DispatchTable>>,
    rate: Mutex<Option<RateSpec>>,
    tally: Arc<RunStateTally>,
    stop: CancellationToken,
    fault: CancellationToken,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("alias", &self.alias)
            .field("span", &self.span)
            .field("threads", &self.threads)
            .field("tally", &self.tally.snapshot().to_string())
            .finish_non_exhaustive()
    }
}

impl Activity {
    /// Resolves `config.ops` against `registry`; an empty selection takes every registered
    /// op with ratio 1.
    pub fn new(config: ActivityConfig, registry: &OpRegistry) -> Result<Self, ConfigError> {
        let definitions = if config.ops.is_empty() {
            registry.all()
        } else {
            registry.definitions(&config.ops)?
        };
        Self::from_definitions(config, definitions)
    }

    pub fn from_definitions(
        config: ActivityConfig,
        definitions: Vec<OpDefinition>,
    ) -> Result<Self, ConfigError> {
        if config.max_tries == 0 {
            return Err(ConfigError::InvalidMaxTries(0));
        }
        if let Some(rate) = config.rate {
            rate.validated()?;
        }
        let table = DispatchTable::build(definitions, config.sequencer)?;
        let span = match config.cycles {
            Some(span) => span,
            None => CycleSpan::new(0, table.period())?,
        };
        let threads = config.threads.resolve(num_cpus::get(), span.len())?;
        let (dispatch, _) = watch::channel(Arc::new(table));

        info!(
            activity = %config.alias,
            threads,
            cycles = %span,
            rate = ?config.rate.map(|r| r.to_string()),
            "activity configured"
        );
        Ok(Self {
            alias: config.alias.as_str().into(),
            span,
            threads,
            dispatch,
            rate: Mutex::new(config.rate),
            tally: Arc::new(RunStateTally::new()),
            stop: CancellationToken::new(),
            fault: CancellationToken::new(),
            runtime: Mutex::new(None),
            config,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn cycles(&self) -> CycleSpan {
        self.span
    }

    pub fn tally(&self) -> &Arc<RunStateTally> {
        &self.tally
    }

    /// Spawns the motors. Must be called inside a Tokio runtime, at most once.
    pub fn start(&self) -> Result<(), ActivityError> {
        let mut runtime = self.lock_runtime();
        if runtime.is_some() {
            return Err(ActivityError::AlreadyStarted(self.alias.to_string()));
        }

        let rate = *self.rate.lock().unwrap_or_else(|e| e.into_inner());
        let limiters: Vec<Arc<RateLimiter>> = match rate {
            None => Vec::new(),
            Some(spec) if spec.scope() == RateScope::Activity => {
                vec![Arc::new(RateLimiter::new(self.alias.to_string(), spec))]
            }
            Some(spec) => (0..self.threads)
                .map(|slot| Arc::new(RateLimiter::new(format!("{}/{slot}", self.alias), spec)))
                .collect(),
        };

        let cycles = Arc::new(CycleRange::new(self.span));
        let shared = Arc::new(MotorShared {
            activity: self.alias.clone(),
            cycles: cycles.clone(),
            dispatch: self.dispatch.subscribe(),
            tally: self.tally.clone(),
            policy: self.config.errors.clone(),
            metrics: GuardedMetrics::new(self.config.metrics.clone()),
            max_tries: self.config.max_tries,
            open_ended: self.config.open_ended,
            stop: self.stop.clone(),
            fault: self.fault.clone(),
        });

        info!(activity = %self.alias, "Spawning {} motors...", self.threads);
        let mut motors = Vec::with_capacity(self.threads);
        for slot in 0..self.threads {
            self.tally.add(RunState::Uninitialized)?;
            let record = Arc::new(Mutex::new(MotorSlot::new(slot)));
            let limiter = match limiters.len() {
                0 => None,
                1 => limiters.first().cloned(),
                _ => limiters.get(slot).cloned(),
            };
            let motor = ActivityMotor::new(slot, shared.clone(), limiter, record.clone());
            motors.push(MotorHandle {
                slot,
                record,
                task: tokio::spawn(motor.run()),
            });
        }

        *runtime = Some(Runtime {
            started_at: Instant::now(),
            cycles,
            limiters,
            motors,
        });
        info!(activity = %self.alias, "Running activity!");
        Ok(())
    }

    /// Asks every motor to stop after its current cycle. Idempotent.
    pub fn request_stop(&self) {
        if !self.stop.is_cancelled() {
            info!(activity = %self.alias, "stop requested");
            self.stop.cancel();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Waits until every registered motor is `Stopped`, `Finished` or `Errored`.
    pub async fn await_terminal(&self, timeout: Option<Duration>) -> RunStateImage {
        self.tally
            .await_none_other(&RunState::TERMINAL, timeout)
            .await
    }

    /// Replaces the rate spec of a running activity, or the configured one before start.
    ///
    /// The scope is fixed once motors are bound to their limiters.
    pub fn update_rate_spec(&self, spec: RateSpec) -> Result<(), ConfigError> {
        let spec = spec.validated()?;
        let runtime = self.lock_runtime();
        let mut rate = self.rate.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(runtime) = runtime.as_ref() {
            let running = rate.ok_or(ConfigError::RateNotConfigured)?;
            if running.scope() != spec.scope() {
                return Err(ConfigError::RateScopeChange {
                    running: running.scope(),
                    requested: spec.scope(),
                });
            }
            for limiter in &runtime.limiters {
                limiter.apply_rate_spec(spec);
            }
        }
        *rate = Some(spec);
        info!(activity = %self.alias, %spec, "rate spec updated");
        Ok(())
    }

    pub fn rate_spec(&self) -> Option<RateSpec> {
        *self.rate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swaps in a new dispatch table. Cycles already resolved finish with the old one.
    pub fn update_dispatch(&self, definitions: Vec<OpDefinition>) -> Result<(), ConfigError> {
        let kind = self.dispatch.borrow().kind();
        let table = DispatchTable::build(definitions, kind)?;
        info!(
            activity = %self.alias,
            period = table.period(),
            "dispatch table updated"
        );
        self.dispatch.send_replace(Arc::new(table));
        Ok(())
    }

    /// Re-weights the current ops by name. Ops left out are dropped from dispatch.
    pub fn update_ratios(&self, ratios: &[(String, i64)]) -> Result<(), ConfigError> {
        let current = self.dispatch.borrow().clone();
        let definitions = ratios
            .iter()
            .map(|(name, ratio)| {
                current
                    .ops()
                    .iter()
                    .find(|op| &op.name == name)
                    .map(|op| OpDefinition::new(name.clone(), *ratio, op.factory.clone()))
                    .ok_or_else(|| ConfigError::UnknownOp(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.update_dispatch(definitions)
    }

    /// Moves the end of the cycle range forward.
    ///
    /// Fails once every motor is terminal, since nobody would claim the new cycles. In a
    /// bounded run, motors that already found the range exhausted finish regardless; set
    /// `open_ended` to keep them waiting for extensions.
    pub fn extend_cycles(&self, end: i64) -> Result<(), ActivityError> {
        let runtime = self.lock_runtime();
        let runtime = runtime
            .as_ref()
            .filter(|runtime| !runtime.motors.is_empty())
            .ok_or_else(|| ActivityError::NotRunning(self.alias.to_string()))?;
        if self.tally.snapshot().is_none_other(&RunState::TERMINAL) {
            return Err(ActivityError::NotRunning(self.alias.to_string()));
        }
        runtime.cycles.extend_to(end);
        Ok(())
    }

    /// Waits for every motor to reach a terminal state, then reaps them.
    ///
    /// With a timeout, motors still running when it elapses are aborted at their current
    /// await point and reaped as `Stopped`. A tally fault reported by any motor aborts the
    /// whole run and is returned as [`ActivityError::StateTransition`].
    pub async fn join(&self, timeout: Option<Duration>) -> Result<ActivitySummary, ActivityError> {
        let (motors, limiters, started_at) = {
            let mut runtime = self.lock_runtime();
            match runtime.as_mut() {
                Some(runtime) if !runtime.motors.is_empty() => (
                    mem::take(&mut runtime.motors),
                    runtime.limiters.clone(),
                    runtime.started_at,
                ),
                _ => return Err(ActivityError::NotRunning(self.alias.to_string())),
            }
        };

        let mut forced = false;
        tokio::select! {
            image = self.await_terminal(timeout) => {
                if image.is_timeout() {
                    warn!(
                        activity = %self.alias,
                        %image,
                        "motors did not stop within {:?}, aborting",
                        timeout.unwrap_or_default()
                    );
                    forced = true;
                }
            }
            _ = self.fault.cancelled() => {
                error!(activity = %self.alias, "run state fault, aborting all motors");
                forced = true;
            }
        }
        if forced {
            for motor in &motors {
                motor.task.abort();
            }
        }

        info!(activity = %self.alias, "Retrieving data from motors...");
        let mut summary = ActivitySummary::new(self.alias.to_string());
        let mut fault: Option<StateTransitionError> = None;
        for motor in motors {
            let joined = motor.task.await;
            let mut record = lock_slot(&motor.record);
            let state = record.state;
            match joined {
                Err(err) if err.is_panic() => {
                    error!(activity = %self.alias, slot = motor.slot, "motor panicked: {err}");
                    record.summary.final_state = RunState::Errored;
                    record.summary.abort = Some("motor panicked".to_string());
                }
                _ if !state.is_terminal() => {
                    debug!(slot = motor.slot, %state, "reaping aborted motor as stopped");
                    record.summary.final_state = RunState::Stopped;
                    record
                        .summary
                        .abort
                        .get_or_insert_with(|| format!("aborted while {state}"));
                }
                _ => {}
            }
            if let Err(err) = self.tally.remove(state) {
                fault.get_or_insert(err);
            }
            if let Some(err) = record.fault.take() {
                fault.get_or_insert(err);
            }
            summary.consume(record.summary.clone());
        }
        for limiter in &limiters {
            limiter.close();
        }

        if let Some(err) = fault {
            error!(activity = %self.alias, %err, "run aborted");
            return Err(ActivityError::StateTransition(err));
        }

        summary.stored_errors = self.config.errors.store().records();
        summary.elapsed = started_at.elapsed();
        info!(
            activity = %self.alias,
            cycles = summary.cycles,
            errored = summary.errored,
            elapsed = ?summary.elapsed,
            "Done running activity!"
        );
        Ok(summary)
    }

    /// Requests a stop and joins within the configured shutdown window.
    pub async fn stop(&self) -> Result<ActivitySummary, ActivityError> {
        self.request_stop();
        self.join(Some(self.config.shutdown)).await
    }

    /// Starts the activity and waits for it to run to completion.
    pub async fn run(&self) -> Result<ActivitySummary, ActivityError> {
        self.start()?;
        self.join(None).await
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}
