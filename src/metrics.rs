//! Fire-and-forget timing hooks.
//!
//! Motors report how long each phase of a cycle took and how the cycle ended. Sinks are
//! external; the engine only guarantees that a misbehaving sink cannot take an op down
//! with it: every call is isolated with `catch_unwind`.
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::policy::{CycleOutcome, ErrorDetail};

/// A timed section of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Dispatch lookup.
    Resolve,
    /// Waiting on the rate limiter.
    Acquire,
    /// Binding and running the op, retries included.
    Execute,
    /// Execute time plus the scheduling delay reported by the limiter.
    Service,
}

pub trait MetricsSink: Send + Sync {
    fn record_phase(&self, slot: usize, phase: Phase, elapsed: Duration);

    /// `detail` is `None` for successful cycles.
    fn record_outcome(&self, slot: usize, outcome: &CycleOutcome, detail: Option<&ErrorDetail>);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_phase(&self, _: usize, _: Phase, _: Duration) {}

    fn record_outcome(&self, _: usize, _: &CycleOutcome, _: Option<&ErrorDetail>) {}
}

/// Count/total/min/max of one phase. Mergeable, no derived statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl PhaseStats {
    pub fn consume(&mut self, elapsed: Duration) {
        self.min = if self.count == 0 {
            elapsed
        } else {
            self.min.min(elapsed)
        };
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        self.count += 1;
    }

    pub fn merge(&mut self, other: PhaseStats) {
        if other.count == 0 {
            return;
        }
        self.min = if self.count == 0 {
            other.min
        } else {
            self.min.min(other.min)
        };
        self.max = self.max.max(other.max);
        self.total += other.total;
        self.count += other.count;
    }
}

/// In-memory sink keeping [`PhaseStats`] per phase plus outcome counters.
#[derive(Debug, Clone, Default)]
pub struct PhaseRecorder {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Debug, Clone, Default)]
struct Recorded {
    phases: HashMap<Phase, PhaseStats>,
    succeeded: u64,
    failed: u64,
}

impl PhaseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, phase: Phase) -> PhaseStats {
        self.lock().phases.get(&phase).copied().unwrap_or_default()
    }

    /// `(succeeded, failed)` cycle counts.
    pub fn outcomes(&self) -> (u64, u64) {
        let recorded = self.lock();
        (recorded.succeeded, recorded.failed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetricsSink for PhaseRecorder {
    fn record_phase(&self, _: usize, phase: Phase, elapsed: Duration) {
        self.lock().phases.entry(phase).or_default().consume(elapsed);
    }

    fn record_outcome(&self, _: usize, outcome: &CycleOutcome, _: Option<&ErrorDetail>) {
        let mut recorded = self.lock();
        if outcome.is_error() {
            recorded.failed += 1;
        } else {
            recorded.succeeded += 1;
        }
    }
}

/// Wraps a sink so its panics are swallowed. Warns once per activity.
#[derive(Clone)]
pub(crate) struct GuardedMetrics {
    sink: Arc<dyn MetricsSink>,
    warned: Arc<AtomicBool>,
}

impl GuardedMetrics {
    pub(crate) fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn record_phase(&self, slot: usize, phase: Phase, elapsed: Duration) {
        self.guard(|| self.sink.record_phase(slot, phase, elapsed));
    }

    pub(crate) fn record_outcome(
        &self,
        slot: usize,
        outcome: &CycleOutcome,
        detail: Option<&ErrorDetail>,
    ) {
        self.guard(|| self.sink.record_outcome(slot, outcome, detail));
    }

    fn guard(&self, call: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(call)).is_err() && !self.warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!("metrics sink panicked; further sink failures are ignored silently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl MetricsSink for Exploding {
        fn record_phase(&self, _: usize, _: Phase, _: Duration) {
            panic!("sink down");
        }

        fn record_outcome(&self, _: usize, _: &CycleOutcome, _: Option<&ErrorDetail>) {
            panic!("sink down");
        }
    }

    #[test]
    fn guarded_sink_swallows_panics() {
        let guarded = GuardedMetrics::new(Arc::new(Exploding));
        guarded.record_phase(0, Phase::Execute, Duration::from_millis(1));
        guarded.record_outcome(
            0,
            &CycleOutcome::success(1, "read", 1, Duration::ZERO),
            None,
        );
        assert!(guarded.warned.load(Ordering::Relaxed));
    }

    #[test]
    fn recorder_tracks_phases_and_outcomes() {
        let recorder = PhaseRecorder::new();
        recorder.record_phase(0, Phase::Execute, Duration::from_millis(4));
        recorder.record_phase(1, Phase::Execute, Duration::from_millis(2));
        recorder.record_outcome(0, &CycleOutcome::success(0, "read", 1, Duration::ZERO), None);

        let stats = recorder.phase(Phase::Execute);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total, Duration::from_millis(6));
        assert_eq!(stats.min, Duration::from_millis(2));
        assert_eq!(stats.max, Duration::from_millis(4));
        assert_eq!(recorder.phase(Phase::Acquire).count, 0);
        assert_eq!(recorder.outcomes(), (1, 0));
    }

    mod phase_stats {
        use super::*;

        #[test]
        fn merge_is_order_independent() {
            let mut a = PhaseStats::default();
            a.consume(Duration::from_millis(5));
            let mut b = PhaseStats::default();
            b.consume(Duration::from_millis(1));
            b.consume(Duration::from_millis(9));

            let mut ab = a;
            ab.merge(b);
            let mut ba = b;
            ba.merge(a);
            assert_eq!(ab, ba);
            assert_eq!(ab.count, 3);
            assert_eq!(ab.min, Duration::from_millis(1));
        }

        #[test]
        fn merging_empty_keeps_min() {
            let mut a = PhaseStats::default();
            a.consume(Duration::from_millis(5));
            a.merge(PhaseStats::default());
            assert_eq!(a.min, Duration::from_millis(5));
        }
    }
}
