//! Deterministic weighted op dispatch.
//!
//! A [`DispatchTable`] maps every cycle to one [`OpDefinition`] as a pure function of the
//! cycle number and the table. Two layouts are available:
//!
//! - [`SequencerKind::Bucket`]: ops occupy contiguous runs of the period, in declaration
//!   order. Ratios `A:1, B:1, C:2` give `A B C C`.
//! - [`SequencerKind::Interleaved`]: repeated ops are spread across the period. The same
//!   ratios give `A C B C`.
//!
//! Both layouts have a period equal to the sum of the ratios.
use std::{collections::HashMap, fmt, future::Future, str::FromStr, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    error::{ConfigError, DynError},
    motor::WorkerContext,
};

/// Largest interleaved period; the layout is materialised slot by slot.
pub const MAX_INTERLEAVED_PERIOD: i64 = 1 << 24;
/// Largest `period × ops` an interleaved layout may cost to build.
pub const MAX_INTERLEAVED_WORK: i64 = 1 << 26;

/// A bound, ready-to-run unit of work.
pub type Op = BoxFuture<'static, Result<(), DynError>>;

/// Binds a cycle to a concrete [`Op`].
///
/// Binding happens on the motor, with that motor's [`WorkerContext`], so factories can
/// keep per-worker state without thread-locals.
pub trait OpFactory: Send + Sync {
    fn bind(&self, cycle: i64, ctx: &mut WorkerContext) -> Result<Op, DynError>;
}

struct FnFactory<F>(F);

impl<F, Fut> OpFactory for FnFactory<F>
where
    F: Fn(i64, &mut WorkerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DynError>> + Send + 'static,
{
    fn bind(&self, cycle: i64, ctx: &mut WorkerContext) -> Result<Op, DynError> {
        Ok(Box::pin((self.0)(cycle, ctx)))
    }
}

/// Wraps an async closure as an [`OpFactory`].
pub fn op_fn<F, Fut>(f: F) -> Arc<dyn OpFactory>
where
    F: Fn(i64, &mut WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DynError>> + Send + 'static,
{
    Arc::new(FnFactory(f))
}

#[derive(Clone)]
pub struct OpDefinition {
    pub name: String,
    pub ratio: i64,
    pub factory: Arc<dyn OpFactory>,
}

impl OpDefinition {
    pub fn new(name: impl Into<String>, ratio: i64, factory: Arc<dyn OpFactory>) -> Self {
        Self {
            name: name.into(),
            ratio,
            factory,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, ratio: i64, f: F) -> Self
    where
        F: Fn(i64, &mut WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        Self::new(name, ratio, op_fn(f))
    }
}

impl fmt::Debug for OpDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDefinition")
            .field("name", &self.name)
            .field("ratio", &self.ratio)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequencerKind {
    #[default]
    Bucket,
    Interleaved,
}

impl FromStr for SequencerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bucket" => Ok(SequencerKind::Bucket),
            "interleaved" | "interval" => Ok(SequencerKind::Interleaved),
            other => Err(ConfigError::UnknownSequencer(other.to_string())),
        }
    }
}

#[derive(Debug)]
enum Layout {
    /// Exclusive cumulative end of each op's run.
    Bucket(Vec<i64>),
    /// Op index for every slot of the period.
    Interleaved(Vec<u32>),
}

/// Immutable cycle-to-op mapping. Rebuild and swap to reconfigure.
#[derive(Debug)]
pub struct DispatchTable {
    ops: Vec<OpDefinition>,
    kind: SequencerKind,
    period: i64,
    layout: Layout,
}

impl DispatchTable {
    pub fn build(ops: Vec<OpDefinition>, kind: SequencerKind) -> Result<Self, ConfigError> {
        if ops.is_empty() {
            return Err(ConfigError::EmptyOpSet);
        }
        let mut ends = Vec::with_capacity(ops.len());
        let mut period: i64 = 0;
        for op in &ops {
            if op.ratio <= 0 {
                return Err(ConfigError::NonPositiveRatio {
                    op: op.name.clone(),
                    ratio: op.ratio,
                });
            }
            period = period
                .checked_add(op.ratio)
                .ok_or(ConfigError::WeightOverflow)?;
            ends.push(period);
        }

        let layout = match kind {
            SequencerKind::Bucket => Layout::Bucket(ends),
            SequencerKind::Interleaved => {
                let limit = interleaved_limit(ops.len());
                if period > limit {
                    return Err(ConfigError::PeriodTooLarge { period, limit });
                }
                let ratios: Vec<i64> = ops.iter().map(|op| op.ratio).collect();
                Layout::Interleaved(interleave(&ratios, period))
            }
        };

        tracing::debug!(
            ops = ops.len(),
            period,
            ?kind,
            "built dispatch table"
        );
        Ok(Self {
            ops,
            kind,
            period,
            layout,
        })
    }

    /// Index of the op that runs `cycle`. Negative cycles wrap like positive ones.
    pub fn resolve_index(&self, cycle: i64) -> usize {
        let position = cycle.rem_euclid(self.period);
        match &self.layout {
            Layout::Bucket(ends) => ends.partition_point(|&end| end <= position),
            Layout::Interleaved(slots) => slots[position as usize] as usize,
        }
    }

    pub fn resolve(&self, cycle: i64) -> &OpDefinition {
        &self.ops[self.resolve_index(cycle)]
    }

    /// Sum of all ratios; the cycle distance after which dispatch repeats.
    pub fn period(&self) -> i64 {
        self.period
    }

    pub fn kind(&self) -> SequencerKind {
        self.kind
    }

    pub fn ops(&self) -> &[OpDefinition] {
        &self.ops
    }
}

/// Longest interleaved period allowed for `ops` ops. Every slot scans every op.
fn interleaved_limit(ops: usize) -> i64 {
    let ops = i64::try_from(ops).unwrap_or(i64::MAX).max(1);
    MAX_INTERLEAVED_PERIOD.min(MAX_INTERLEAVED_WORK / ops)
}

/// Lays out `period` slots so each op appears exactly `ratio` times, spread evenly.
///
/// Slot `s` goes to the op that is furthest behind its fair share, `ratio * s / period`,
/// with ties going to the lowest index. An op at its quota always lags by a negative
/// amount while the lags sum to zero, so quotas are never exceeded.
fn interleave(ratios: &[i64], period: i64) -> Vec<u32> {
    let mut counts = vec![0i64; ratios.len()];
    let mut slots = Vec::with_capacity(period as usize);
    for s in 0..period {
        let mut best = 0usize;
        let mut best_lag = i128::MIN;
        for (i, (&ratio, &count)) in ratios.iter().zip(&counts).enumerate() {
            let lag = ratio as i128 * s as i128 - count as i128 * period as i128;
            if lag > best_lag {
                best = i;
                best_lag = lag;
            }
        }
        counts[best] += 1;
        slots.push(best as u32);
    }
    slots
}

/// Named op factories, resolved once when an activity is built.
#[derive(Clone, Default)]
pub struct OpRegistry {
    factories: HashMap<String, Arc<dyn OpFactory>>,
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("ops", &self.names())
            .finish()
    }
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn OpFactory>) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(i64, &mut WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        self.register(name, op_fn(f))
    }

    /// Sorted names of every registered op.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Binds `(name, ratio)` pairs to registered factories, keeping the given order.
    pub fn definitions(&self, ratios: &[(String, i64)]) -> Result<Vec<OpDefinition>, ConfigError> {
        ratios
            .iter()
            .map(|(name, ratio)| {
                self.factories
                    .get(name)
                    .map(|factory| OpDefinition::new(name.clone(), *ratio, factory.clone()))
                    .ok_or_else(|| ConfigError::UnknownOp(name.clone()))
            })
            .collect()
    }

    /// Every registered op with ratio 1, in name order.
    pub fn all(&self) -> Vec<OpDefinition> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                self.factories
                    .get(name)
                    .map(|factory| OpDefinition::new(name, 1, factory.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, ratio: i64) -> OpDefinition {
        OpDefinition::from_fn(name, ratio, |_, _| async { Ok(()) })
    }

    fn abcc() -> Vec<OpDefinition> {
        vec![noop("A", 1), noop("B", 1), noop("C", 2)]
    }

    fn names(table: &DispatchTable, cycles: std::ops::Range<i64>) -> Vec<&str> {
        cycles.map(|c| table.resolve(c).name.as_str()).collect()
    }

    mod bucket {
        use super::*;

        #[test]
        fn contiguous_runs_in_declaration_order() {
            let table = DispatchTable::build(abcc(), SequencerKind::Bucket).unwrap();
            assert_eq!(table.period(), 4);
            assert_eq!(names(&table, 0..8), ["A", "B", "C", "C", "A", "B", "C", "C"]);
            assert_eq!(table.resolve(7).name, "C");
        }

        #[test]
        fn negative_cycles_wrap() {
            let table = DispatchTable::build(abcc(), SequencerKind::Bucket).unwrap();
            assert_eq!(table.resolve(-1).name, "C");
            assert_eq!(table.resolve(-4).name, "A");
        }
    }

    mod interleaved {
        use super::*;

        #[test]
        fn spreads_dominant_op() {
            let table = DispatchTable::build(abcc(), SequencerKind::Interleaved).unwrap();
            assert_eq!(table.period(), 4);
            assert_eq!(names(&table, 0..4), ["A", "C", "B", "C"]);
        }

        #[test]
        fn never_repeats_when_avoidable() {
            let ops = vec![noop("read", 3), noop("write", 3)];
            let table = DispatchTable::build(ops, SequencerKind::Interleaved).unwrap();
            assert_eq!(
                names(&table, 0..6),
                ["read", "write", "read", "write", "read", "write"]
            );
        }

        #[test]
        fn rejects_huge_periods() {
            let ops = vec![noop("a", MAX_INTERLEAVED_PERIOD), noop("b", 1)];
            assert_eq!(
                DispatchTable::build(ops, SequencerKind::Interleaved).unwrap_err(),
                ConfigError::PeriodTooLarge {
                    period: MAX_INTERLEAVED_PERIOD + 1,
                    limit: MAX_INTERLEAVED_PERIOD
                }
            );
        }

        #[test]
        fn limit_shrinks_with_op_count() {
            let many: Vec<OpDefinition> = (0..4096)
                .map(|i| noop(&format!("op{i}"), 4096))
                .collect();
            assert_eq!(
                DispatchTable::build(many.clone(), SequencerKind::Interleaved).unwrap_err(),
                ConfigError::PeriodTooLarge {
                    period: 4096 * 4096,
                    limit: MAX_INTERLEAVED_WORK / 4096
                }
            );
            let bucket = DispatchTable::build(many, SequencerKind::Bucket).unwrap();
            assert_eq!(bucket.period(), 4096 * 4096);
        }

        #[test]
        fn many_small_ops_fit() {
            let ops: Vec<OpDefinition> = (0..1000).map(|i| noop(&format!("op{i}"), 10)).collect();
            let table = DispatchTable::build(ops, SequencerKind::Interleaved).unwrap();
            let mut seen = vec![0; 1000];
            for cycle in 0..table.period() {
                seen[table.resolve_index(cycle)] += 1;
            }
            assert!(seen.iter().all(|&n| n == 10));
        }
    }

    #[test]
    fn frequencies_match_ratios() {
        let ops = vec![noop("a", 5), noop("b", 3), noop("c", 2)];
        for kind in [SequencerKind::Bucket, SequencerKind::Interleaved] {
            let table = DispatchTable::build(ops.clone(), kind).unwrap();
            let mut seen = [0i64; 3];
            for cycle in 0..table.period() * 1_000 {
                seen[table.resolve_index(cycle)] += 1;
            }
            assert_eq!(seen, [5_000, 3_000, 2_000], "{kind:?}");
        }
    }

    #[test]
    fn invalid_definitions_fail_at_build() {
        assert_eq!(
            DispatchTable::build(vec![], SequencerKind::Bucket).unwrap_err(),
            ConfigError::EmptyOpSet
        );
        assert_eq!(
            DispatchTable::build(vec![noop("a", 1), noop("b", 0)], SequencerKind::Bucket)
                .unwrap_err(),
            ConfigError::NonPositiveRatio {
                op: "b".into(),
                ratio: 0
            }
        );
        assert_eq!(
            DispatchTable::build(vec![noop("a", i64::MAX), noop("b", 1)], SequencerKind::Bucket)
                .unwrap_err(),
            ConfigError::WeightOverflow
        );
    }

    #[test]
    fn resolution_is_identical_across_threads() {
        let table = DispatchTable::build(abcc(), SequencerKind::Interleaved).unwrap();
        let expected: Vec<usize> = (0..10_000).map(|c| table.resolve_index(c)).collect();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let seen: Vec<usize> = (0..10_000).map(|c| table.resolve_index(c)).collect();
                    assert_eq!(seen, expected);
                });
            }
        });
    }

    #[test]
    fn sequencer_names_parse() {
        assert_eq!("bucket".parse::<SequencerKind>(), Ok(SequencerKind::Bucket));
        assert_eq!("interval".parse::<SequencerKind>(), Ok(SequencerKind::Interleaved));
        assert_eq!(
            "random".parse::<SequencerKind>(),
            Err(ConfigError::UnknownSequencer("random".into()))
        );
    }

    mod registry {
        use super::*;

        #[test]
        fn binds_names_in_requested_order() {
            let mut registry = OpRegistry::new();
            registry
                .register_fn("read", |_, _| async { Ok(()) })
                .register_fn("write", |_, _| async { Ok(()) });

            let defs = registry
                .definitions(&[("write".into(), 2), ("read".into(), 1)])
                .unwrap();
            let got: Vec<(&str, i64)> = defs.iter().map(|d| (d.name.as_str(), d.ratio)).collect();
            assert_eq!(got, [("write", 2), ("read", 1)]);
            assert_eq!(registry.all().len(), 2);
        }

        #[test]
        fn unknown_names_are_config_errors() {
            let registry = OpRegistry::new();
            assert_eq!(
                registry.definitions(&[("scan".into(), 1)]).unwrap_err(),
                ConfigError::UnknownOp("scan".into())
            );
        }
    }
}
