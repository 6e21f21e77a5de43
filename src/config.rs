use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    cycles::{CycleSpan, parse_count},
    error::ConfigError,
    metrics::{MetricsSink, NoopMetrics},
    policy::ErrorPolicy,
    rate::{RateScope, RateSpec},
    sequencer::SequencerKind,
};

/// Graceful-stop window before motors are aborted.
pub const DEFAULT_SHUTDOWN: Duration = Duration::from_secs(5);

/// How many motors to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSpec {
    /// Exactly this many.
    Fixed(i64),
    /// This many per CPU core.
    PerCore(i64),
    /// Ten per CPU core, capped at the cycle count.
    Auto,
}

impl Default for ThreadSpec {
    fn default() -> Self {
        ThreadSpec::Fixed(1)
    }
}

impl ThreadSpec {
    /// Resolves to a motor count for a machine with `cores` cores and a run of `cycles`.
    pub fn resolve(self, cores: usize, cycles: i64) -> Result<usize, ConfigError> {
        let threads = match self {
            ThreadSpec::Fixed(n) if n > 0 => n,
            ThreadSpec::PerCore(n) if n > 0 => n.saturating_mul(cores as i64),
            ThreadSpec::Fixed(n) | ThreadSpec::PerCore(n) => {
                return Err(ConfigError::InvalidThreads(n));
            }
            ThreadSpec::Auto => (cores as i64).saturating_mul(10).min(cycles).max(1),
        };
        if threads > cycles {
            tracing::warn!(
                threads,
                cycles,
                "more threads than cycles; some motors will finish without work"
            );
        }
        usize::try_from(threads).map_err(|_| ConfigError::InvalidThreads(threads))
    }
}

/// Parses `N`, `Nx` (per core) or `auto`.
impl FromStr for ThreadSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ThreadSpec::Auto);
        }
        let (count, per_core) = match s.strip_suffix(['x', 'X']) {
            Some(count) => (count, true),
            None => (s, false),
        };
        let n = parse_count(count).ok_or_else(|| ConfigError::unparsable("threads", s))?;
        if n <= 0 {
            return Err(ConfigError::InvalidThreads(n));
        }
        Ok(if per_core {
            ThreadSpec::PerCore(n)
        } else {
            ThreadSpec::Fixed(n)
        })
    }
}

/// Everything an [`crate::Activity`] needs besides its ops.
#[derive(Clone, TypedBuilder)]
pub struct ActivityConfig {
    /// Name used in logs, limiter names and summaries.
    #[builder(default = "activity".to_string(), setter(into))]
    pub alias: String,
    #[builder(default)]
    pub threads: ThreadSpec,
    /// Cycles to run. `None` runs one full dispatch period.
    #[builder(default, setter(strip_option))]
    pub cycles: Option<CycleSpan>,
    /// Throughput target. `None` runs unthrottled.
    #[builder(default, setter(strip_option))]
    pub rate: Option<RateSpec>,
    #[builder(default)]
    pub sequencer: SequencerKind,
    /// `(name, ratio)` pairs resolved against an `OpRegistry`. Empty selects every
    /// registered op with ratio 1.
    #[builder(default)]
    pub ops: Vec<(String, i64)>,
    #[builder(default)]
    pub errors: ErrorPolicy,
    /// Attempts per cycle before the outcome reaches the error policy.
    #[builder(default = 1)]
    pub max_tries: u32,
    #[builder(default = DEFAULT_SHUTDOWN)]
    pub shutdown: Duration,
    /// Keep motors waiting at the end of the range for `Activity::extend_cycles` instead of
    /// finishing. Such runs end with a stop request.
    #[builder(default)]
    pub open_ended: bool,
    #[builder(default = Arc::new(NoopMetrics))]
    pub metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for ActivityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityConfig")
            .field("alias", &self.alias)
            .field("threads", &self.threads)
            .field("cycles", &self.cycles)
            .field("rate", &self.rate)
            .field("sequencer", &self.sequencer)
            .field("ops", &self.ops)
            .field("errors", &self.errors)
            .field("max_tries", &self.max_tries)
            .field("shutdown", &self.shutdown)
            .field("open_ended", &self.open_ended)
            .finish_non_exhaustive()
    }
}

impl ActivityConfig {
    /// Builds a config from loader-provided `key=value` pairs.
    ///
    /// Unknown keys are logged and ignored. Every recognised key is validated here.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = ActivityConfig::builder().build();
        let mut scope = None;

        for (key, value) in params {
            match key.as_str() {
                "alias" => config.alias = value.trim().to_string(),
                "threads" => config.threads = value.parse()?,
                "cycles" => config.cycles = Some(value.parse()?),
                "rate" | "cyclerate" => config.rate = Some(value.parse()?),
                "ratescope" => scope = Some(value.parse::<RateScope>()?),
                "seq" => config.sequencer = value.parse()?,
                "ops" => config.ops = parse_op_ratios(value)?,
                "errors" => config.errors = value.parse()?,
                "maxtries" => {
                    let tries = parse_count(value)
                        .ok_or_else(|| ConfigError::unparsable(key.as_str(), value.as_str()))?;
                    config.max_tries = u32::try_from(tries)
                        .ok()
                        .filter(|t| *t > 0)
                        .ok_or(ConfigError::InvalidMaxTries(tries))?;
                }
                "shutdown" => {
                    config.shutdown = parse_duration(value)
                        .ok_or_else(|| ConfigError::unparsable(key.as_str(), value.as_str()))?;
                }
                "openended" => {
                    config.open_ended = value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::unparsable(key.as_str(), value.as_str()))?;
                }
                other => tracing::warn!(key = other, "ignoring unknown activity parameter"),
            }
        }

        if let Some(scope) = scope {
            match config.rate {
                Some(rate) => config.rate = Some(rate.with_scope(scope)),
                None => tracing::warn!(?scope, "ratescope given without a rate; ignoring"),
            }
        }
        Ok(config)
    }
}

/// Parses `name[:ratio],...`. A missing ratio means 1.
pub fn parse_op_ratios(s: &str) -> Result<Vec<(String, i64)>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, ratio)) => ratio
                .trim()
                .parse::<i64>()
                .map(|ratio| (name.trim().to_string(), ratio))
                .map_err(|_| ConfigError::unparsable("ops", entry)),
            None => Ok((entry.to_string(), 1)),
        })
        .collect()
}

/// Parses `500ms`, `5s`, `2m`, or a bare number of milliseconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_millis)
    }
}
