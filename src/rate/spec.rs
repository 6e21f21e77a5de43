use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default tolerated catch-up speed, as a multiple of the target rate.
pub const DEFAULT_BURST_RATIO: f64 = 1.1;

/// Whether one limiter paces the whole activity or each motor gets its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateScope {
    /// One limiter shared by all motors; the target is the aggregate rate.
    #[default]
    Activity,
    /// One limiter per motor; the aggregate is `rate × threads`.
    Thread,
}

impl FromStr for RateScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activity" | "shared" => Ok(RateScope::Activity),
            "thread" | "motor" => Ok(RateScope::Thread),
            other => Err(ConfigError::UnknownRateScope(other.to_string())),
        }
    }
}

/// Immutable rate configuration. Limiters replace their spec wholesale, never in place.
///
/// Deserialisation goes through the same checks as [`RateSpec::new`] and
/// [`RateSpec::with_burst`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateSpec")]
pub struct RateSpec {
    ops_per_sec: f64,
    burst: f64,
    scope: RateScope,
}

impl RateSpec {
    pub fn new(ops_per_sec: f64) -> Result<Self, ConfigError> {
        if !(ops_per_sec.is_finite() && ops_per_sec > 0.0) {
            return Err(ConfigError::NonPositiveRate(ops_per_sec));
        }
        Ok(Self {
            ops_per_sec,
            burst: DEFAULT_BURST_RATIO,
            scope: RateScope::Activity,
        })
    }

    pub fn with_burst(self, burst: f64) -> Result<Self, ConfigError> {
        if !(burst.is_finite() && burst >= 1.0) {
            return Err(ConfigError::InvalidBurst(burst));
        }
        Ok(Self { burst, ..self })
    }

    pub fn with_scope(self, scope: RateScope) -> Self {
        Self { scope, ..self }
    }

    /// Re-runs the constructor checks.
    pub fn validated(self) -> Result<Self, ConfigError> {
        Ok(RateSpec::new(self.ops_per_sec)?
            .with_burst(self.burst)?
            .with_scope(self.scope))
    }

    pub fn ops_per_sec(&self) -> f64 {
        self.ops_per_sec
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    pub fn scope(&self) -> RateScope {
        self.scope
    }

    /// The resolution at which this rate is metered.
    pub fn unit(&self) -> TickUnit {
        TickUnit::for_rate(self.ops_per_sec)
    }

    /// Ticks of [`Self::unit`] that one op costs.
    pub fn ticks_per_op(&self) -> u32 {
        let ticks = self.unit().ticks_per_second() as f64 / self.ops_per_sec;
        ticks.round().clamp(1.0, u32::MAX as f64) as u32
    }
}

#[derive(Deserialize)]
struct RawRateSpec {
    ops_per_sec: f64,
    #[serde(default = "default_burst")]
    burst: f64,
    #[serde(default)]
    scope: RateScope,
}

fn default_burst() -> f64 {
    DEFAULT_BURST_RATIO
}

impl TryFrom<RawRateSpec> for RateSpec {
    type Error = ConfigError;

    fn try_from(raw: RawRateSpec) -> Result<Self, Self::Error> {
        Ok(RateSpec::new(raw.ops_per_sec)?
            .with_burst(raw.burst)?
            .with_scope(raw.scope))
    }
}

/// Parses `OPS` or `OPS,BURST`. Separators `,`, `:` and `;` are accepted.
impl FromStr for RateSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([',', ':', ';']).map(str::trim).collect();
        let parse = |v: &str| {
            v.parse::<f64>()
                .map_err(|_| ConfigError::unparsable("rate", s))
        };
        match parts.as_slice() {
            [rate] => RateSpec::new(parse(rate)?),
            [rate, burst] => RateSpec::new(parse(rate)?)?.with_burst(parse(burst)?),
            _ => Err(ConfigError::unparsable("rate", s)),
        }
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ rate: {:.3}/s, burst: {:.3} ({:.3}/s), scope: {:?} }}",
            self.ops_per_sec,
            self.burst,
            self.ops_per_sec * self.burst,
            self.scope
        )
    }
}

/// Time base for limiter pools.
///
/// Permits are requested in `u32` chunks, so slow rates meter in coarser units to keep one
/// op's worth of time representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickUnit {
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl TickUnit {
    pub fn for_rate(ops_per_sec: f64) -> Self {
        if ops_per_sec > 1.0 {
            TickUnit::Nanos
        } else if ops_per_sec > 0.001 {
            TickUnit::Micros
        } else if ops_per_sec > 0.000_001 {
            TickUnit::Millis
        } else {
            TickUnit::Seconds
        }
    }

    pub fn nanos_per_tick(self) -> u64 {
        match self {
            TickUnit::Nanos => 1,
            TickUnit::Micros => 1_000,
            TickUnit::Millis => 1_000_000,
            TickUnit::Seconds => 1_000_000_000,
        }
    }

    pub fn ticks_per_second(self) -> u64 {
        1_000_000_000 / self.nanos_per_tick()
    }

    pub fn nanos_to_ticks(self, nanos: u64) -> u64 {
        nanos / self.nanos_per_tick()
    }

    pub fn ticks_to_nanos(self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.nanos_per_tick())
    }
}
