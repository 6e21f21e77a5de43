//! The shared cycle cursor.
//!
//! Every motor of an activity claims cycles from one [`CycleRange`]. Claims use a
//! `compare_exchange` loop rather than a blind `fetch_add`: the cursor never moves past
//! `end`, so extending the range of an open-ended run never skips cycles that an
//! exhausted claim would otherwise have burned.
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::ConfigError;

/// A half-open span of cycles, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSpan {
    pub start: i64,
    pub end: i64,
}

impl CycleSpan {
    pub fn new(start: i64, end: i64) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::InvalidCycleRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of cycles in the span, saturating at `i64::MAX`.
    pub fn len(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for CycleSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Parses `END` or `START..END`. Counts accept `K`, `M` and `B` suffixes.
impl FromStr for CycleSpan {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (start, end) = match s.split_once("..") {
            Some((start, end)) => (parse_count(start), parse_count(end)),
            None => (Some(0), parse_count(s)),
        };
        match (start, end) {
            (Some(start), Some(end)) => CycleSpan::new(start, end),
            _ => Err(ConfigError::unparsable("cycles", s)),
        }
    }
}

/// Parses an integer count with an optional `K`/`M`/`B` multiplier.
pub(crate) fn parse_count(s: &str) -> Option<i64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1_000),
        'm' | 'M' => (&s[..s.len() - 1], 1_000_000),
        'b' | 'B' | 'g' | 'G' => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s, 1),
    };
    digits.trim().parse::<i64>().ok()?.checked_mul(multiplier)
}

/// Atomic claim-and-advance cursor over a [`CycleSpan`].
#[derive(Debug)]
pub struct CycleRange {
    start: i64,
    next: AtomicI64,
    end: AtomicI64,
    extended: Notify,
}

impl CycleRange {
    pub fn new(span: CycleSpan) -> Self {
        Self {
            start: span.start,
            next: AtomicI64::new(span.start),
            end: AtomicI64::new(span.end),
            extended: Notify::new(),
        }
    }

    /// Claims the next cycle, or `None` once the range is exhausted.
    pub fn claim(&self) -> Option<i64> {
        let mut current = self.next.load(Ordering::Acquire);
        loop {
            if current >= self.end.load(Ordering::Acquire) {
                return None;
            }
            match self.next.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(claimed) => return Some(claimed),
                Err(observed) => current = observed,
            }
        }
    }

    /// Moves the end boundary forward. Shrinking is ignored.
    pub fn extend_to(&self, end: i64) {
        let previous = self.end.fetch_max(end, Ordering::AcqRel);
        if end > previous {
            tracing::debug!(from = previous, to = end, "extended cycle range");
            self.extended.notify_waiters();
        }
    }

    /// Resolves once the range has unclaimed cycles, waiting for an extension if needed.
    pub async fn wait_for_more(&self) {
        let notified = self.extended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.remaining() > 0 {
            return;
        }
        notified.await;
    }

    /// Number of cycles handed out so far.
    pub fn claimed(&self) -> i64 {
        self.next.load(Ordering::Acquire).saturating_sub(self.start)
    }

    pub fn remaining(&self) -> i64 {
        self.end
            .load(Ordering::Acquire)
            .saturating_sub(self.next.load(Ordering::Acquire))
            .max(0)
    }

    pub fn span(&self) -> CycleSpan {
        CycleSpan {
            start: self.start,
            end: self.end.load(Ordering::Acquire),
        }
    }
}
