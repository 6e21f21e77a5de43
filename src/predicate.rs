//! Bounded polling for "has the system settled yet?" checks.
//!
//! A [`TimeoutPredicate`] evaluates a condition at most once per `min_interval`, never waits
//! past its overall deadline, and reports a tagged [`Status`] instead of signalling
//! non-convergence through errors. Waits are cancellable through a
//! [`CancellationToken`] so shutdown never has to wait out a poll.
use std::{fmt, time::Duration};

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DynError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The condition held.
    Complete,
    /// The condition did not hold yet, but there is time left.
    Pending,
    /// The deadline passed (or the wait was cancelled) before the condition held.
    Incomplete,
    /// The condition could not be evaluated.
    Error,
}

#[derive(Debug)]
pub struct PredicateResult {
    pub status: Status,
    /// Time since the first poll.
    pub elapsed: Duration,
    pub timeout: Duration,
    pub error: Option<DynError>,
}

impl PredicateResult {
    pub fn is_complete(&self) -> bool {
        self.status == Status::Complete
    }
}

impl fmt::Display for PredicateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} after {:?} of {:?}",
            self.status, self.elapsed, self.timeout
        )?;
        if let Some(err) = &self.error {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

type Check<T> = Box<dyn Fn(&T) -> Result<bool, DynError> + Send + Sync>;

pub struct TimeoutPredicate<T> {
    name: String,
    check: Check<T>,
    timeout: Duration,
    min_interval: Duration,
    rethrow: bool,
    cancel: CancellationToken,
    started_at: Option<Instant>,
    last_poll: Option<Instant>,
    polls: u64,
}

impl<T> fmt::Debug for TimeoutPredicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutPredicate")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("min_interval", &self.min_interval)
            .field("rethrow", &self.rethrow)
            .field("polls", &self.polls)
            .finish_non_exhaustive()
    }
}

impl<T> TimeoutPredicate<T> {
    pub fn new<F>(check: F, timeout: Duration, min_interval: Duration) -> Self
    where
        F: Fn(&T) -> Result<bool, DynError> + Send + Sync + 'static,
    {
        Self {
            name: "predicate".to_string(),
            check: Box::new(check),
            timeout,
            min_interval,
            rethrow: false,
            cancel: CancellationToken::new(),
            started_at: None,
            last_poll: None,
            polls: 0,
        }
    }

    pub fn named(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Return evaluation errors from [`Self::test`] instead of wrapping them in the result.
    pub fn rethrow(self, rethrow: bool) -> Self {
        Self { rethrow, ..self }
    }

    /// Interrupt pending waits when `cancel` fires.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Forgets the previous polls, so the next [`Self::test`] starts a fresh deadline.
    pub fn reset(&mut self) {
        self.started_at = None;
        self.last_poll = None;
        self.polls = 0;
    }

    /// Evaluates the condition against `value`.
    ///
    /// The first call evaluates immediately. Later calls first wait until `min_interval` has
    /// passed since the previous poll, clamped to the deadline.
    pub async fn test(&mut self, value: &T) -> Result<PredicateResult, DynError> {
        let now = Instant::now();
        let started = *self.started_at.get_or_insert(now);
        let deadline = started + self.timeout;

        if self.cancel.is_cancelled() {
            return Ok(self.result(Status::Incomplete, now - started, None));
        }

        if let Some(last) = self.last_poll {
            let wake = (last + self.min_interval).min(deadline);
            if wake > now {
                tokio::select! {
                    _ = sleep_until(wake) => {}
                    _ = self.cancel.cancelled() => {
                        debug!(predicate = %self.name, "poll cancelled");
                        let elapsed = Instant::now() - started;
                        return Ok(self.result(Status::Incomplete, elapsed, None));
                    }
                }
            }
        }

        let polled = Instant::now();
        self.last_poll = Some(polled);
        self.polls += 1;
        let elapsed = polled - started;

        let result = match (self.check)(value) {
            Ok(true) => self.result(Status::Complete, elapsed, None),
            Ok(false) if polled >= deadline => self.result(Status::Incomplete, elapsed, None),
            Ok(false) => self.result(Status::Pending, elapsed, None),
            Err(err) if self.rethrow => return Err(err),
            Err(err) => self.result(Status::Error, elapsed, Some(err)),
        };
        debug!(predicate = %self.name, poll = self.polls, %result, "polled");
        Ok(result)
    }

    fn result(&self, status: Status, elapsed: Duration, error: Option<DynError>) -> PredicateResult {
        PredicateResult {
            status,
            elapsed,
            timeout: self.timeout,
            error,
        }
    }
}

/// A [`TimeoutPredicate`] that pulls its input from a source instead of taking it as an
/// argument.
pub struct PollingPredicate<T> {
    source: Box<dyn FnMut() -> T + Send>,
    predicate: TimeoutPredicate<T>,
}

impl<T> fmt::Debug for PollingPredicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingPredicate")
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

impl<T> PollingPredicate<T> {
    pub fn new<S>(source: S, predicate: TimeoutPredicate<T>) -> Self
    where
        S: FnMut() -> T + Send + 'static,
    {
        Self {
            source: Box::new(source),
            predicate,
        }
    }

    /// Waits for the next poll slot, then samples the source and evaluates it.
    ///
    /// The source is sampled after the wait so the condition sees fresh data.
    pub async fn test(&mut self) -> Result<PredicateResult, DynError> {
        if let Some(last) = self.predicate.last_poll {
            let deadline = self.predicate.started_at.unwrap_or(last) + self.predicate.timeout;
            let wake = (last + self.predicate.min_interval).min(deadline);
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = self.predicate.cancel.cancelled() => {}
            }
        }
        let value = (self.source)();
        self.predicate.test(&value).await
    }

    /// Polls until the status is anything but [`Status::Pending`].
    pub async fn converge(&mut self) -> Result<PredicateResult, DynError> {
        loop {
            let result = self.test().await?;
            if result.status != Status::Pending {
                return Ok(result);
            }
        }
    }

    pub fn polls(&self) -> u64 {
        self.predicate.polls()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    };

    fn never(_: &u64) -> Result<bool, DynError> {
        Ok(false)
    }

    #[tokio::test(start_paused = true)]
    async fn true_on_first_poll_completes_immediately() {
        let mut predicate =
            TimeoutPredicate::new(|v: &u64| Ok(*v > 3), Duration::from_secs(5), Duration::from_secs(1));
        let result = predicate.test(&10).await.unwrap();
        assert_eq!(result.status, Status::Complete);
        assert_eq!(result.elapsed, Duration::ZERO);
        assert_eq!(result.timeout, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn always_false_ends_incomplete_after_timeout() {
        let mut predicate =
            TimeoutPredicate::new(never, Duration::from_secs(1), Duration::from_millis(100));
        let mut last = predicate.test(&0).await.unwrap();
        while last.status == Status::Pending {
            last = predicate.test(&0).await.unwrap();
        }
        assert_eq!(last.status, Status::Incomplete);
        assert!(last.elapsed >= Duration::from_secs(1));
        assert_eq!(predicate.polls(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_are_spaced_by_min_interval() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let mut predicate = TimeoutPredicate::new(
            move |_: &u64| {
                recorded.lock().unwrap().push(Instant::now());
                Ok(false)
            },
            Duration::from_millis(1_050),
            Duration::from_millis(100),
        );
        loop {
            if predicate.test(&0).await.unwrap().status != Status::Pending {
                break;
            }
        }

        let stamps = stamps.lock().unwrap();
        // The final poll is clamped to the deadline.
        for pair in stamps[..stamps.len() - 1].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        let last = stamps[stamps.len() - 1] - stamps[stamps.len() - 2];
        assert_eq!(last, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_wrapped_or_rethrown() {
        let failing = |_: &u64| -> Result<bool, DynError> { Err("source unreachable".into()) };

        let mut wrapped = TimeoutPredicate::new(failing, Duration::from_secs(1), Duration::ZERO);
        let result = wrapped.test(&0).await.unwrap();
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error.unwrap().to_string(), "source unreachable");

        let mut thrown =
            TimeoutPredicate::new(failing, Duration::from_secs(1), Duration::ZERO).rethrow(true);
        let err = thrown.test(&0).await.unwrap_err();
        assert_eq!(err.to_string(), "source unreachable");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let mut predicate =
            TimeoutPredicate::new(never, Duration::from_secs(3600), Duration::from_secs(60))
                .with_cancellation(cancel.clone());
        assert_eq!(predicate.test(&0).await.unwrap().status, Status::Pending);

        let started = Instant::now();
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let result = predicate.test(&0).await.unwrap();
        trigger.await.unwrap();

        assert_eq!(result.status, Status::Incomplete);
        assert!(Instant::now() - started < Duration::from_secs(60));
        assert_eq!(predicate.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_the_deadline() {
        let mut predicate =
            TimeoutPredicate::new(never, Duration::from_millis(10), Duration::from_millis(10));
        predicate.test(&0).await.unwrap();
        assert_eq!(predicate.test(&0).await.unwrap().status, Status::Incomplete);

        predicate.reset();
        assert_eq!(predicate.test(&0).await.unwrap().status, Status::Pending);
    }

    mod polling {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn converges_once_source_reaches_target() {
            let counter = Arc::new(AtomicU64::new(0));
            let source = {
                let counter = counter.clone();
                move || counter.fetch_add(1, Ordering::SeqCst)
            };
            let predicate = TimeoutPredicate::new(
                |v: &u64| Ok(*v >= 4),
                Duration::from_secs(10),
                Duration::from_millis(250),
            );
            let started = Instant::now();
            let mut polling = PollingPredicate::new(source, predicate);

            let result = polling.converge().await.unwrap();
            assert_eq!(result.status, Status::Complete);
            assert_eq!(polling.polls(), 5);
            assert_eq!(Instant::now() - started, Duration::from_secs(1));
        }

        #[tokio::test(start_paused = true)]
        async fn gives_up_at_the_deadline() {
            let predicate =
                TimeoutPredicate::new(never, Duration::from_millis(500), Duration::from_millis(200));
            let mut polling = PollingPredicate::new(|| 0u64, predicate);

            let result = polling.converge().await.unwrap();
            assert_eq!(result.status, Status::Incomplete);
            assert_eq!(result.elapsed, Duration::from_millis(500));
        }
    }
}
