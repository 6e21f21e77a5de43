//! Run-state accounting shared by the controller and every motor of an activity.
//!
//! [`RunStateTally`] is a monitor: counts live behind a single `watch` channel whose
//! write lock serialises every mutation, and every mutation wakes every waiter. Waiters
//! re-check their own predicate against the new snapshot, so a wake-up that does not
//! satisfy them is simply absorbed.
//!
//! Callers of the `await_*` methods get back a [`RunStateImage`]: the counts as they were
//! when the condition was met, or when the timeout fired. Always check
//! [`RunStateImage::is_timeout`] on timed waits.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::StateTransitionError;

/// Lifecycle state of one motor. Declaration order is the advancement order used by
/// [`RunStateImage::max_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RunState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Finished,
    Errored,
}

impl RunState {
    pub const ALL: [RunState; 7] = [
        RunState::Uninitialized,
        RunState::Starting,
        RunState::Running,
        RunState::Stopping,
        RunState::Stopped,
        RunState::Finished,
        RunState::Errored,
    ];

    pub const TERMINAL: [RunState; 3] = [RunState::Stopped, RunState::Finished, RunState::Errored];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether a motor may move from `self` to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Errored)
                | (Running, Stopping)
                | (Running, Finished)
                | (Running, Errored)
                | (Stopping, Stopped)
                | (Stopping, Errored)
        )
    }

    fn index(self) -> usize {
        self as usize
    }

    fn code(self) -> &'static str {
        match self {
            RunState::Uninitialized => "U",
            RunState::Starting => "S",
            RunState::Running => "R",
            RunState::Stopping => "s",
            RunState::Stopped => "_",
            RunState::Finished => "F",
            RunState::Errored => "E",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    by_state: [i64; RunState::ALL.len()],
    registered: i64,
    generation: u64,
}

impl Counts {
    fn sum(&self) -> i64 {
        self.by_state.iter().sum()
    }

    fn of(&self, state: RunState) -> i64 {
        self.by_state[state.index()]
    }

    fn any_of(&self, states: &[RunState]) -> bool {
        states.iter().any(|s| self.of(*s) > 0)
    }

    fn none_of(&self, states: &[RunState]) -> bool {
        states.iter().all(|s| self.of(*s) == 0)
    }

    fn none_other(&self, states: &[RunState]) -> bool {
        RunState::ALL
            .iter()
            .filter(|s| !states.contains(s))
            .all(|s| self.of(*s) == 0)
    }

    fn check(&self) -> Result<(), StateTransitionError> {
        let sum = self.sum();
        if sum != self.registered {
            return Err(StateTransitionError::CountMismatch {
                sum,
                registered: self.registered,
            });
        }
        Ok(())
    }
}

/// Snapshot of the tally, returned by every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStateImage {
    counts: Counts,
    timed_out: bool,
}

impl RunStateImage {
    /// True when a timed wait gave up before its condition held.
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    pub fn count(&self, state: RunState) -> i64 {
        self.counts.of(state)
    }

    pub fn registered(&self) -> i64 {
        self.counts.registered
    }

    pub fn total(&self) -> i64 {
        self.counts.sum()
    }

    pub fn generation(&self) -> u64 {
        self.counts.generation
    }

    pub fn is_any(&self, states: &[RunState]) -> bool {
        self.counts.any_of(states)
    }

    pub fn is_none_of(&self, states: &[RunState]) -> bool {
        self.counts.none_of(states)
    }

    pub fn is_none_other(&self, states: &[RunState]) -> bool {
        self.counts.none_other(states)
    }

    /// The listed states that currently have a non-zero count.
    pub fn matched(&self, states: &[RunState]) -> Vec<RunState> {
        states.iter().copied().filter(|s| self.count(*s) > 0).collect()
    }

    /// The most advanced state with a non-zero count.
    pub fn max_state(&self) -> Option<RunState> {
        RunState::ALL.iter().rev().copied().find(|s| self.count(*s) > 0)
    }
}

impl fmt::Display for RunStateImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, state) in RunState::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}({})", state.code(), self.count(*state))?;
        }
        if self.timed_out {
            f.write_str(" [timeout]")?;
        }
        Ok(())
    }
}

/// Concurrent multiset of motor run states.
///
/// Invariant: the counts always sum to the number of registered motors. `add` registers a
/// motor in a state, `remove` reaps it, `change` moves it between states in one critical
/// section.
#[derive(Debug)]
pub struct RunStateTally {
    counts: watch::Sender<Counts>,
}

impl Default for RunStateTally {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateTally {
    pub fn new() -> Self {
        let (counts, _) = watch::channel(Counts::default());
        Self { counts }
    }

    /// Registers a previously untracked motor in `state`.
    pub fn add(&self, state: RunState) -> Result<(), StateTransitionError> {
        self.mutate(|c| {
            c.by_state[state.index()] += 1;
            c.registered += 1;
            Ok(())
        })?;
        trace!(%state, "tally +");
        Ok(())
    }

    /// Reaps a motor currently counted in `state`.
    pub fn remove(&self, state: RunState) -> Result<(), StateTransitionError> {
        self.mutate(|c| {
            if c.of(state) <= 0 {
                return Err(StateTransitionError::NotHeld { state });
            }
            c.by_state[state.index()] -= 1;
            c.registered -= 1;
            Ok(())
        })?;
        trace!(%state, "tally -");
        Ok(())
    }

    /// Moves one motor from `from` to `to` atomically.
    pub fn change(&self, from: RunState, to: RunState) -> Result<(), StateTransitionError> {
        self.mutate(|c| {
            if c.of(from) <= 0 {
                return Err(StateTransitionError::ChangeFromUnheld { from, to });
            }
            c.by_state[from.index()] -= 1;
            c.by_state[to.index()] += 1;
            Ok(())
        })?;
        trace!(%from, %to, "tally change");
        Ok(())
    }

    pub fn tally_for(&self, state: RunState) -> i64 {
        self.counts.borrow().of(state)
    }

    pub fn snapshot(&self) -> RunStateImage {
        RunStateImage {
            counts: *self.counts.borrow(),
            timed_out: false,
        }
    }

    /// Waits until at least one of `states` has a non-zero count.
    pub async fn await_any(&self, states: &[RunState], timeout: Option<Duration>) -> RunStateImage {
        debug!(?states, ?timeout, "awaiting any");
        self.await_condition(timeout, |c| c.any_of(states)).await
    }

    /// Waits until every one of `states` has a zero count.
    pub async fn await_none_of(
        &self,
        states: &[RunState],
        timeout: Option<Duration>,
    ) -> RunStateImage {
        debug!(?states, ?timeout, "awaiting none of");
        self.await_condition(timeout, |c| c.none_of(states)).await
    }

    /// Waits until every registered motor is in one of `states`. Matches immediately when
    /// nothing is registered.
    pub async fn await_none_other(
        &self,
        states: &[RunState],
        timeout: Option<Duration>,
    ) -> RunStateImage {
        debug!(?states, ?timeout, "awaiting none other than");
        self.await_condition(timeout, |c| c.none_other(states)).await
    }

    async fn await_condition<F>(&self, timeout: Option<Duration>, condition: F) -> RunStateImage
    where
        F: Fn(&Counts) -> bool,
    {
        let mut rx = self.counts.subscribe();
        let wait = async {
            // The sender lives in `self`, so the channel cannot close under us.
            match rx.wait_for(|c| condition(c)).await {
                Ok(counts) => *counts,
                Err(_) => *self.counts.borrow(),
            }
        };
        let image = match timeout {
            None => RunStateImage {
                counts: wait.await,
                timed_out: false,
            },
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(counts) => RunStateImage {
                    counts,
                    timed_out: false,
                },
                Err(_) => RunStateImage {
                    counts: *self.counts.borrow(),
                    timed_out: true,
                },
            },
        };
        debug!(%image, "await resolved");
        image
    }

    fn mutate<F>(&self, apply: F) -> Result<(), StateTransitionError>
    where
        F: FnOnce(&mut Counts) -> Result<(), StateTransitionError>,
    {
        let mut outcome = Ok(());
        self.counts.send_if_modified(|counts| {
            let mut next = *counts;
            match apply(&mut next).and_then(|_| next.check()) {
                Ok(()) => {
                    next.generation += 1;
                    *counts = next;
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use RunState::*;

    #[test]
    fn change_moves_one_unit_and_bumps_generation() {
        let tally = RunStateTally::new();
        tally.add(Uninitialized).unwrap();
        tally.add(Uninitialized).unwrap();
        let before = tally.snapshot().generation();

        tally.change(Uninitialized, Running).unwrap();

        let image = tally.snapshot();
        assert_eq!(image.count(Uninitialized), 1);
        assert_eq!(image.count(Running), 1);
        assert_eq!(image.total(), image.registered());
        assert_eq!(image.generation(), before + 1);
    }

    #[test]
    fn unheld_states_are_rejected_without_mutation() {
        let tally = RunStateTally::new();
        tally.add(Running).unwrap();
        let before = tally.snapshot();

        assert_eq!(
            tally.change(Stopping, Stopped),
            Err(StateTransitionError::ChangeFromUnheld {
                from: Stopping,
                to: Stopped
            })
        );
        assert_eq!(
            tally.remove(Finished),
            Err(StateTransitionError::NotHeld { state: Finished })
        );
        assert_eq!(tally.snapshot(), before);
    }

    #[test]
    fn remove_reaps_registration() {
        let tally = RunStateTally::new();
        tally.add(Finished).unwrap();
        tally.remove(Finished).unwrap();
        let image = tally.snapshot();
        assert_eq!(image.registered(), 0);
        assert_eq!(image.total(), 0);
    }

    #[test]
    fn transitions_follow_the_motor_state_machine() {
        assert!(Uninitialized.can_transition_to(Starting));
        assert!(Running.can_transition_to(Finished));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Uninitialized.can_transition_to(Running));
        assert!(!Finished.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
    }

    #[test]
    fn image_reports_max_state_and_matches() {
        let tally = RunStateTally::new();
        tally.add(Running).unwrap();
        tally.add(Finished).unwrap();
        let image = tally.snapshot();
        assert_eq!(image.max_state(), Some(Finished));
        assert_eq!(image.matched(&[Stopped, Finished, Running]), vec![Finished, Running]);
        assert_eq!(RunStateTally::new().snapshot().max_state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn await_any_unblocks_on_add_and_not_before() {
        let tally = Arc::new(RunStateTally::new());
        tally.add(Uninitialized).unwrap();

        let waiter = {
            let tally = tally.clone();
            tokio::spawn(async move { tally.await_any(&[Running], None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tally.change(Uninitialized, Running).unwrap();
        let image = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(!image.is_timeout());
        assert_eq!(image.matched(&[Running]), vec![Running]);
    }

    #[tokio::test(start_paused = true)]
    async fn await_none_other_waits_for_all_terminal() {
        let tally = Arc::new(RunStateTally::new());
        tally.add(Uninitialized).unwrap();
        tally.add(Running).unwrap();

        let waiter = {
            let tally = tally.clone();
            tokio::spawn(async move { tally.await_none_other(&[Stopped, Finished], None).await })
        };

        tally.change(Running, Finished).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "one motor is still uninitialized");

        tally.change(Uninitialized, Starting).unwrap();
        tally.change(Starting, Running).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tally.change(Running, Stopping).unwrap();
        tally.change(Stopping, Stopped).unwrap();
        let image = waiter.await.unwrap();
        assert!(!image.is_timeout());
        assert_eq!(image.count(Stopped), 1);
        assert_eq!(image.count(Finished), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_waits_return_sentinel() {
        let tally = RunStateTally::new();
        tally.add(Running).unwrap();

        let image = tally
            .await_none_other(&[Stopped, Finished], Some(Duration::from_millis(200)))
            .await;
        assert!(image.is_timeout());
        assert_eq!(image.count(Running), 1);

        let image = tally
            .await_none_of(&[Running], Some(Duration::from_millis(10)))
            .await;
        assert!(image.is_timeout());

        let image = tally.await_any(&[Running], Some(Duration::from_millis(10))).await;
        assert!(!image.is_timeout());
    }

    #[tokio::test]
    async fn none_other_matches_with_nothing_registered() {
        let tally = RunStateTally::new();
        let image = tally.await_none_other(&RunState::TERMINAL, None).await;
        assert!(!image.is_timeout());
        assert_eq!(image.registered(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counts_match_registrations_under_contention() {
        let tally = Arc::new(RunStateTally::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tally = tally.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        tally.add(Uninitialized).unwrap();
                        tally.change(Uninitialized, Starting).unwrap();
                        tally.change(Starting, Running).unwrap();
                        tokio::task::yield_now().await;
                        tally.change(Running, Finished).unwrap();
                        tally.remove(Finished).unwrap();
                    }
                })
            })
            .collect();

        let sampler = {
            let tally = tally.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    let image = tally.snapshot();
                    assert_eq!(image.total(), image.registered());
                    assert!(RunState::ALL.iter().all(|s| image.count(*s) >= 0));
                    tokio::task::yield_now().await;
                }
            })
        };

        for worker in workers {
            worker.await.unwrap();
        }
        sampler.await.unwrap();
        assert_eq!(tally.snapshot().registered(), 0);
    }
}
