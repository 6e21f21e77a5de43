//! Throughput pacing for motors.
//!
//! A [`RateLimiter`] turns a [`RateSpec`] into an awaitable pacing gate. It follows the
//! classic token-bucket split between **rate generation** and **consumption**:
//!
//! 1. A governor task wakes every 10 ms and converts the elapsed wall-clock time into
//!    *ticks* (see [`TickUnit`]).
//! 2. Ticks are released as permits into the *active pool*, a
//!    `tokio::sync::Semaphore` holding at most one second worth of time.
//! 3. Ticks that do not fit go to the *waiting pool*. They represent scheduling delay:
//!    time the consumers owe the target rate.
//! 4. Each [`RateLimiter::acquire`] takes one op worth of ticks from the active pool.
//!
//! # Burst recovery
//! When consumers fall behind, the governor moves waiting ticks back into the active
//! pool, at most `burst - 1` seconds worth per second of refill, and never more than
//! `max_active × burst` in total. The long-run average converges on the target while
//! short-term throughput may reach `rate × burst`:
//!
//! ```text
//! refill_factor = min(new_ticks / max_active, 1)
//! recoverable   = min(refill_factor × burst_pool, max_over_active - available)
//! recovered     = min(recoverable, waiting)
//! ```
//!
//! # Hot updates
//! [`RateLimiter::apply_rate_spec`] builds fresh pools and swaps them in through a
//! `watch` channel. The old semaphore is closed, which wakes its waiters so they retry
//! against the new pools. Nobody ever sees a half-updated spec.
mod limiter;
mod spec;

pub use limiter::*;
pub use spec::*;
