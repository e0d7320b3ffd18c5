//! Wait strategies for use with [`crate::consumer::Consumer::one`].
//!
//! A wait strategy answers two questions for a given (1-based) attempt number:
//!
//! 1. should another attempt be made? ([`WaitStrategy::should_retry`])
//! 2. how long should we wait before making it? ([`WaitStrategy::wait_time`])
//!
//! This module provides four base strategies:
//!
//! 1. [`NoRetry`]
//! 2. [`FixedDelay`]
//! 3. [`LinearBackoff`]
//! 4. [`ExponentialBackoff`]
//!
//! each of which can be decorated with a random jitter ([`WithJitter`]) and/or repeated forever
//! ([`RepeatForever`]).
//!
//! # Example
//!
//! ```
//! # use requeue::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = LinearBackoff::new(3, TimeDelta::seconds(2))
//!     .unwrap()
//!     .repeat_forever();
//!
//! assert!(strategy.should_retry(1_000_000));
//! assert_eq!(strategy.wait_time(1), Ok(TimeDelta::seconds(2)));
//! assert_eq!(strategy.wait_time(3), Ok(TimeDelta::seconds(6)));
//! // Beyond the inner strategy the last wait time is repeated.
//! assert_eq!(strategy.wait_time(10), Ok(TimeDelta::seconds(6)));
//! ```

use std::sync::{Arc, OnceLock};

use chrono::TimeDelta;
use rand::Rng;
use thiserror::Error;

/// Type that can be used to decide whether and how long to wait between attempts.
pub trait WaitStrategy: Send + Sync {
    /// Returns whether another attempt should be made after `attempt` attempts have failed.
    ///
    /// Always `false` for an attempt of `0`.
    fn should_retry(&self, attempt: u32) -> bool;

    /// The time to wait before the next attempt, given `attempt` attempts have failed.
    ///
    /// Only well defined when [`WaitStrategy::should_retry`] is (or was) true for some
    /// reachable attempt.
    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError>;

    /// Wraps this strategy in a [`WithJitter`] using the default range `[0, 1)`.
    fn with_jitter(self) -> WithJitter<Self>
    where
        Self: Sized,
    {
        WithJitter::new(self)
    }

    /// Wraps this strategy in a [`WithJitter`] using the multiplicative range `[min, max)`.
    fn with_jitter_range(self, min: f64, max: f64) -> Result<WithJitter<Self>, WaitStrategyError>
    where
        Self: Sized,
    {
        WithJitter::with_range(self, min, max)
    }

    /// Wraps this strategy in a [`RepeatForever`].
    fn repeat_forever(self) -> RepeatForever<Self>
    where
        Self: Sized,
    {
        RepeatForever::new(self)
    }
}

impl<S: WaitStrategy + ?Sized> WaitStrategy for Box<S> {
    fn should_retry(&self, attempt: u32) -> bool {
        (**self).should_retry(attempt)
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        (**self).wait_time(attempt)
    }
}

impl<S: WaitStrategy + ?Sized> WaitStrategy for Arc<S> {
    fn should_retry(&self, attempt: u32) -> bool {
        (**self).should_retry(attempt)
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        (**self).wait_time(attempt)
    }
}

/// Errors constructing or querying a [`WaitStrategy`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WaitStrategyError {
    #[error("This strategy never waits")]
    Unsupported,
    #[error("Attempt {attempt} is outside of the supported range 1..={retry_count}")]
    OutOfRange { attempt: u32, retry_count: u32 },
    #[error("Wait time must not be negative, got {0}")]
    NegativeWaitTime(TimeDelta),
    #[error("Wait time overflowed at attempt {0}")]
    Overflow(u32),
    #[error("Invalid jitter range [{min}, {max})")]
    InvalidJitterRange { min: f64, max: f64 },
}

/// Never retries.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// let strategy = NoRetry;
///
/// assert!(!strategy.should_retry(1));
/// assert_eq!(strategy.wait_time(1), Err(WaitStrategyError::Unsupported));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl WaitStrategy for NoRetry {
    fn should_retry(&self, _attempt: u32) -> bool {
        false
    }

    fn wait_time(&self, _attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        Err(WaitStrategyError::Unsupported)
    }
}

/// Retries a fixed number of times, always waiting the same amount of time.
///
/// [`WaitStrategy::wait_time`] does not check the attempt against the retry count, callers are
/// expected to consult [`WaitStrategy::should_retry`] first.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = FixedDelay::new(2, TimeDelta::seconds(10)).unwrap();
///
/// assert!(strategy.should_retry(1));
/// assert!(strategy.should_retry(2));
/// assert!(!strategy.should_retry(3));
/// assert_eq!(strategy.wait_time(1), Ok(TimeDelta::seconds(10)));
/// assert_eq!(strategy.wait_time(7), Ok(TimeDelta::seconds(10)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    retry_count: u32,
    delay: TimeDelta,
}

impl FixedDelay {
    pub fn new(retry_count: u32, delay: TimeDelta) -> Result<Self, WaitStrategyError> {
        if delay < TimeDelta::zero() {
            return Err(WaitStrategyError::NegativeWaitTime(delay));
        }
        Ok(Self { retry_count, delay })
    }
}

impl WaitStrategy for FixedDelay {
    fn should_retry(&self, attempt: u32) -> bool {
        (1..=self.retry_count).contains(&attempt)
    }

    fn wait_time(&self, _attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        Ok(self.delay)
    }
}

/// A precomputed table of wait times shared by the backoff strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Schedule {
    waits: Vec<TimeDelta>,
}

impl Schedule {
    /// Builds the waits for attempts `1..=retry_count`, starting at `base` and deriving each
    /// following wait from the previous one with `next`.
    fn precompute(
        retry_count: u32,
        base: TimeDelta,
        next: impl Fn(TimeDelta) -> Option<TimeDelta>,
    ) -> Result<Self, WaitStrategyError> {
        if base < TimeDelta::zero() {
            return Err(WaitStrategyError::NegativeWaitTime(base));
        }
        let mut waits = Vec::new();
        let mut wait = base;
        for attempt in 1..=retry_count {
            if attempt > 1 {
                wait = next(wait).ok_or(WaitStrategyError::Overflow(attempt))?;
            }
            waits.push(wait);
        }
        Ok(Self { waits })
    }

    fn retry_count(&self) -> u32 {
        self.waits.len() as u32
    }

    fn should_retry(&self, attempt: u32) -> bool {
        (1..=self.retry_count()).contains(&attempt)
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        attempt
            .checked_sub(1)
            .and_then(|index| self.waits.get(index as usize))
            .copied()
            .ok_or(WaitStrategyError::OutOfRange {
                attempt,
                retry_count: self.retry_count(),
            })
    }
}

/// Linear backoff strategy.
///
/// Waits `base * attempt` for each attempt in `1..=retry_count`. Asking for the wait time of any
/// other attempt is an error.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = LinearBackoff::new(3, TimeDelta::seconds(10)).unwrap();
///
/// assert_eq!(strategy.wait_time(1), Ok(TimeDelta::seconds(10)));
/// assert_eq!(strategy.wait_time(2), Ok(TimeDelta::seconds(20)));
/// assert_eq!(strategy.wait_time(3), Ok(TimeDelta::seconds(30)));
/// assert!(strategy.wait_time(4).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    schedule: Schedule,
}

impl LinearBackoff {
    pub fn new(retry_count: u32, base: TimeDelta) -> Result<Self, WaitStrategyError> {
        let schedule = Schedule::precompute(retry_count, base, |wait| wait.checked_add(&base))?;
        Ok(Self { schedule })
    }
}

impl WaitStrategy for LinearBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        self.schedule.should_retry(attempt)
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        self.schedule.wait_time(attempt)
    }
}

/// Exponential backoff strategy.
///
/// Waits `base * 2^(attempt - 1)` for each attempt in `1..=retry_count`. Asking for the wait
/// time of any other attempt is an error.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = ExponentialBackoff::new(4, TimeDelta::seconds(2)).unwrap();
///
/// assert_eq!(strategy.wait_time(1), Ok(TimeDelta::seconds(2)));
/// assert_eq!(strategy.wait_time(2), Ok(TimeDelta::seconds(4)));
/// assert_eq!(strategy.wait_time(3), Ok(TimeDelta::seconds(8)));
/// assert_eq!(strategy.wait_time(4), Ok(TimeDelta::seconds(16)));
/// assert!(!strategy.should_retry(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    schedule: Schedule,
}

impl ExponentialBackoff {
    pub fn new(retry_count: u32, base: TimeDelta) -> Result<Self, WaitStrategyError> {
        let schedule = Schedule::precompute(retry_count, base, |wait| wait.checked_add(&wait))?;
        Ok(Self { schedule })
    }
}

impl WaitStrategy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        self.schedule.should_retry(attempt)
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        self.schedule.wait_time(attempt)
    }
}

/// Applies a random multiplicative jitter to the wait time of an inner strategy.
///
/// Each wait time is the inner wait time multiplied by a value drawn uniformly from
/// `[min, max)`. With the default range of `[0, 1)` the result is uniformly distributed between
/// zero and the inner wait time, exclusive of the inner wait time itself.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = FixedDelay::new(3, TimeDelta::seconds(10))
///     .unwrap()
///     .with_jitter_range(0.5, 1.0)
///     .unwrap();
///
/// let wait = strategy.wait_time(1).unwrap();
/// assert!(wait >= TimeDelta::seconds(5));
/// assert!(wait < TimeDelta::seconds(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WithJitter<S> {
    inner: S,
    min: f64,
    max: f64,
}

impl<S: WaitStrategy> WithJitter<S> {
    pub const DEFAULT_MIN: f64 = 0.0;
    pub const DEFAULT_MAX: f64 = 1.0;

    pub fn new(inner: S) -> Self {
        Self {
            inner,
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
        }
    }

    pub fn with_range(inner: S, min: f64, max: f64) -> Result<Self, WaitStrategyError> {
        // Negated comparisons also reject NaN.
        if !(min >= 0.0) || !(max > 0.0) || !(min < max) {
            return Err(WaitStrategyError::InvalidJitterRange { min, max });
        }
        Ok(Self { inner, min, max })
    }

    fn apply_jitter(&self, attempt: u32, value: TimeDelta) -> Result<TimeDelta, WaitStrategyError> {
        let draw: f64 = rand::thread_rng().gen();
        let multiplier = self.min + draw * (self.max - self.min);
        // Nanosecond precision unless the wait is too long to be counted in nanoseconds.
        let jittered = match value.num_nanoseconds() {
            Some(nanoseconds) => scale(nanoseconds, multiplier).map(TimeDelta::nanoseconds),
            None => scale(value.num_milliseconds(), multiplier).and_then(TimeDelta::try_milliseconds),
        };
        jittered.ok_or(WaitStrategyError::Overflow(attempt))
    }
}

fn scale(value: i64, multiplier: f64) -> Option<i64> {
    let scaled = (value as f64 * multiplier).floor();
    (scaled < i64::MAX as f64).then_some(scaled as i64)
}

impl<S: WaitStrategy> WaitStrategy for WithJitter<S> {
    fn should_retry(&self, attempt: u32) -> bool {
        self.inner.should_retry(attempt)
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        let wait = self.inner.wait_time(attempt)?;
        self.apply_jitter(attempt, wait)
    }
}

/// Retries forever, repeating the last wait time of the inner strategy once it stops retrying.
///
/// Attempts the inner strategy supports are delegated. For any later attempt the wait time of
/// the inner strategy's last supported attempt is used, whichever attempts were queried before.
/// That attempt is discovered the first time it is needed, by probing
/// [`WaitStrategy::should_retry`] upwards from `1`, and remembered.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = ExponentialBackoff::new(3, TimeDelta::seconds(1))
///     .unwrap()
///     .repeat_forever();
///
/// assert_eq!(strategy.wait_time(1_000), Ok(TimeDelta::seconds(4)));
/// assert_eq!(strategy.wait_time(1), Ok(TimeDelta::seconds(1)));
/// assert_eq!(strategy.wait_time(5), Ok(TimeDelta::seconds(4)));
/// ```
#[derive(Debug)]
pub struct RepeatForever<S> {
    inner: S,
    last_supported_attempt: OnceLock<Option<u32>>,
}

impl<S: WaitStrategy> RepeatForever<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last_supported_attempt: OnceLock::new(),
        }
    }

    fn last_supported_attempt(&self) -> Option<u32> {
        *self.last_supported_attempt.get_or_init(|| {
            (1..=u32::MAX)
                .take_while(|attempt| self.inner.should_retry(*attempt))
                .last()
        })
    }
}

impl<S: WaitStrategy> WaitStrategy for RepeatForever<S> {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt > 0
    }

    fn wait_time(&self, attempt: u32) -> Result<TimeDelta, WaitStrategyError> {
        if self.inner.should_retry(attempt) {
            return self.inner.wait_time(attempt);
        }
        match self.last_supported_attempt() {
            Some(last) => self.inner.wait_time(last),
            None => self.inner.wait_time(attempt),
        }
    }
}
