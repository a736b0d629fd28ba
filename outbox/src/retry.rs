//! Retry policies: backoff schedules plus error-class filtering.
//!
//! Each handler resolves to one policy (its own or the engine default).
//! After the k-th failed attempt the record is rescheduled to
//! `now + delay(k)` as long as the budget allows and the error class is
//! retryable; otherwise the chain moves on to fallback handling.

use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{DispatchError, OutboxError, OutboxResult};

/// Backoff schedule between dispatch attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed { delay: Duration },

    /// `initial + increment * (failure_count - 1)`, capped at `max`.
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },

    /// `initial * multiplier^(failure_count - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

/// Retry policy attached to a handler.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget: a record is rescheduled while `failure_count <= max_retries`.
    pub max_retries: i32,

    pub backoff: Backoff,

    /// Optional uniform jitter: the computed delay becomes
    /// `base ± uniform[0, jitter]`, floored at zero.
    pub jitter: Option<Duration>,

    /// Error classes to retry. When set, only these classes are retried.
    retry_on: Option<HashSet<String>>,

    /// Error classes never retried. Ignored when `retry_on` is set.
    no_retry_on: HashSet<String>,
}

impl RetryPolicy {
    /// Constant-delay policy.
    pub fn fixed(delay: Duration, max_retries: i32) -> Self {
        Self::with_backoff(Backoff::Fixed { delay }, max_retries)
    }

    /// Linearly growing delay, capped at `max`.
    pub fn linear(initial: Duration, increment: Duration, max: Duration, max_retries: i32) -> Self {
        Self::with_backoff(
            Backoff::Linear {
                initial,
                increment,
                max,
            },
            max_retries,
        )
    }

    /// Exponentially growing delay, capped at `max`.
    pub fn exponential(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        max_retries: i32,
    ) -> Self {
        Self::with_backoff(
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            },
            max_retries,
        )
    }

    fn with_backoff(backoff: Backoff, max_retries: i32) -> Self {
        Self {
            max_retries,
            backoff,
            jitter: None,
            retry_on: None,
            no_retry_on: HashSet::new(),
        }
    }

    /// Add uniform jitter around the computed delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Restrict retries to the given error classes (include-list).
    /// When both lists are configured the include-list wins.
    pub fn retry_on<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    /// Never retry the given error classes (exclude-list).
    pub fn no_retry_on<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_retry_on = classes.into_iter().map(Into::into).collect();
        self
    }

    /// Reject obviously broken policies at registration time.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.max_retries < 0 {
            return Err(OutboxError::Configuration(format!(
                "max_retries must be >= 0, got {}",
                self.max_retries
            )));
        }
        if let Backoff::Exponential { multiplier, .. } = self.backoff {
            if multiplier < 1.0 {
                return Err(OutboxError::Configuration(format!(
                    "exponential backoff multiplier must be >= 1.0, got {multiplier}"
                )));
            }
        }
        Ok(())
    }

    /// Whether the error class is retryable under this policy.
    ///
    /// The default policy retries every class.
    pub fn should_retry(&self, error: &DispatchError) -> bool {
        if let Some(include) = &self.retry_on {
            return include.contains(&error.class);
        }
        !self.no_retry_on.contains(&error.class)
    }

    /// Whether the retry budget is spent after `failure_count` failures.
    pub fn is_exhausted(&self, failure_count: i32) -> bool {
        failure_count > self.max_retries
    }

    /// Delay before the next attempt, given the number of failures so far.
    ///
    /// The first failure (`failure_count = 1`) waits the initial delay.
    pub fn delay(&self, failure_count: i32) -> Duration {
        let step = failure_count.saturating_sub(1).max(0) as u32;
        let base = match &self.backoff {
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear {
                initial,
                increment,
                max,
            } => (*initial + *increment * step).min(*max),
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let millis = initial.as_millis() as f64 * multiplier.powi(step as i32);
                Duration::from_millis(millis.min(max.as_millis() as f64) as u64)
            }
        };
        self.apply_jitter(base)
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        match self.jitter {
            Some(jitter) if !jitter.is_zero() => {
                let bound = jitter.as_millis() as i64;
                let offset = rand::thread_rng().gen_range(-bound..=bound);
                let millis = (base.as_millis() as i64 + offset).max(0);
                Duration::from_millis(millis as u64)
            }
            _ => base,
        }
    }
}

impl Default for RetryPolicy {
    /// Exponential backoff, 100ms doubling up to 10s, three retries.
    fn default() -> Self {
        Self::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            3,
        )
    }
}
