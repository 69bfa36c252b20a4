//! Retry policies for transient node failures.
//!
//! A [`RetryPolicy`] is a value object attached to node config (or supplied
//! by the engine default) that decides how many attempts a node gets and how
//! long to wait between them. Four backoff strategies are supported; jitter
//! adds a ±20 % random variation so simultaneous failures do not retry in
//! lockstep.
//!
//! # Quick start
//!
//! ```rust
//! use dipeo_core::retry::{RetryPolicy, RetryStrategy};
//!
//! // Default: 3 attempts, exponential 1s..10s with jitter
//! let policy = RetryPolicy::default();
//! assert!(policy.should_retry(2));
//! assert!(!policy.should_retry(3));
//!
//! // Deterministic policy for tests
//! let policy = RetryPolicy::new(3, 10, 1_000)
//!     .with_strategy(RetryStrategy::Exponential)
//!     .with_jitter(false);
//! assert_eq!(policy.calculate_delay(1).as_millis(), 10);
//! assert_eq!(policy.calculate_delay(2).as_millis(), 20);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
    Fibonacci,
}

/// Configuration for retrying failed node executions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Base delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,

    pub strategy: RetryStrategy,

    /// Multiplier applied per attempt for the exponential strategy.
    pub backoff_factor: f64,

    /// Randomise each delay by ±20 %.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before attempt number `attempt` (1-based; attempt 0 is the
    /// initial try and never waits). Capped at `max_delay_ms`, then
    /// jittered by ±20 % when enabled.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = match self.strategy {
            RetryStrategy::Constant => self.initial_delay_ms as f64,
            RetryStrategy::Linear => self.initial_delay_ms as f64 * attempt as f64,
            RetryStrategy::Exponential => {
                self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32 - 1)
            }
            RetryStrategy::Fibonacci => self.initial_delay_ms as f64 * fibonacci(attempt) as f64,
        };

        let capped = (base as u64).min(self.max_delay_ms);

        let millis = if self.jitter && capped > 0 {
            let spread = (capped as f64 * 0.2) as i64;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped as i64 + offset).max(0) as u64
        } else {
            capped
        };

        Duration::from_millis(millis)
    }

    /// Worst-case total wait across all retries, without jitter.
    pub fn total_possible_delay_ms(&self) -> u64 {
        let jitterless = Self {
            jitter: false,
            ..self.clone()
        };
        (1..self.max_attempts)
            .map(|attempt| jitterless.calculate_delay(attempt).as_millis() as u64)
            .sum()
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}
