// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Strategies
//!
//! Delay computations shared by the connection supervisor (capped exponential
//! backoff with random jitter) and the retry coordinator (plain doubling from a
//! base delay).

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with additive jitter.
///
/// `delay(attempt) = min(initial * 2^attempt, max) + jitter`, where the jitter
/// is drawn uniformly from `[0, max_jitter]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, max_jitter: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            max_jitter,
        }
    }

    /// Delay for the given zero-based attempt, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay for the given zero-based attempt, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };

        self.delay_with_jitter(attempt, Duration::from_millis(jitter))
    }

    /// Delay with an explicit jitter value, clamped to `max_jitter`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.base_delay(attempt) + jitter.min(self.max_jitter)
    }
}

/// Delay before the republish carrying the given one-based attempt number.
///
/// Attempt `k` waits `base * 2^(k-1)`; attempt 0 never waits.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}
