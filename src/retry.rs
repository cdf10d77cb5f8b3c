// Copyright 2020 Joyent, Inc.

//! Retry policies decide whether a failed query is tried again, and where.
//!
//! Nothing is retried by default. The single exception, built into the query
//! executor, is re-preparing a statement the server no longer knows about.

use std::fmt::Debug;
use std::thread;
use std::time::Duration;

use crate::error::{Error, ServerError};
use crate::host::Host;
use crate::shuffle::RandomSource;

/// What the executor knows about one logical query so far.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    /// Attempts made, including the one that just failed.
    pub attempts: usize,
    /// Time spent across all attempts.
    pub latency: Duration,
    /// The host of the last attempt.
    pub host: Option<Host>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryType {
    /// Try again on the same host.
    Retry,
    /// Try again on the next candidate host.
    RetryNextHost,
    /// Give up and report success with an empty result.
    Ignore,
    /// Give up and report the error.
    Rethrow,
}

pub trait RetryPolicy: Send + Sync + Debug {
    /// Whether another attempt may be made. Implementations may block here to
    /// delay the next attempt.
    fn attempt(&self, state: &RetryState) -> bool;
    /// How to retry after `err`.
    fn retry_type(&self, err: &Error) -> RetryType;
}

/// Never retries.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn attempt(&self, _state: &RetryState) -> bool {
        false
    }

    fn retry_type(&self, _err: &Error) -> RetryType {
        RetryType::Rethrow
    }
}

/// Retries up to `num_retries` times, immediately.
#[derive(Copy, Clone, Debug)]
pub struct SimpleRetryPolicy {
    pub num_retries: usize,
}

impl RetryPolicy for SimpleRetryPolicy {
    fn attempt(&self, state: &RetryState) -> bool {
        state.attempts <= self.num_retries
    }

    fn retry_type(&self, err: &Error) -> RetryType {
        default_retry_type(err)
    }
}

/// Retries up to `num_retries` times, sleeping an exponentially growing,
/// jittered delay between `min` and `max` before each retry.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffRetryPolicy {
    pub num_retries: usize,
    pub min: Duration,
    pub max: Duration,
    random: RandomSource,
}

impl ExponentialBackoffRetryPolicy {
    pub fn new(num_retries: usize, min: Duration, max: Duration) -> Self {
        Self::with_random(num_retries, min, max, RandomSource::new())
    }

    pub fn with_random(
        num_retries: usize,
        min: Duration,
        max: Duration,
        random: RandomSource,
    ) -> Self {
        ExponentialBackoffRetryPolicy {
            num_retries,
            min,
            max,
            random,
        }
    }

    /// The delay before retry number `attempts`.
    pub fn nap_time(&self, attempts: usize) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        let shift = attempts.saturating_sub(1).min(32) as u32;
        let ceiling = min.saturating_mul(1u64 << shift).min(max).max(min);
        let jittered = self.random.gen_range(min, ceiling + 1);
        Duration::from_millis(jittered)
    }
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn attempt(&self, state: &RetryState) -> bool {
        if state.attempts > self.num_retries {
            return false;
        }
        thread::sleep(self.nap_time(state.attempts));
        true
    }

    fn retry_type(&self, err: &Error) -> RetryType {
        default_retry_type(err)
    }
}

/// Transient node trouble moves on to another host, server-side timeouts are
/// retried in place, and errors in the request itself are never retried.
pub fn default_retry_type(err: &Error) -> RetryType {
    if let Some(e) = err.server_error() {
        return match e.code {
            ServerError::READ_TIMEOUT | ServerError::WRITE_TIMEOUT => RetryType::Retry,
            ServerError::UNAVAILABLE
            | ServerError::OVERLOADED
            | ServerError::BOOTSTRAPPING
            | ServerError::SERVER
            | ServerError::TRUNCATE => RetryType::RetryNextHost,
            _ => RetryType::Rethrow,
        };
    }
    if err.is_transport() || err.is_timeout() || err.is_saturation() {
        RetryType::RetryNextHost
    } else {
        RetryType::Rethrow
    }
}
