//! Retry utilities with exponential backoff and jitter.
//!
//! Provisioner calls fail transiently all the time (rate limits, IaaS API
//! hiccups). Operations here are retried only while their error says it is
//! retryable, and only within an attempt count and an overall deadline.
//!
//! # Example
//!
//! ```ignore
//! use cce_controller::retry::{retry_with_backoff, RetryConfig};
//!
//! let handle = retry_with_backoff(
//!     &RetryConfig::default(),
//!     "create-masters",
//!     || async { provisioner.create_master(&request).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, warn};

/// Errors that know whether repeating the call may help
pub trait Retryable {
    /// Whether the failed operation may succeed if repeated
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::Error {
    fn is_retryable(&self) -> bool {
        crate::Error::is_retryable(self)
    }
}

/// Retry budget for one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = bounded by the deadline only)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Give up once this much time has passed since the first attempt
    #[serde(with = "option_duration_millis")]
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

impl RetryConfig {
    /// Config with millisecond delays, for tests and the simulated provisioner
    pub fn fast(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            deadline: None,
        }
    }

    /// Reject budgets the backoff loop cannot run with
    ///
    /// The multiplier must be finite and at least 1.0, and `max_delay` may
    /// not be shorter than `initial_delay`.
    pub fn check(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be a finite number of at least 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(format!(
                "max_delay ({}ms) is shorter than initial_delay ({}ms)",
                self.max_delay.as_millis(),
                self.initial_delay.as_millis()
            ));
        }
        Ok(())
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Non-retryable errors are returned immediately. Retryable errors are
/// retried until the attempt count or the deadline runs out, then the last
/// error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    retry_with_backoff_notify(config, operation_name, |_, _, _| {}, operation).await
}

/// Like [`retry_with_backoff`], calling `on_retry(attempt, error, delay)`
/// before each sleep.
pub async fn retry_with_backoff_notify<F, Fut, T, E, N>(
    config: &RetryConfig,
    operation_name: &str,
    mut on_retry: N,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
    N: FnMut(u32, &E, Duration),
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) => {
                if config.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                if let Some(deadline) = config.deadline {
                    if started.elapsed() + jittered_delay > deadline {
                        error!(
                            operation = %operation_name,
                            attempt = attempt,
                            error = %e,
                            deadline_ms = deadline.as_millis(),
                            "Operation failed, retry deadline exceeded"
                        );
                        return Err(e);
                    }
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );
                on_retry(attempt, &e, jittered_delay);

                tokio::time::sleep(jittered_delay).await;

                // Exponential backoff, capped at max_delay
                delay = Duration::try_from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                )
                .unwrap_or(config.max_delay);
            }
        }
    }
}

/// Serde helper for durations written as integer milliseconds
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serde helper for optional millisecond durations
pub(crate) mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
