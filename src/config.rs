//! Controller configuration
//!
//! Every knob has a default, so an empty file (or no file at all) gives a
//! working controller. Values are read from TOML and then overridden by CLI
//! flags and environment variables in `main.rs`.
//!
//! ```toml
//! workers = 16
//! attempt_timeout_ms = 60000
//! transition_deadline_ms = 1800000
//!
//! [provision_retry]
//! max_attempts = 8
//! initial_delay = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{duration_millis, RetryConfig};
use crate::{Error, Result};

/// Tunables of the reconciler and its scheduler
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Clusters reconciled in parallel
    pub workers: usize,

    /// Retry budget of one provisioning task
    pub provision_retry: RetryConfig,

    /// Retry budget of one teardown call
    pub teardown_retry: RetryConfig,

    /// Upper bound of a single provisioner call
    #[serde(rename = "attempt_timeout_ms", with = "duration_millis")]
    pub attempt_timeout: Duration,

    /// Upper bound of all retries within one phase transition
    #[serde(rename = "transition_deadline_ms", with = "duration_millis")]
    pub transition_deadline: Duration,

    /// Requeue delay while waiting for the control plane to answer
    #[serde(rename = "health_requeue_ms", with = "duration_millis")]
    pub health_requeue: Duration,

    /// Resync interval of running clusters
    #[serde(rename = "running_resync_ms", with = "duration_millis")]
    pub running_resync: Duration,

    /// Requeue delay after a retryable reconcile error
    #[serde(rename = "error_requeue_ms", with = "duration_millis")]
    pub error_requeue: Duration,

    /// Requeue delay between provisioning steps
    #[serde(rename = "provisioning_requeue_ms", with = "duration_millis")]
    pub provisioning_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            provision_retry: RetryConfig::default(),
            teardown_retry: RetryConfig {
                max_attempts: 3,
                ..RetryConfig::default()
            },
            attempt_timeout: Duration::from_secs(60),
            transition_deadline: Duration::from_secs(1800),
            health_requeue: Duration::from_secs(10),
            running_resync: Duration::from_secs(300),
            error_requeue: Duration::from_secs(30),
            provisioning_requeue: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::serialization_for_kind("toml", e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a TOML config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::internal_with_context("config", format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Config with millisecond timings, for tests and local simulation
    pub fn fast() -> Self {
        Self {
            workers: 4,
            provision_retry: RetryConfig::fast(5),
            teardown_retry: RetryConfig::fast(3),
            attempt_timeout: Duration::from_secs(5),
            transition_deadline: Duration::from_secs(30),
            health_requeue: Duration::from_millis(5),
            running_resync: Duration::from_secs(60),
            error_requeue: Duration::from_millis(10),
            provisioning_requeue: Duration::from_millis(1),
        }
    }

    fn check(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::validation(
                "config",
                "workers",
                "must be at least 1",
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(Error::validation(
                "config",
                "attempt_timeout_ms",
                "must be positive",
            ));
        }
        for (section, retry) in [
            ("provision_retry", &self.provision_retry),
            ("teardown_retry", &self.teardown_retry),
        ] {
            retry
                .check()
                .map_err(|msg| Error::validation("config", section, msg))?;
        }
        Ok(())
    }
}
