//! Exponential backoff for flaky radio operations

use crate::config::MeshConfig;
use crate::error::MeshResult;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn from_mesh_config(config: &MeshConfig) -> Self {
        Self {
            max_attempts: config.radio_retry_attempts,
            initial_delay: Duration::from_millis(config.radio_retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.radio_retry_max_delay_ms),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay for a given attempt number (0-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            (self.initial_delay.as_millis() as f64) * self.backoff_multiplier.powi(attempt as i32);

        let delay = Duration::from_millis(delay_ms as u64);
        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds or the attempts run out
///
/// Returns the last error when every attempt fails. A `max_attempts` of zero
/// still runs the operation once.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_while(operation_name, config, operation, |_| true).await
}

/// Like [`retry_with_backoff`] but gives up at once on non-transient errors
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> MeshResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = MeshResult<T>>,
{
    retry_while(operation_name, config, operation, |e| e.is_transient()).await
}

async fn retry_while<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        debug!(
            "Executing '{}' - attempt {}/{}",
            operation_name,
            attempt + 1,
            max_attempts
        );

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        "'{}' succeeded on attempt {}/{}",
                        operation_name,
                        attempt + 1,
                        max_attempts
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    "'{}' failed on attempt {}/{}: {}",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e
                );

                if attempt + 1 >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }

                let delay = config.calculate_delay(attempt);
                debug!("Retrying '{}' after {:?}", operation_name, delay);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
