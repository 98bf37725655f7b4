//! Exponential backoff supervision for long-lived workers.
//!
//! Tunnels and embedded SSH servers are supervised: when their blocking run
//! loop fails, it is restarted with exponential backoff and jitter until the
//! owning cancellation token fires. Jitter avoids thundering-herd restarts
//! when a gateway comes back after an outage.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff parameters for supervised operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run an operation until it succeeds or the token is cancelled.
///
/// A successful return ends supervision: the run loops only return `Ok(())`
/// once their own cancellation fires. Failures are logged and retried with
/// exponential backoff and 0.5x-1.5x jitter. The backoff sleep itself is
/// interrupted by cancellation so teardown never waits out a long delay.
pub async fn supervise<F, Fut, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match operation().await {
            Ok(()) => return,
            Err(e) => {
                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(jittered_delay) => {}
                }

                // Exponential backoff, capped at max_delay
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
