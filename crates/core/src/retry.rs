use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::TaskError;

/// Bounded retry with a reset window.
///
/// A worker that has been running cleanly for longer than `reset` gets a
/// fresh retry budget, so a long-lived node is not killed by errors spread
/// hours apart.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub pause: Duration,
    pub reset: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            pause: Duration::from_secs(30),
            reset: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(conf: &Config) -> Self {
        let default = Self::default();
        Self {
            retries: conf.get_u32_or("ERROR_RETRIES", default.retries),
            pause: Duration::from_secs(conf.get_u64_or("ERROR_PAUSE", default.pause.as_secs())),
            reset: Duration::from_secs(conf.get_u64_or("ERROR_RESET", default.reset.as_secs())),
        }
    }
}

/// Run `action` until it succeeds, retrying transient failures per `policy`.
///
/// Fatal errors and cancellation propagate immediately. Exhausting the retry
/// budget turns the last transient error into a fatal one.
pub async fn retry<T, F>(policy: &RetryPolicy, mut action: F) -> Result<T, TaskError>
where
    F: AsyncFnMut() -> Result<T, TaskError>,
{
    let mut attempts = 0u32;
    let mut window_start = Instant::now();

    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(TaskError::Transient(err)) => {
                let now = Instant::now();
                if now.duration_since(window_start) > policy.reset {
                    info!("resetting error retry counter");
                    attempts = 0;
                    window_start = now;
                }
                attempts += 1;
                warn!(
                    "retry error {}/{}: {:#}",
                    attempts, policy.retries, err
                );
                if attempts >= policy.retries {
                    return Err(TaskError::Fatal(
                        err.context(format!("failed after {} error retries", policy.retries)),
                    ));
                }
                info!("waiting {}s before retrying", policy.pause.as_secs());
                tokio::time::sleep(policy.pause).await;
            }
            Err(other) => return Err(other),
        }
    }
}
