//! Poll a check until it converges or attempts run out

use std::future::Future;
use std::time::Duration;

use tracing::trace;

/// How often and how many times to check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 15,
        }
    }
}

/// Result of [`poll_until`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Converged(T),
    TimedOut { attempts: u32 },
}

/// Call `check` until it returns `Ok(Some(_))`, sleeping `interval` between attempts.
///
/// Errors from the check are returned immediately. No sleep happens after the
/// final attempt.
pub async fn poll_until<T, E, F, Fut>(config: PollConfig, mut check: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 1..=config.max_attempts {
        if let Some(value) = check().await? {
            return Ok(PollOutcome::Converged(value));
        }
        trace!(attempt, max_attempts = config.max_attempts, "check not converged");
        if attempt < config.max_attempts {
            tokio::time::sleep(config.interval).await;
        }
    }
    Ok(PollOutcome::TimedOut {
        attempts: config.max_attempts,
    })
}
