use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Backoff and cap for automatic transport reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed after a server-initiated disconnect before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single handshake. A timeout counts as a failed attempt.
    pub handshake_timeout: Duration,
    /// How long `disconnect` waits for the socket to close before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    ///
    /// The first attempt is immediate, later ones back off exponentially up to
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        self.base_delay
            .saturating_mul(2_u32.pow(exponent))
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Fixed-delay retry for room joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for JoinRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(200),
        }
    }
}

impl JoinRetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Linear backoff for best-effort requests (read tracking, unread fetch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearRetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
}

impl Default for LinearRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step: Duration::from_secs(1),
        }
    }
}

impl LinearRetryPolicy {
    pub fn new(max_retries: u32, step: Duration) -> Self {
        Self { max_retries, step }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.step.saturating_mul(retry)
    }
}

/// Runs `operation` with linear backoff and gives up quietly once the retries
/// are spent. Permission errors are retried like any other failure.
pub async fn retry_linear<F, Fut, T>(
    policy: &LinearRetryPolicy,
    description: &str,
    mut operation: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retry > 0 {
                    tracing::debug!(
                        target: "chatsync::retry::retry_linear",
                        "{} succeeded after {} retries",
                        description,
                        retry
                    );
                }
                return Some(result);
            }
            Err(e) => {
                if retry >= policy.max_retries {
                    tracing::warn!(
                        target: "chatsync::retry::retry_linear",
                        "{} abandoned after {} retries: {}",
                        description,
                        retry,
                        e
                    );
                    return None;
                }

                retry += 1;
                let delay = policy.delay_for(retry);
                tracing::debug!(
                    target: "chatsync::retry::retry_linear",
                    "Retry {}/{}: {} failed, waiting {:?}: {}",
                    retry,
                    policy.max_retries,
                    description,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
