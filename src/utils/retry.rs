use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

/// Attempt ceiling and fixed delay for startup connection loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up.
///
/// Returns `None` once every attempt has failed; the caller continues in
/// degraded mode. A policy with zero attempts still tries once.
pub async fn with_retry<T, E, F, Fut>(service: &str, policy: RetryPolicy, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{service} connected on attempt {attempt}/{attempts}");
                }
                return Some(value);
            }
            Err(e) => {
                warn!("{service} connection attempt {attempt}/{attempts} failed: {e}");
                if attempt < attempts {
                    info!("Retrying {service} connection in {:?}", policy.delay);
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    error!("{service} connection failed after all retries. Continuing without {service}.");
    None
}
