//! Cancellable polling
//!
//! Used inside actions to block until eventually-consistent external state
//! settles (e.g. the Kubernetes API reporting its first node).

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::{CloudError, Result};

/// Poll `predicate` every `interval` until it reports `true`.
///
/// - `Ok(true)` ends the wait successfully
/// - `Ok(false)` and `Err(_)` both mean "not yet"; provider errors during
///   polling are expected and only logged
/// - returns `Timeout` once `timeout` has elapsed, even if a predicate call
///   is still pending
/// - returns `Cancelled` as soon as `cancel` fires
pub async fn cancellable_wait_for<F, Fut>(
    cancel: &CancellationToken,
    description: &str,
    timeout: Duration,
    interval: Duration,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    tracing::info!("Waiting for {} (timeout {:?})", description, timeout);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CloudError::Cancelled(format!("waiting for {}", description)));
            }
            _ = sleep_until(deadline) => {
                return Err(CloudError::Timeout(format!(
                    "waiting for {} after {:?}",
                    description, timeout
                )));
            }
            result = predicate() => match result {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => tracing::debug!("Still waiting for {}: {}", description, e),
            },
        }

        let wake = (Instant::now() + interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CloudError::Cancelled(format!("waiting for {}", description)));
            }
            _ = sleep_until(wake) => {}
        }

        if Instant::now() >= deadline {
            return Err(CloudError::Timeout(format!(
                "waiting for {} after {:?}",
                description, timeout
            )));
        }
    }
}
