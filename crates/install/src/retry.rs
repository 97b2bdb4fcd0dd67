//! Fixed-delay retry loops shared by readiness waits, deletion waits and API mutations.

use std::future::Future;
use std::time::Duration;

use keel_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay between attempts and the attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub attempts: u32,
}

impl RetryPolicy {
    pub const fn fixed(delay: Duration, attempts: u32) -> Self { Self { delay, attempts } }

    /// Readiness and deletion waits: 250ms × 500, long enough for image pulls.
    pub const fn wait_default() -> Self { Self::fixed(Duration::from_millis(250), 500) }

    /// Transient failures of create/update/delete calls.
    pub const fn mutation_default() -> Self { Self::fixed(Duration::from_millis(100), 10) }
}

/// Outcome of one readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Ready,
    Pending(String),
}

/// Sleep unless cancelled first; false on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Probe until ready. A probe error counts as a pending attempt. Cancellation ends the
/// wait with `Ok`; running out of attempts yields `ReadinessTimeout` with the last reason.
pub async fn poll_until<F, Fut>(policy: &RetryPolicy, cancel: &CancellationToken, what: &str, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            debug!(what, attempt, "wait cancelled");
            return Ok(());
        }
        match probe().await {
            Ok(Probe::Ready) => return Ok(()),
            Ok(Probe::Pending(reason)) => last = reason,
            Err(e) => last = e.report(),
        }
        debug!(what, attempt, reason = %last, "not ready yet");
        if attempt < attempts && !pause(policy.delay, cancel).await {
            debug!(what, attempt, "wait cancelled");
            return Ok(());
        }
    }
    Err(Error::ReadinessTimeout { key: what.to_string(), attempts, last })
}

/// Run `op` until it succeeds or fails with a non-transient error. Cancellation stops
/// further attempts and surfaces the last error.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, cancel: &CancellationToken, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts && !cancel.is_cancelled() => {
                warn!(what, attempt, error = %e.report(), delay_ms = policy.delay.as_millis() as u64, "transient failure, retrying");
                if !pause(policy.delay, cancel).await {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
