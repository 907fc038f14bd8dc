//! Bounded polling for convergence checks.
//!
//! Propagation is eventually consistent, so verification has to poll. These
//! helpers retry a probe at a fixed interval until it succeeds or a deadline
//! passes, and report the last thing that was still out of line.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Interval and deadline for a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Ready,
    /// Not there yet; the string names what is still pending
    Pending(String),
}

#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error("condition not met after {timeout:?}: {last_failure}")]
    Timeout {
        timeout: Duration,
        last_failure: String,
    },

    #[error("probe failed: {0}")]
    Probe(E),
}

/// Poll `probe` until it reports [`Probe::Ready`] or `settings.timeout` elapses.
///
/// A probe error ends the wait immediately.
pub async fn wait_until<F, Fut, E>(settings: PollSettings, mut probe: F) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe, E>>,
{
    let deadline = Instant::now() + settings.timeout;

    loop {
        let last_failure = match probe().await.map_err(WaitError::Probe)? {
            Probe::Ready => return Ok(()),
            Probe::Pending(reason) => {
                debug!(pending = %reason, "Condition not met yet");
                reason
            }
        };

        if Instant::now() + settings.interval > deadline {
            return Err(WaitError::Timeout {
                timeout: settings.timeout,
                last_failure,
            });
        }
        sleep(settings.interval).await;
    }
}

/// Poll until `check` passes for every item returned by `fetch`.
///
/// `check` returns `Err(description)` for an item that is not ready yet; the
/// description of the first such item becomes the timeout's `last_failure`.
pub async fn wait_for_all<T, F, Fut, C, E>(
    settings: PollSettings,
    mut fetch: F,
    check: C,
) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
    C: Fn(&T) -> Result<(), String>,
{
    let check = &check;
    wait_until(settings, move || {
        let items = fetch();
        async move {
            let items = items.await?;
            Ok(items
                .iter()
                .find_map(|item| check(item).err())
                .map_or(Probe::Ready, Probe::Pending))
        }
    })
    .await
}
