//! Retry-with-backoff for transient provider errors.
//!
//! Mirrors the fixed-interval polling idiom `HetznerProvider::wait_for_server_running`
//! uses for server state, but applied to whole-request retries. `CapacityUnavailable`
//! is deliberately never passed through here — the selector owns that retry, not
//! this helper (spec's retry discipline keeps the two loops separate).

use morpheus_core::MorpheusError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const BACKOFF: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(6),
];

/// Runs `op` up to `BACKOFF.len() + 1` times, retrying only
/// `MorpheusError::TransientNetwork`. Any other error (including
/// `CapacityUnavailable`) returns immediately.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, MorpheusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MorpheusError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(MorpheusError::TransientNetwork(msg)) => {
                if attempt >= BACKOFF.len() {
                    return Err(MorpheusError::TransientNetwork(msg));
                }
                let delay = BACKOFF[attempt];
                warn!(attempt, delay_secs = delay.as_secs(), %msg, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
