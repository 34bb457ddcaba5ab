//! Millisecond timeouts as they arrive at the boundary

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::StoreError;

/// `0` means "no deadline"
pub fn optional_timeout(timeout_in_ms: u64) -> Option<Duration> {
    (timeout_in_ms > 0).then(|| Duration::from_millis(timeout_in_ms))
}

/// Runs `fut` under `timeout`, reporting expiry as
/// [`StoreError::DeadlineExceeded`]. Without a timeout the future runs to
/// completion.
pub async fn with_deadline<T, E, F>(
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| E::from(StoreError::DeadlineExceeded(limit)))?,
        None => fut.await,
    }
}

/// `now + secs`, saturating instead of overflowing the clock
pub(crate) fn instant_after_secs(
    now: Instant,
    secs: i64,
) -> Instant {
    let ttl = Duration::from_secs(secs.max(0) as u64);
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

// Roughly thirty years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
