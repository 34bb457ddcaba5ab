//! Lease-bound sessions
//!
//! A [`Session`] wraps one store lease. While the session is open a
//! background task refreshes the lease every `ttl / 3`; when refreshing keeps
//! failing until the lease's own deadline, or the store reports the lease
//! gone, the session is marked lost and every waiter on
//! [`Session::lost`] wakes up.


use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep_until;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::constants::MAX_LEASE_TTL_IN_SECS;
use crate::constants::MIN_KEEPALIVE_INTERVAL_IN_MS;
use crate::store::LeaseId;
use crate::store::StoreClient;
use crate::utils::deadline::instant_after_secs;
use crate::SessionError;
use crate::StoreError;

pub struct Session {
    store: Arc<dyn StoreClient>,
    lease_id: LeaseId,
    ttl: i64,
    /// Stops the keepalive task
    stop: CancellationToken,
    /// Cancelled once the lease is known to be gone
    lost: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// ttl granted by the store, in seconds
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session lease is lost.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Stops refreshing the lease without revoking it.
    pub(crate) fn stop_keepalive(&self) {
        self.stop.cancel();
    }

    /// Revokes the lease and stops the keepalive task.
    ///
    /// Idempotent; a lease that already expired counts as revoked. When the
    /// revoke fails the lease keeps being refreshed and close may be retried.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.store.lease_revoke(self.lease_id).await {
            Ok(()) => {
                self.stop.cancel();
                debug!(lease_id = self.lease_id, "session closed");
                Ok(())
            }
            Err(StoreError::Status {
                code: Code::NotFound, ..
            }) => {
                self.stop.cancel();
                debug!(lease_id = self.lease_id, "session lease already gone");
                Ok(())
            }
            Err(e) => {
                self.closed.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease_id", &format_args!("{:x}", self.lease_id))
            .field("ttl", &self.ttl)
            .field("lost", &self.is_lost())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates sessions against a shared store connection
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn StoreClient>,
    retry_interval: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn StoreClient>,
        retry_interval: Duration,
    ) -> Self {
        Self { store, retry_interval }
    }

    /// Grants a lease with `ttl_secs` and starts refreshing it.
    pub async fn create_session(
        &self,
        ttl_secs: i64,
    ) -> Result<Session, SessionError> {
        if ttl_secs <= 0 || ttl_secs > MAX_LEASE_TTL_IN_SECS {
            return Err(SessionError::InvalidTtl(ttl_secs));
        }

        let grant = self
            .store
            .lease_grant(ttl_secs)
            .await
            .map_err(|source| SessionError::Grant { ttl: ttl_secs, source })?;

        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        tokio::spawn(keep_alive(
            self.store.clone(),
            grant.id,
            grant.ttl,
            self.retry_interval,
            stop.clone(),
            lost.clone(),
        ));
        info!(lease_id = grant.id, ttl = grant.ttl, "session created");

        Ok(Session {
            store: self.store.clone(),
            lease_id: grant.id,
            ttl: grant.ttl,
            stop,
            lost,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn close_session(
        &self,
        session: &Session,
    ) -> Result<(), StoreError> {
        session.close().await
    }
}

pub(crate) fn keepalive_period(ttl: i64) -> Duration {
    let third = Duration::from_millis((ttl.max(0) as u64).saturating_mul(1000) / 3);
    third.max(Duration::from_millis(MIN_KEEPALIVE_INTERVAL_IN_MS))
}

async fn keep_alive(
    store: Arc<dyn StoreClient>,
    lease_id: LeaseId,
    ttl: i64,
    retry_interval: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let period = keepalive_period(ttl);
    let mut deadline = instant_after_secs(Instant::now(), ttl);
    let mut next = Instant::now() + period;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                trace!(lease_id, "keepalive stopped");
                return;
            }
            _ = sleep_until(next) => {}
        }

        let result = tokio::select! {
            _ = stop.cancelled() => {
                trace!(lease_id, "keepalive stopped");
                return;
            }
            r = timeout_at(deadline, store.lease_keep_alive(lease_id)) => r,
        };

        let now = Instant::now();
        match result {
            Ok(Ok(remaining)) if remaining > 0 => {
                trace!(lease_id, remaining, "lease refreshed");
                deadline = instant_after_secs(now, remaining);
                next = now + period;
            }
            Ok(Ok(_)) => {
                warn!(lease_id, "lease no longer exists, session lost");
                lost.cancel();
                return;
            }
            Ok(Err(e)) if now < deadline => {
                warn!(lease_id, "lease refresh failed, retrying: {}", e);
                next = (now + retry_interval).min(deadline);
            }
            Ok(Err(e)) => {
                warn!(lease_id, "lease refresh failed past its deadline, session lost: {}", e);
                lost.cancel();
                return;
            }
            Err(_) => {
                warn!(lease_id, "lease deadline passed without a refresh, session lost");
                lost.cancel();
                return;
            }
        }
    }
}
