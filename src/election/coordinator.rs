use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::Election;
use crate::constants::PROBE_DIVISOR;
use crate::registry::Handle;
use crate::registry::ManagedObject;
use crate::registry::ObjectRegistry;
use crate::session::SessionManager;
use crate::store::KeyValue;
use crate::store::RangeRequest;
use crate::store::StoreClient;
use crate::utils::deadline::with_deadline;
use crate::ElectionConfig;
use crate::ElectionError;
use crate::Result;

/// Why an observe call returned without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
    /// Leader value now in place, `None` if the election is vacant
    pub leader: Option<Bytes>,
}

/// Drives campaign, observe and resign on behalf of boundary callers
///
/// Elections won here are parked in the shared [`ObjectRegistry`]; callers
/// refer to them by handle afterwards.
#[derive(Clone)]
pub struct ElectionCoordinator {
    store: Arc<dyn StoreClient>,
    registry: Arc<ObjectRegistry>,
    sessions: SessionManager,
    probe_key: Bytes,
    request_timeout: Duration,
}

impl ElectionCoordinator {
    pub fn new(
        store: Arc<dyn StoreClient>,
        registry: Arc<ObjectRegistry>,
        config: &ElectionConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            sessions: SessionManager::new(
                store.clone(),
                Duration::from_millis(config.keepalive_retry_interval_in_ms),
            ),
            store,
            registry,
            probe_key: Bytes::from(config.probe_key.clone()),
            request_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Campaigns for `prefix` as `candidate` on a fresh session.
    ///
    /// Blocks until elected, `timeout` elapses (`None` waits forever), or
    /// `cancel` fires. On success the election is stored in the registry and
    /// its handle returned; on failure nothing is registered and the session
    /// is revoked.
    #[instrument(skip(self, candidate, cancel), fields(handle))]
    pub async fn campaign(
        &self,
        prefix: &str,
        candidate: &[u8],
        ttl_secs: i64,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Handle> {
        let started = Instant::now();
        let candidate_name = String::from_utf8_lossy(candidate).into_owned();

        let session = self.sessions.create_session(ttl_secs).await.map_err(|e| {
            warn!(candidate = %candidate_name, "new session failed: {}", e);
            e
        })?;
        let election = Arc::new(Election::new(self.store.clone(), session, prefix));

        // Diagnostic only
        match tokio::time::timeout(self.request_timeout, election.leader()).await {
            Ok(Ok(kv)) => info!(prefix, leader = %String::from_utf8_lossy(&kv.value), "current leader"),
            Ok(Err(e)) => info!(prefix, "get current leader failed: {}", e),
            Err(_) => info!(prefix, "get current leader timed out"),
        }

        info!(prefix, candidate = %candidate_name, "campaign for leader begin");
        match election.campaign(candidate, timeout, &cancel).await {
            Ok(()) => {
                let handle = self.registry.allocate(ManagedObject::ElectionHandle(election));
                tracing::Span::current().record("handle", handle);
                info!(
                    candidate = %candidate_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "campaign for leader success"
                );
                Ok(handle)
            }
            Err(e) => {
                warn!(
                    candidate = %candidate_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "campaign failed: {}",
                    e
                );
                match tokio::time::timeout(self.request_timeout, election.abandon()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(release)) => debug!("session release after failed campaign: {}", release),
                    Err(_) => debug!("session release after failed campaign timed out"),
                }
                Err(e)
            }
        }
    }

    /// Watches leadership of the election behind `handle` until it moves
    /// away from `candidate`.
    ///
    /// The change stream is raced against a probe issued every
    /// `heartbeat / 5`; a watch on a dead connection can stay silent forever,
    /// the probe cannot. Returns `Ok` on a leadership change and an error
    /// when the stream closes or a probe fails. Never retries.
    pub async fn observe(
        &self,
        handle: Handle,
        candidate: &[u8],
        heartbeat: Duration,
    ) -> Result<LeaderChange> {
        let election = self.registry.lookup_election(handle)?;
        let candidate_name = String::from_utf8_lossy(candidate).into_owned();
        info!(handle, prefix = election.prefix(), candidate = %candidate_name, "start observe");

        let mut observer = election.observe();
        let period = (heartbeat / PROBE_DIVISOR as u32).max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                update = observer.recv() => match update {
                    None => {
                        warn!(handle, "observe channel closed prematurely");
                        return Err(ElectionError::ObserverClosed.into());
                    }
                    Some(Some(kv)) if kv.value.as_ref() == candidate => {
                        trace!(handle, "leader unchanged");
                    }
                    Some(current) => {
                        let leader = current.map(|kv: KeyValue| kv.value);
                        info!(
                            handle,
                            now = ?leader.as_ref().map(|v| String::from_utf8_lossy(v).into_owned()),
                            expect = %candidate_name,
                            "leader changed"
                        );
                        election.mark_leader_lost();
                        return Ok(LeaderChange { leader });
                    }
                },
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let probe = RangeRequest::single(&self.probe_key);
                    if let Err(e) = with_deadline(Some(heartbeat), self.store.range(probe)).await {
                        warn!(handle, "observe hung since {:?} ago: {}", started.elapsed(), e);
                        return Err(ElectionError::ProbeFailed(e).into());
                    }
                }
            }
        }
    }

    /// Current leader value of the election behind `handle`.
    pub async fn leader(
        &self,
        handle: Handle,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let election = self.registry.lookup_election(handle)?;
        let kv = with_deadline(timeout, election.leader()).await?;
        Ok(kv.value)
    }

    /// Resigns the election behind `handle`.
    ///
    /// Reads the current leader, then deletes this candidate's entry under a
    /// create-revision guard and releases the session. The handle stays
    /// registered either way.
    #[instrument(skip(self))]
    pub async fn resign(
        &self,
        handle: Handle,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let election = self.registry.lookup_election(handle)?;

        with_deadline(timeout, async {
            let leader = election.leader().await.map_err(|e| {
                warn!(handle, "read leader before resign failed: {}", e);
                e
            })?;
            let name = String::from_utf8_lossy(&leader.value).into_owned();

            match election.resign().await {
                Ok(()) => {
                    info!(handle, leader = %name, "resign leader success");
                    Ok(())
                }
                Err(e) => {
                    warn!(handle, leader = %name, "resign leader failed: {}", e);
                    Err(e)
                }
            }
        })
        .await
    }
}
