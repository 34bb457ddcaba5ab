//! Leader election over a key prefix
//!
//! Every candidate writes one entry `<prefix>/<lease id in hex>` bound to its
//! session lease. The store orders entries by create revision; the entry with
//! the smallest create revision among the live ones is the leader. A
//! candidate is elected once every entry created before its own is gone.
//!
//! ```text
//! Idle -> Campaigning -> Leader -> { Resigned, LeaderLost } -> Closed
//! ```
//!
//! [`Election`] holds the state machine for a single attempt;
//! [`ElectionCoordinator`] wires sessions, elections and the object registry
//! together.

mod coordinator;

pub use coordinator::*;

#[cfg(test)]
mod coordinator_test;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::constants::ELECTION_KEY_SEPARATOR;
use crate::session::Session;
use crate::store::Compare;
use crate::store::CompareOp;
use crate::store::DeleteRequest;
use crate::store::EventType;
use crate::store::KeyValue;
use crate::store::PutRequest;
use crate::store::RangeRequest;
use crate::store::SortOrder;
use crate::store::StoreClient;
use crate::store::TxnOp;
use crate::store::TxnOpResponse;
use crate::store::TxnRequest;
use crate::store::WatchRequest;
use crate::ElectionError;
use crate::Result;
use crate::StoreError;

/// Capacity of the observer channel
const OBSERVE_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Campaigning,
    Leader,
    Resigned,
    LeaderLost,
    Closed,
}

impl ElectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionState::Idle => "Idle",
            ElectionState::Campaigning => "Campaigning",
            ElectionState::Leader => "Leader",
            ElectionState::Resigned => "Resigned",
            ElectionState::LeaderLost => "LeaderLost",
            ElectionState::Closed => "Closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ElectionState::Resigned | ElectionState::LeaderLost | ElectionState::Closed
        )
    }
}

/// This candidate's entry under the election prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderKey {
    pub key: Bytes,
    pub create_revision: i64,
    pub value: Bytes,
}

/// One leadership attempt on one election prefix
///
/// Owns the session it campaigns with; the session is never shared with
/// another election.
pub struct Election {
    store: Arc<dyn StoreClient>,
    session: Session,
    prefix: String,
    key_prefix: String,
    leader_key: Mutex<Option<LeaderKey>>,
    state: Mutex<ElectionState>,
}

impl Election {
    pub fn new(
        store: Arc<dyn StoreClient>,
        session: Session,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let key_prefix = format!("{}{}", prefix, ELECTION_KEY_SEPARATOR);
        Self {
            store,
            session,
            prefix,
            key_prefix,
            leader_key: Mutex::new(None),
            state: Mutex::new(ElectionState::Idle),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Entry written by this candidate, once it has campaigned
    pub fn leader_key(&self) -> Option<LeaderKey> {
        self.leader_key.lock().clone()
    }

    /// Current state; a leader whose session was lost reports `LeaderLost`.
    pub fn state(&self) -> ElectionState {
        let state = *self.state.lock();
        if state == ElectionState::Leader && self.session.is_lost() {
            ElectionState::LeaderLost
        } else {
            state
        }
    }

    fn transition(
        &self,
        from: ElectionState,
        to: ElectionState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(ElectionError::InvalidState {
                expected: from.as_str(),
                actual: state.as_str(),
            }
            .into());
        }
        debug!(prefix = %self.prefix, from = from.as_str(), to = to.as_str(), "election state change");
        *state = to;
        Ok(())
    }

    fn set_state(
        &self,
        to: ElectionState,
    ) {
        let mut state = self.state.lock();
        debug!(prefix = %self.prefix, from = state.as_str(), to = to.as_str(), "election state change");
        *state = to;
    }

    /// Campaigns with `value` until elected.
    ///
    /// Returns early with an error when `timeout` elapses, `cancel` fires,
    /// the session is lost, or the store fails in a way the wait cannot
    /// recover from (e.g. the history it waits on was compacted). A failed
    /// campaign leaves the election `Closed`; its entry disappears with the
    /// session lease.
    pub async fn campaign(
        &self,
        value: &[u8],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.transition(ElectionState::Idle, ElectionState::Campaigning)?;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            r = self.run_campaign(value) => r,
            _ = cancel.cancelled() => Err(ElectionError::Canceled("campaign").into()),
            _ = self.session.lost() => Err(ElectionError::SessionLost("campaign").into()),
            _ = deadline => Err(ElectionError::Timeout(timeout.unwrap_or_default()).into()),
        };

        match outcome {
            Ok(()) => {
                self.set_state(ElectionState::Leader);
                Ok(())
            }
            Err(e) => {
                self.set_state(ElectionState::Closed);
                Err(e)
            }
        }
    }

    async fn run_campaign(
        &self,
        value: &[u8],
    ) -> Result<()> {
        let lease = self.session.lease_id();
        let key = format!("{}{:x}", self.key_prefix, lease);

        // Create the entry, or read back the one this lease already owns
        let txn = TxnRequest::new()
            .when([Compare::create_revision(&key, CompareOp::Equal, 0)])
            .and_then([TxnOp::Put(PutRequest::new(&key, value).with_lease(lease))])
            .or_else([TxnOp::Range(RangeRequest::single(&key))]);
        let resp = self.store.txn(txn).await?;

        let mut create_revision = resp.revision;
        if !resp.succeeded {
            let existing = match resp.responses.first() {
                Some(TxnOpResponse::Range(range)) => range.kvs.first().cloned(),
                _ => None,
            }
            .ok_or_else(|| StoreError::status(Code::Internal, format!("entry {key} vanished during campaign")))?;

            create_revision = existing.create_revision;
            if existing.value.as_ref() != value {
                self.store.put(PutRequest::new(&key, value).with_lease(lease)).await?;
            }
        }

        *self.leader_key.lock() = Some(LeaderKey {
            key: Bytes::from(key.clone()),
            create_revision,
            value: Bytes::copy_from_slice(value),
        });
        debug!(key = %key, create_revision, "campaign entry written, waiting for predecessors");

        self.wait_predecessors(create_revision - 1).await
    }

    /// Blocks until no entry created at or before `max_revision` remains.
    async fn wait_predecessors(
        &self,
        max_revision: i64,
    ) -> Result<()> {
        loop {
            let request = RangeRequest::prefix(&self.key_prefix)
                .with_create_sort(SortOrder::Descend)
                .with_limit(1)
                .with_max_create_revision(max_revision);
            let resp = self.store.range(request).await?;

            let Some(last) = resp.kvs.first() else {
                return Ok(());
            };
            trace!(key = ?last.key, "waiting for predecessor to go away");
            self.wait_delete(last, resp.revision).await?;
        }
    }

    async fn wait_delete(
        &self,
        kv: &KeyValue,
        revision: i64,
    ) -> Result<()> {
        let mut stream = self
            .store
            .watch(WatchRequest::key(&kv.key).with_start_revision(revision))
            .await?;
        loop {
            match stream.message().await? {
                Some(events) => {
                    if events.iter().any(|e| e.event_type == EventType::Delete) {
                        return Ok(());
                    }
                }
                None => return Err(StoreError::WatchClosed.into()),
            }
        }
    }

    /// Current leader entry: the live entry with the smallest create revision.
    pub async fn leader(&self) -> Result<KeyValue> {
        let request = RangeRequest::prefix(&self.key_prefix)
            .with_create_sort(SortOrder::Ascend)
            .with_limit(1);
        let resp = self.store.range(request).await?;
        resp.kvs
            .into_iter()
            .next()
            .ok_or_else(|| ElectionError::NoLeader(self.prefix.clone()).into())
    }

    /// Streams leadership updates for this prefix.
    ///
    /// Yields `Some(entry)` for the current leader and every change of it,
    /// and `None` while nobody holds the election. The channel closes when
    /// the underlying watch fails; dropping the receiver stops the
    /// background task.
    pub fn observe(&self) -> mpsc::Receiver<Option<KeyValue>> {
        let (tx, rx) = mpsc::channel(OBSERVE_BUFFER);
        let store = self.store.clone();
        let key_prefix = self.key_prefix.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                r = observe_leader(store.as_ref(), &key_prefix, &tx) => r,
                _ = tx.closed() => Ok(()),
            };
            match outcome {
                Ok(()) => trace!(prefix = %key_prefix, "observer stopped"),
                Err(e) => debug!(prefix = %key_prefix, "observer ended: {}", e),
            }
        });

        rx
    }

    /// Deletes this candidate's entry if it is still the one written by the
    /// campaign, then releases the session.
    pub async fn resign(&self) -> Result<()> {
        let leader = self.leader_key().ok_or_else(|| ElectionError::InvalidState {
            expected: ElectionState::Leader.as_str(),
            actual: self.state().as_str(),
        })?;

        let txn = TxnRequest::new()
            .when([Compare::create_revision(&leader.key, CompareOp::Equal, leader.create_revision)])
            .and_then([TxnOp::Delete(DeleteRequest::single(&leader.key))]);
        let resp = self.store.txn(txn).await?;
        if !resp.succeeded {
            return Err(ElectionError::NotLeader(self.prefix.clone()).into());
        }

        *self.leader_key.lock() = None;
        self.set_state(ElectionState::Resigned);
        info!(prefix = %self.prefix, key = ?leader.key, "resigned leadership");

        if let Err(e) = self.session.close().await {
            debug!(lease_id = self.session.lease_id(), "session release after resign failed: {}", e);
        }
        Ok(())
    }

    /// Records that leadership moved away from this candidate.
    pub(crate) fn mark_leader_lost(&self) {
        let mut state = self.state.lock();
        if *state == ElectionState::Leader {
            *state = ElectionState::LeaderLost;
        }
    }

    /// Revokes the session of a campaign that did not succeed.
    pub(crate) async fn abandon(&self) -> Result<()> {
        self.set_state(ElectionState::Closed);
        self.session.close().await?;
        Ok(())
    }

    /// Terminal transition when the registry lets go of the election.
    pub(crate) fn close(&self) {
        self.set_state(ElectionState::Closed);
        self.session.stop_keepalive();
    }
}

impl std::fmt::Debug for Election {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Election")
            .field("prefix", &self.prefix)
            .field("state", &self.state())
            .field("session", &self.session)
            .finish()
    }
}

async fn observe_leader(
    store: &dyn StoreClient,
    key_prefix: &str,
    tx: &mpsc::Sender<Option<KeyValue>>,
) -> std::result::Result<(), StoreError> {
    let mut last: Option<Option<Bytes>> = None;

    loop {
        let first = RangeRequest::prefix(key_prefix)
            .with_create_sort(SortOrder::Ascend)
            .with_limit(1);
        let resp = store.range(first).await?;

        // Watch from the revision the leader was read at, not from the
        // entry's own mod revision, which may be compacted away
        let (leader, watch_from) = match resp.kvs.into_iter().next() {
            Some(kv) => (kv, resp.revision + 1),
            None => {
                if last != Some(None) {
                    tx.send(None).await.map_err(|_| StoreError::Canceled)?;
                    last = Some(None);
                }
                let kv = wait_first_put(store, key_prefix, resp.revision + 1).await?;
                let put_revision = kv.mod_revision;
                (kv, put_revision + 1)
            }
        };

        if last.as_ref() != Some(&Some(leader.value.clone())) {
            last = Some(Some(leader.value.clone()));
            tx.send(Some(leader.clone())).await.map_err(|_| StoreError::Canceled)?;
        }

        // Follow the leader entry until it goes away
        let mut stream = store
            .watch(WatchRequest::key(&leader.key).with_start_revision(watch_from))
            .await?;
        'follow: loop {
            let Some(events) = stream.message().await? else {
                return Err(StoreError::WatchClosed);
            };
            for event in events {
                match event.event_type {
                    EventType::Put => {
                        if last.as_ref() != Some(&Some(event.kv.value.clone())) {
                            last = Some(Some(event.kv.value.clone()));
                            tx.send(Some(event.kv)).await.map_err(|_| StoreError::Canceled)?;
                        }
                    }
                    EventType::Delete => break 'follow,
                }
            }
        }
    }
}

/// Waits for the first entry created under `key_prefix` from `revision` on.
async fn wait_first_put(
    store: &dyn StoreClient,
    key_prefix: &str,
    revision: i64,
) -> std::result::Result<KeyValue, StoreError> {
    let mut stream = store
        .watch(WatchRequest::prefix(key_prefix).with_start_revision(revision))
        .await?;
    loop {
        let Some(events) = stream.message().await? else {
            return Err(StoreError::WatchClosed);
        };
        if let Some(event) = events.into_iter().find(|e| e.event_type == EventType::Put) {
            return Ok(event.kv);
        }
    }
}
