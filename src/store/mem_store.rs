//! In-process store with etcd-compatible revision, lease and watch semantics.
//!
//! Every mutation bumps a single global revision; all writes of one
//! transaction share it. Leases expire on a background reaper (and lazily on
//! every call), deleting their keys in one revision. Watches replay history
//! from a start revision unless it has been compacted.
//!
//! [`MemStore::set_available`] simulates a silently dropped connection:
//! requests fail with `Unavailable` while open watch streams stay open but
//! receive nothing.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tonic::async_trait;
use tonic::Code;
use tracing::debug;
use tracing::trace;

use super::CompareTarget;
use super::DeleteRequest;
use super::DeleteResponse;
use super::EventType;
use super::KeyValue;
use super::LeaseGrant;
use super::LeaseId;
use super::PutRequest;
use super::PutResponse;
use super::RangeEnd;
use super::RangeRequest;
use super::RangeResponse;
use super::SortOrder;
use super::StoreClient;
use super::StoreResult;
use super::TxnOp;
use super::TxnOpResponse;
use super::TxnRequest;
use super::TxnResponse;
use super::WatchEvent;
use super::WatchRequest;
use super::WatchStream;
use crate::constants::MAX_LEASE_TTL_IN_SECS;
use crate::utils::deadline::instant_after_secs;
use crate::Compare;
use crate::StoreError;

const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct MemStore {
    inner: Arc<MemStoreInner>,
}

struct MemStoreInner {
    state: Mutex<State>,
    available: AtomicBool,
    reaper_started: AtomicBool,
    reap_interval: Duration,
}

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<Bytes>,
}

struct Watcher {
    key: Bytes,
    range_end: RangeEnd,
    sender: mpsc::UnboundedSender<StoreResult<Vec<WatchEvent>>>,
}

impl Watcher {
    fn matching(
        &self,
        events: &[WatchEvent],
    ) -> Vec<WatchEvent> {
        events
            .iter()
            .filter(|e| self.range_end.contains(&self.key, &e.kv.key))
            .cloned()
            .collect()
    }
}

struct State {
    revision: i64,
    compacted: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<Bytes, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl State {
    fn new() -> Self {
        Self {
            revision: 1,
            compacted: 0,
            next_lease: 1,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            history: Vec::new(),
            watchers: Vec::new(),
        }
    }

    fn keys_in(
        &self,
        key: &Bytes,
        range_end: &RangeEnd,
    ) -> Vec<Bytes> {
        self.kvs
            .range::<[u8], _>((Bound::Included(key.as_ref()), Bound::Unbounded))
            .take_while(|(k, _)| range_end.contains(key, k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn range(
        &self,
        request: &RangeRequest,
    ) -> RangeResponse {
        let mut kvs: Vec<KeyValue> = self
            .keys_in(&request.key, &request.range_end)
            .iter()
            .filter_map(|k| self.kvs.get(k))
            .filter(|kv| match request.max_create_revision {
                Some(max) => kv.create_revision <= max,
                None => true,
            })
            .cloned()
            .collect();
        let count = kvs.len() as i64;

        match request.sort_by_create {
            Some(SortOrder::Ascend) => kvs.sort_by_key(|kv| kv.create_revision),
            Some(SortOrder::Descend) => kvs.sort_by(|a, b| b.create_revision.cmp(&a.create_revision)),
            None => {}
        }
        if let Some(limit) = request.limit.filter(|l| *l > 0) {
            kvs.truncate(limit);
        }

        RangeResponse {
            kvs,
            count,
            revision: self.revision,
        }
    }

    fn compare(
        &self,
        compare: &Compare,
    ) -> bool {
        let op = compare.op;
        match (self.kvs.get(&compare.key), &compare.target) {
            // A missing key never matches a value compare
            (None, CompareTarget::Value(_)) => false,
            (None, CompareTarget::CreateRevision(r))
            | (None, CompareTarget::ModRevision(r))
            | (None, CompareTarget::Version(r)) => op.holds(&0, r),
            (Some(kv), CompareTarget::Value(v)) => op.holds::<[u8]>(kv.value.as_ref(), v.as_ref()),
            (Some(kv), CompareTarget::CreateRevision(r)) => op.holds(&kv.create_revision, r),
            (Some(kv), CompareTarget::ModRevision(r)) => op.holds(&kv.mod_revision, r),
            (Some(kv), CompareTarget::Version(r)) => op.holds(&kv.version, r),
        }
    }

    fn evaluate(
        &self,
        compares: &[Compare],
    ) -> bool {
        compares.iter().all(|c| self.compare(c))
    }

    fn check_put(
        &self,
        request: &PutRequest,
    ) -> StoreResult<()> {
        if request.key.is_empty() {
            return Err(StoreError::status(Code::InvalidArgument, "key is not provided"));
        }
        match request.lease.filter(|l| *l != 0) {
            Some(lease) if !self.leases.contains_key(&lease) => {
                Err(StoreError::status(Code::NotFound, "requested lease not found"))
            }
            _ => Ok(()),
        }
    }

    /// Validates the branch a transaction is going to take before any write
    /// is applied, so a rejected put never leaves the transaction half done.
    fn check_txn(
        &self,
        request: &TxnRequest,
    ) -> StoreResult<()> {
        let ops = if self.evaluate(&request.compare) {
            &request.success
        } else {
            &request.failure
        };
        for op in ops {
            match op {
                TxnOp::Put(put) => self.check_put(put)?,
                TxnOp::Txn(nested) => self.check_txn(nested)?,
                TxnOp::Range(_) | TxnOp::Delete(_) => {}
            }
        }
        Ok(())
    }

    fn detach(
        &mut self,
        lease: LeaseId,
        key: &Bytes,
    ) {
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.remove(key);
        }
    }

    fn put_kv(
        &mut self,
        request: &PutRequest,
        revision: i64,
        events: &mut Vec<WatchEvent>,
    ) {
        let lease = request.lease.unwrap_or(0);
        let (create_revision, version, prev_lease) = match self.kvs.get(&request.key) {
            Some(prev) => (prev.create_revision, prev.version + 1, prev.lease),
            None => (revision, 1, 0),
        };
        if prev_lease != 0 && prev_lease != lease {
            self.detach(prev_lease, &request.key);
        }
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.insert(request.key.clone());
        }

        let kv = KeyValue {
            key: request.key.clone(),
            value: request.value.clone(),
            create_revision,
            mod_revision: revision,
            version,
            lease,
        };
        self.kvs.insert(kv.key.clone(), kv.clone());
        events.push(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
    }

    fn delete_range(
        &mut self,
        key: &Bytes,
        range_end: &RangeEnd,
        revision: i64,
        events: &mut Vec<WatchEvent>,
    ) -> i64 {
        let keys = self.keys_in(key, range_end);
        for k in &keys {
            if let Some(kv) = self.kvs.remove(k) {
                if kv.lease != 0 {
                    self.detach(kv.lease, k);
                }
                events.push(WatchEvent {
                    event_type: EventType::Delete,
                    kv: KeyValue {
                        key: kv.key,
                        mod_revision: revision,
                        ..Default::default()
                    },
                });
            }
        }
        keys.len() as i64
    }

    fn apply_txn(
        &mut self,
        request: &TxnRequest,
        revision: i64,
        events: &mut Vec<WatchEvent>,
    ) -> TxnResponse {
        let succeeded = self.evaluate(&request.compare);
        let ops = if succeeded {
            &request.success
        } else {
            &request.failure
        };

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                TxnOp::Range(range) => TxnOpResponse::Range(self.range(range)),
                TxnOp::Put(put) => {
                    self.put_kv(put, revision, events);
                    TxnOpResponse::Put(PutResponse { revision })
                }
                TxnOp::Delete(delete) => {
                    let deleted = self.delete_range(&delete.key, &delete.range_end, revision, events);
                    TxnOpResponse::Delete(DeleteResponse { deleted, revision })
                }
                TxnOp::Txn(nested) => TxnOpResponse::Txn(self.apply_txn(nested, revision, events)),
            };
            responses.push(response);
        }

        TxnResponse {
            succeeded,
            responses,
            revision,
        }
    }

    /// Publishes the events produced at `revision`; a batch without events
    /// leaves the revision untouched.
    fn commit(
        &mut self,
        revision: i64,
        events: Vec<WatchEvent>,
        deliver: bool,
    ) {
        if events.is_empty() {
            return;
        }
        self.revision = revision;
        self.history.extend(events.iter().cloned());

        if deliver {
            self.watchers.retain(|w| {
                let batch = w.matching(&events);
                batch.is_empty() || w.sender.send(Ok(batch)).is_ok()
            });
        }
    }

    fn expire_leases(
        &mut self,
        now: Instant,
        deliver: bool,
    ) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }

        let revision = self.revision + 1;
        let mut events = Vec::new();
        for id in expired {
            if let Some(entry) = self.leases.remove(&id) {
                debug!(lease_id = id, keys = entry.keys.len(), "lease expired");
                for key in entry.keys {
                    self.delete_range(&key, &RangeEnd::Single, revision, &mut events);
                }
            }
        }
        self.commit(revision, events, deliver);
    }

    fn open_watch(
        &mut self,
        request: WatchRequest,
    ) -> StoreResult<WatchStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let watcher = Watcher {
            key: request.key,
            range_end: request.range_end,
            sender,
        };

        if let Some(start) = request.start_revision.filter(|r| *r > 0) {
            if start < self.compacted {
                return Err(StoreError::Compacted {
                    requested: start,
                    compacted: self.compacted,
                });
            }

            // Replay one batch per revision
            let replay: Vec<WatchEvent> = self
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= start)
                .cloned()
                .collect();
            let mut batch: Vec<WatchEvent> = Vec::new();
            for event in watcher.matching(&replay) {
                if let Some(last) = batch.last() {
                    if last.kv.mod_revision != event.kv.mod_revision {
                        let _ = watcher.sender.send(Ok(std::mem::take(&mut batch)));
                    }
                }
                batch.push(event);
            }
            if !batch.is_empty() {
                let _ = watcher.sender.send(Ok(batch));
            }
        }

        self.watchers.push(watcher);
        Ok(WatchStream::new(receiver))
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_reap_interval(DEFAULT_REAP_INTERVAL)
    }

    /// Store whose background reaper checks lease deadlines every `interval`
    pub fn with_reap_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(MemStoreInner {
                state: Mutex::new(State::new()),
                available: AtomicBool::new(true),
                reaper_started: AtomicBool::new(false),
                reap_interval: interval,
            }),
        }
    }

    /// Simulates losing (or regaining) connectivity to the store.
    ///
    /// While unavailable every request fails with `Unavailable` and watch
    /// streams stay open without delivering events.
    pub fn set_available(
        &self,
        available: bool,
    ) {
        debug!(available, "mem store availability changed");
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Drops watch history before `revision`
    pub fn compact(
        &self,
        revision: i64,
    ) {
        let mut state = self.inner.state.lock();
        let revision = revision.min(state.revision);
        state.history.retain(|e| e.kv.mod_revision >= revision);
        state.compacted = state.compacted.max(revision);
        debug!(revision, "mem store compacted");
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::unavailable())
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut State) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        state.expire_leases(Instant::now(), true);
        f(&mut state)
    }

    fn ensure_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<MemStoreInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.reap_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    trace!("mem store dropped, lease reaper exits");
                    break;
                };
                let deliver = inner.available.load(Ordering::SeqCst);
                inner.state.lock().expire_leases(Instant::now(), deliver);
            }
        });
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemStore {
    async fn range(
        &self,
        request: RangeRequest,
    ) -> StoreResult<RangeResponse> {
        if request.key.is_empty() && request.range_end == RangeEnd::Single {
            return Err(StoreError::status(Code::InvalidArgument, "key is not provided"));
        }
        self.with_state(|state| Ok(state.range(&request)))
    }

    async fn put(
        &self,
        request: PutRequest,
    ) -> StoreResult<PutResponse> {
        self.with_state(|state| {
            state.check_put(&request)?;
            let revision = state.revision + 1;
            let mut events = Vec::with_capacity(1);
            state.put_kv(&request, revision, &mut events);
            state.commit(revision, events, true);
            Ok(PutResponse { revision })
        })
    }

    async fn delete(
        &self,
        request: DeleteRequest,
    ) -> StoreResult<DeleteResponse> {
        self.with_state(|state| {
            let revision = state.revision + 1;
            let mut events = Vec::new();
            let deleted = state.delete_range(&request.key, &request.range_end, revision, &mut events);
            state.commit(revision, events, true);
            Ok(DeleteResponse {
                deleted,
                revision: state.revision,
            })
        })
    }

    async fn txn(
        &self,
        request: TxnRequest,
    ) -> StoreResult<TxnResponse> {
        self.with_state(|state| {
            state.check_txn(&request)?;
            let revision = state.revision + 1;
            let mut events = Vec::new();
            let mut response = state.apply_txn(&request, revision, &mut events);
            state.commit(revision, events, true);
            response.revision = state.revision;
            Ok(response)
        })
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> StoreResult<WatchStream> {
        self.with_state(|state| state.open_watch(request))
    }

    async fn lease_grant(
        &self,
        ttl: i64,
    ) -> StoreResult<LeaseGrant> {
        if ttl <= 0 {
            return Err(StoreError::status(Code::InvalidArgument, format!("invalid lease ttl {ttl}")));
        }
        if ttl > MAX_LEASE_TTL_IN_SECS {
            return Err(StoreError::status(Code::OutOfRange, "too large lease ttl"));
        }
        let grant = self.with_state(|state| {
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline: instant_after_secs(Instant::now(), ttl),
                    keys: BTreeSet::new(),
                },
            );
            Ok(LeaseGrant { id, ttl })
        })?;
        self.ensure_reaper();
        Ok(grant)
    }

    async fn lease_keep_alive(
        &self,
        id: LeaseId,
    ) -> StoreResult<i64> {
        self.with_state(|state| match state.leases.get_mut(&id) {
            Some(entry) => {
                entry.deadline = instant_after_secs(Instant::now(), entry.ttl);
                Ok(entry.ttl)
            }
            None => Ok(0),
        })
    }

    async fn lease_revoke(
        &self,
        id: LeaseId,
    ) -> StoreResult<()> {
        self.with_state(|state| {
            let entry = state
                .leases
                .remove(&id)
                .ok_or_else(|| StoreError::status(Code::NotFound, "requested lease not found"))?;
            let revision = state.revision + 1;
            let mut events = Vec::new();
            for key in entry.keys {
                state.delete_range(&key, &RangeEnd::Single, revision, &mut events);
            }
            state.commit(revision, events, true);
            Ok(())
        })
    }

    async fn close(&self) {
        let mut state = self.inner.state.lock();
        // Ends every open watch stream
        state.watchers.clear();
    }
}
