use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lease identifier assigned by the store
pub type LeaseId = i64;

/// A stored key with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
    /// Revision at which the key was (last) created
    pub create_revision: i64,
    /// Revision of the last modification
    pub mod_revision: i64,
    /// Number of modifications since creation
    pub version: i64,
    /// Attached lease, 0 if none
    pub lease: LeaseId,
}

/// How far a request reaches beyond its start key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RangeEnd {
    /// Only the start key
    #[default]
    Single,
    /// Every key starting with the start key
    Prefix,
    /// Every key greater than or equal to the start key
    FromKey,
    /// Keys in `[start, end)`
    Until(Bytes),
}

impl RangeEnd {
    pub(crate) fn contains(
        &self,
        start: &[u8],
        key: &[u8],
    ) -> bool {
        match self {
            RangeEnd::Single => key == start,
            RangeEnd::Prefix => key.starts_with(start),
            RangeEnd::FromKey => key >= start,
            RangeEnd::Until(end) => key >= start && key < end.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascend,
    Descend,
}

/// Range read
///
/// Results are ordered by key unless a create-revision sort is requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeRequest {
    pub key: Bytes,
    pub range_end: RangeEnd,
    /// Maximum number of entries returned, `None` for all
    pub limit: Option<usize>,
    /// Sort by create revision
    pub sort_by_create: Option<SortOrder>,
    /// Ignore keys created after this revision
    pub max_create_revision: Option<i64>,
}

impl RangeRequest {
    pub fn single(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(prefix.as_ref()),
            range_end: RangeEnd::Prefix,
            ..Default::default()
        }
    }

    pub fn from_key(start: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(start.as_ref()),
            range_end: RangeEnd::FromKey,
            ..Default::default()
        }
    }

    pub fn between(
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            key: Bytes::copy_from_slice(start.as_ref()),
            range_end: RangeEnd::Until(Bytes::copy_from_slice(end.as_ref())),
            ..Default::default()
        }
    }

    pub fn with_limit(
        mut self,
        limit: usize,
    ) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_create_sort(
        mut self,
        order: SortOrder,
    ) -> Self {
        self.sort_by_create = Some(order);
        self
    }

    pub fn with_max_create_revision(
        mut self,
        revision: i64,
    ) -> Self {
        self.max_create_revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// Number of keys in range, ignoring `limit`
    pub count: i64,
    /// Store revision at which the read was served
    pub revision: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
    pub lease: Option<LeaseId>,
}

impl PutRequest {
    pub fn new(
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
            lease: None,
        }
    }

    pub fn with_lease(
        mut self,
        lease: LeaseId,
    ) -> Self {
        self.lease = Some(lease);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub revision: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: Bytes,
    pub range_end: RangeEnd,
}

impl DeleteRequest {
    pub fn single(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            range_end: RangeEnd::Single,
        }
    }

    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(prefix.as_ref()),
            range_end: RangeEnd::Prefix,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub deleted: i64,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    pub(crate) fn holds<T: Ord + ?Sized>(
        self,
        actual: &T,
        expected: &T,
    ) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Bytes),
    CreateRevision(i64),
    ModRevision(i64),
    Version(i64),
}

/// Predicate over the current state of a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: Bytes,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn value(
        key: impl AsRef<[u8]>,
        op: CompareOp,
        value: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            op,
            target: CompareTarget::Value(Bytes::copy_from_slice(value.as_ref())),
        }
    }

    pub fn create_revision(
        key: impl AsRef<[u8]>,
        op: CompareOp,
        revision: i64,
    ) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(
        key: impl AsRef<[u8]>,
        op: CompareOp,
        revision: i64,
    ) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(
        key: impl AsRef<[u8]>,
        op: CompareOp,
        version: i64,
    ) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            op,
            target: CompareTarget::Version(version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Range(RangeRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
    Txn(TxnRequest),
}

/// Compare-guarded transaction
///
/// `success` runs when every compare holds, `failure` otherwise. All writes of
/// the chosen branch are applied at a single revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(
        mut self,
        compare: impl IntoIterator<Item = Compare>,
    ) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn and_then(
        mut self,
        ops: impl IntoIterator<Item = TxnOp>,
    ) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(
        mut self,
        ops: impl IntoIterator<Item = TxnOp>,
    ) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Range(RangeResponse),
    Put(PutResponse),
    Delete(DeleteResponse),
    Txn(TxnResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change reported by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// For deletes only `key` and `mod_revision` are meaningful
    pub kv: KeyValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRequest {
    pub key: Bytes,
    pub range_end: RangeEnd,
    /// Replay history from this revision, `None` to start at the next one
    pub start_revision: Option<i64>,
}

impl WatchRequest {
    pub fn key(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(prefix.as_ref()),
            range_end: RangeEnd::Prefix,
            start_revision: None,
        }
    }

    pub fn with_start_revision(
        mut self,
        revision: i64,
    ) -> Self {
        self.start_revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: i64,
}

/// Batches of watch events, one batch per store revision
///
/// Dropping the stream cancels the watch on the store side.
pub struct WatchStream {
    inner: UnboundedReceiverStream<StoreResult<Vec<WatchEvent>>>,
}

impl WatchStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<StoreResult<Vec<WatchEvent>>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(receiver),
        }
    }

    /// Next batch of events; `Ok(None)` once the stream has ended
    pub async fn message(&mut self) -> StoreResult<Option<Vec<WatchEvent>>> {
        self.inner.next().await.transpose()
    }
}

impl std::fmt::Debug for WatchStream {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

impl Stream for WatchStream {
    type Item = StoreResult<Vec<WatchEvent>>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
