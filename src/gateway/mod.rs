//! Code-returning surface for callers across the boundary
//!
//! Every call returns an [`ErrorCode`] (or a `Result` whose error side is a
//! non-OK code); internal errors never leave this module. Multi-valued
//! results and won elections are parked in the [`ObjectRegistry`] and handed
//! out as handles.
//!
//! Timeouts are in milliseconds; `0` means the call has no deadline.

#[cfg(test)]
mod gateway_test;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::registry::Handle;
use crate::registry::ManagedObject;
use crate::registry::ObjectRegistry;
use crate::store::Compare;
use crate::store::CompareOp;
use crate::store::DeleteRequest;
use crate::store::KeyValue;
use crate::store::PutRequest;
use crate::store::RangeRequest;
use crate::store::StoreClient;
use crate::store::TxnOp;
use crate::store::TxnOpResponse;
use crate::store::TxnRequest;
use crate::utils::deadline::optional_timeout;
use crate::utils::deadline::with_deadline;
use crate::ElectionCoordinator;
use crate::Error;
use crate::ErrorCode;
use crate::Settings;
use crate::StoreError;

/// Kind of a single transaction operation as it arrives over the boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Put = 1,
    Delete = 2,
}

impl TryFrom<i32> for OpType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpType::Put),
            2 => Ok(OpType::Delete),
            other => Err(other),
        }
    }
}

/// One write of a [`Gateway::txn`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Raw [`OpType`] value; unknown values reject the whole transaction
    pub op_type: i32,
    pub key: Bytes,
    /// Ignored for deletes
    pub value: Bytes,
}

impl Operation {
    pub fn put(
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            op_type: OpType::Put as i32,
            key: Bytes::copy_from_slice(key.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
        }
    }

    pub fn delete(key: impl AsRef<[u8]>) -> Self {
        Self {
            op_type: OpType::Delete as i32,
            key: Bytes::copy_from_slice(key.as_ref()),
            value: Bytes::new(),
        }
    }
}

pub struct Gateway {
    store: Arc<dyn StoreClient>,
    registry: Arc<ObjectRegistry>,
    coordinator: ElectionCoordinator,
    settings: Settings,
}

impl Gateway {
    /// Gateway over `store` with default settings.
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self::with_settings(store, Settings::default())
    }

    pub fn with_settings(
        store: Arc<dyn StoreClient>,
        settings: Settings,
    ) -> Self {
        let registry = Arc::new(ObjectRegistry::new());
        let coordinator = ElectionCoordinator::new(
            store.clone(),
            registry.clone(),
            &settings.election,
            settings.store.request_timeout(),
        );
        Self {
            store,
            registry,
            coordinator,
            settings,
        }
    }

    /// Connects to an etcd cluster.
    ///
    /// `endpoints` is a comma-separated address list; blank entries are
    /// skipped.
    #[cfg(feature = "etcd")]
    pub async fn connect(
        endpoints: &str,
        dial_timeout_ms: u64,
    ) -> Result<Self, ErrorCode> {
        let mut settings = Settings::default();
        settings.store.endpoints = crate::parse_endpoints(endpoints);
        settings.store.dial_timeout_in_ms = dial_timeout_ms;
        Self::connect_with(settings).await
    }

    /// Connects to the etcd cluster named in `settings`.
    #[cfg(feature = "etcd")]
    pub async fn connect_with(settings: Settings) -> Result<Self, ErrorCode> {
        settings.validate().map_err(|e| ErrorCode::translate("connect", &e))?;
        let store = crate::store::EtcdStore::connect(&settings.store.endpoints, settings.store.dial_timeout())
            .await
            .map_err(|e| ErrorCode::translate("connect", &Error::from(e)))?;
        Ok(Self::with_settings(Arc::new(store), settings))
    }

    /// Tears down the store connection.
    ///
    /// Registered objects stay in place; release them with
    /// [`Gateway::remove_object`].
    pub async fn close(&self) {
        info!(objects = self.registry.len(), "closing gateway");
        self.store.close().await;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &ElectionCoordinator {
        &self.coordinator
    }

    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        timeout_ms: u64,
    ) -> ErrorCode {
        let request = PutRequest::new(key, value);
        let result = with_deadline(optional_timeout(timeout_ms), self.store.put(request)).await;
        store_code("put", result)
    }

    /// Value stored under `key`, `KeyNotExist` if there is none.
    pub async fn get(
        &self,
        key: impl AsRef<[u8]>,
        timeout_ms: u64,
    ) -> Result<Bytes, ErrorCode> {
        let request = RangeRequest::single(key);
        let resp = with_deadline(optional_timeout(timeout_ms), self.store.range(request))
            .await
            .map_err(|e| ErrorCode::translate("get", &Error::from(e)))?;

        match resp.kvs.into_iter().next() {
            Some(kv) => Ok(kv.value),
            None => Err(ErrorCode::KeyNotExist),
        }
    }

    pub async fn delete(
        &self,
        key: impl AsRef<[u8]>,
        timeout_ms: u64,
    ) -> ErrorCode {
        let request = DeleteRequest::single(key);
        let result = with_deadline(optional_timeout(timeout_ms), self.store.delete(request)).await;
        store_code("delete", result)
    }

    /// Applies every operation atomically.
    ///
    /// An unknown operation type fails with `TxnUnkownOp` before anything is
    /// sent to the store.
    pub async fn txn(
        &self,
        ops: &[Operation],
        timeout_ms: u64,
    ) -> ErrorCode {
        let mut writes = Vec::with_capacity(ops.len());
        for op in ops {
            let write = match OpType::try_from(op.op_type) {
                Ok(OpType::Put) => TxnOp::Put(PutRequest::new(&op.key, &op.value)),
                Ok(OpType::Delete) => TxnOp::Delete(DeleteRequest::single(&op.key)),
                Err(raw) => {
                    warn!(op = "txn", op_type = raw, "unknown operation type");
                    return ErrorCode::TxnUnkownOp;
                }
            };
            writes.push(write);
        }

        let request = TxnRequest::new().and_then(writes);
        let result = with_deadline(optional_timeout(timeout_ms), self.store.txn(request)).await;
        store_code("txn", result)
    }

    /// Sets `key` to `target` if it is absent or currently holds `prev`.
    ///
    /// Both guards run inside one transaction; when neither applies the
    /// result is `FailedPrecondition`.
    pub async fn compare_and_swap(
        &self,
        key: impl AsRef<[u8]>,
        prev: impl AsRef<[u8]>,
        target: impl AsRef<[u8]>,
        timeout_ms: u64,
    ) -> ErrorCode {
        let key = key.as_ref();
        let put = TxnOp::Put(PutRequest::new(key, target.as_ref()));
        let swap = TxnRequest::new()
            .when([Compare::value(key, CompareOp::Equal, prev)])
            .and_then([put.clone()]);
        let request = TxnRequest::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([put])
            .or_else([TxnOp::Txn(swap)]);

        let resp = match with_deadline(optional_timeout(timeout_ms), self.store.txn(request)).await {
            Ok(resp) => resp,
            Err(e) => return ErrorCode::translate("compare_and_swap", &Error::from(e)),
        };

        let swapped = resp.succeeded
            || resp
                .responses
                .iter()
                .any(|r| matches!(r, TxnOpResponse::Txn(nested) if nested.succeeded));
        if swapped {
            ErrorCode::OK
        } else {
            debug!(key = ?Bytes::copy_from_slice(key), "compare and swap guard failed");
            ErrorCode::FailedPrecondition
        }
    }

    /// Range query stored in the registry.
    ///
    /// An empty `end` selects every key at or after `start`; otherwise the
    /// range is `[start, end)`. Returns the handle and the number of keys.
    pub async fn list(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
        timeout_ms: u64,
    ) -> Result<(Handle, i64), ErrorCode> {
        let end = end.as_ref();
        let request = if end.is_empty() {
            RangeRequest::from_key(start)
        } else {
            RangeRequest::between(start, end)
        };

        let resp = with_deadline(optional_timeout(timeout_ms), self.store.range(request))
            .await
            .map_err(|e| ErrorCode::translate("list", &Error::from(e)))?;

        let kvs: Arc<[KeyValue]> = resp.kvs.into();
        let handle = self.registry.allocate(ManagedObject::KeyValueList(kvs));
        Ok((handle, resp.count))
    }

    /// First value of a list.
    pub fn get_single_object(
        &self,
        handle: Handle,
    ) -> Result<Bytes, ErrorCode> {
        self.get_multi_object(handle, 0)
    }

    /// Value at `index` of a list; `OutOfRange` past the end.
    pub fn get_multi_object(
        &self,
        handle: Handle,
        index: usize,
    ) -> Result<Bytes, ErrorCode> {
        let kvs = self
            .registry
            .lookup_list(handle)
            .map_err(|e| ErrorCode::translate("get_object", &Error::from(e)))?;

        match kvs.get(index) {
            Some(kv) => Ok(kv.value.clone()),
            None => {
                warn!(op = "get_object", handle, index, len = kvs.len(), "index out of range");
                Err(ErrorCode::OutOfRange)
            }
        }
    }

    /// Releases any handle returned by this gateway; unknown handles are
    /// ignored.
    pub fn remove_object(
        &self,
        handle: Handle,
    ) {
        self.registry.release(handle);
    }

    /// Campaigns for `prefix` as `candidate`, blocking until elected.
    ///
    /// `ttl_secs <= 0` uses the configured session ttl and `timeout_ms == 0`
    /// the configured campaign timeout, whose own `0` means no deadline. Any
    /// failure reports `CampaignInternalErr` and leaves the registry
    /// untouched.
    pub async fn campaign(
        &self,
        prefix: &str,
        candidate: impl AsRef<[u8]>,
        ttl_secs: i64,
        timeout_ms: u64,
    ) -> Result<Handle, ErrorCode> {
        self.campaign_with_cancel(prefix, candidate, ttl_secs, timeout_ms, CancellationToken::new())
            .await
    }

    /// [`Gateway::campaign`] that also gives up once `cancel` fires.
    pub async fn campaign_with_cancel(
        &self,
        prefix: &str,
        candidate: impl AsRef<[u8]>,
        ttl_secs: i64,
        timeout_ms: u64,
        cancel: CancellationToken,
    ) -> Result<Handle, ErrorCode> {
        let ttl_secs = if ttl_secs > 0 {
            ttl_secs
        } else {
            self.settings.election.session_ttl_in_secs
        };
        let timeout_ms = if timeout_ms > 0 {
            timeout_ms
        } else {
            self.settings.election.campaign_timeout_in_ms
        };

        self.coordinator
            .campaign(prefix, candidate.as_ref(), ttl_secs, optional_timeout(timeout_ms), cancel)
            .await
            .map_err(|e| {
                ErrorCode::translate("campaign", &e);
                ErrorCode::CampaignInternalErr
            })
    }

    /// Blocks until leadership of the election behind `handle` moves away
    /// from `candidate` (`ObserverLeaderChange`) or the store stops
    /// answering (`ObserverLeaderInternal`).
    ///
    /// `heartbeat_ms == 0` uses the configured heartbeat interval.
    pub async fn observe(
        &self,
        handle: Handle,
        heartbeat_ms: u64,
        candidate: impl AsRef<[u8]>,
    ) -> ErrorCode {
        let heartbeat_ms = if heartbeat_ms > 0 {
            heartbeat_ms
        } else {
            self.settings.election.heartbeat_interval_in_ms
        };

        match self
            .coordinator
            .observe(handle, candidate.as_ref(), Duration::from_millis(heartbeat_ms))
            .await
        {
            Ok(_) => ErrorCode::ObserverLeaderChange,
            Err(e @ Error::Registry(_)) => ErrorCode::translate("observe", &e),
            Err(e) => {
                ErrorCode::translate("observe", &e);
                ErrorCode::ObserverLeaderInternal
            }
        }
    }

    /// Resigns the election behind `handle`. The handle stays registered.
    pub async fn resign(
        &self,
        handle: Handle,
        timeout_ms: u64,
    ) -> ErrorCode {
        let timeout = optional_timeout(timeout_ms);
        match self.coordinator.resign(handle, timeout).await {
            Ok(()) => ErrorCode::LeaderResiginSuccess,
            Err(e @ Error::Registry(_)) => ErrorCode::translate("resign", &e),
            Err(e) => {
                ErrorCode::translate("resign", &e);
                ErrorCode::LeaderResignErr
            }
        }
    }

    /// Current leader value of the election behind `handle`.
    pub async fn leader(
        &self,
        handle: Handle,
        timeout_ms: u64,
    ) -> Result<Bytes, ErrorCode> {
        self.coordinator
            .leader(handle, optional_timeout(timeout_ms))
            .await
            .map_err(|e| ErrorCode::translate("leader", &e))
    }
}

fn store_code<T>(
    op: &'static str,
    result: Result<T, StoreError>,
) -> ErrorCode {
    ErrorCode::from_result(op, &result.map_err(Error::from))
}
