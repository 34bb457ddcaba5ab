//! Key-value store contract
//!
//! The election logic only needs a small slice of what a strongly consistent
//! store offers: range reads, puts bound to leases, compare-guarded
//! transactions, watches with history replay and leases. [`StoreClient`]
//! captures exactly that slice.
//!
//! Two implementations ship with the crate:
//! - [`MemStore`] - an in-process store with the same revision, lease and
//!   watch semantics, used for tests and single-process deployments
//! - `EtcdStore` (feature `etcd`) - the etcd v3 API through `etcd-client`

mod mem_store;
mod types;

#[cfg(feature = "etcd")]
mod etcd_store;

pub use mem_store::*;
pub use types::*;

#[cfg(feature = "etcd")]
pub use etcd_store::*;


#[cfg(test)]
use mockall::automock;
use tonic::async_trait;

/// Connection to the distributed key-value store
///
/// Implementations must be safe for concurrent use; every component borrows
/// the same instance through an `Arc`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn range(
        &self,
        request: RangeRequest,
    ) -> StoreResult<RangeResponse>;

    async fn put(
        &self,
        request: PutRequest,
    ) -> StoreResult<PutResponse>;

    async fn delete(
        &self,
        request: DeleteRequest,
    ) -> StoreResult<DeleteResponse>;

    async fn txn(
        &self,
        request: TxnRequest,
    ) -> StoreResult<TxnResponse>;

    /// Opens a watch; events at or after `start_revision` are delivered in
    /// revision order.
    async fn watch(
        &self,
        request: WatchRequest,
    ) -> StoreResult<WatchStream>;

    async fn lease_grant(
        &self,
        ttl: i64,
    ) -> StoreResult<LeaseGrant>;

    /// Refreshes a lease once and returns its remaining ttl in seconds.
    /// A non-positive ttl means the lease no longer exists.
    async fn lease_keep_alive(
        &self,
        id: LeaseId,
    ) -> StoreResult<i64>;

    /// Revokes a lease, deleting every key attached to it.
    async fn lease_revoke(
        &self,
        id: LeaseId,
    ) -> StoreResult<()>;

    /// Releases network resources held by the connection.
    async fn close(&self);
}
