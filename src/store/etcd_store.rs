//! etcd v3 backend over `etcd-client`.

use std::time::Duration;

use bytes::Bytes;
use etcd_client::Client;
use etcd_client::Compare as EtcdCompare;
use etcd_client::CompareOp as EtcdCompareOp;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions;
use etcd_client::EventType as EtcdEventType;
use etcd_client::GetOptions;
use etcd_client::GetResponse;
use etcd_client::PutOptions;
use etcd_client::SortOrder as EtcdSortOrder;
use etcd_client::SortTarget;
use etcd_client::Txn;
use etcd_client::TxnOp as EtcdTxnOp;
use etcd_client::TxnOpResponse as EtcdTxnOpResponse;
use etcd_client::WatchOptions;
use tokio::sync::mpsc;
use tonic::async_trait;
use tonic::Code;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Compare;
use super::CompareOp;
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
use crate::StoreError;

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::GRpcStatus(status) => status.into(),
            etcd_client::Error::TransportError(e) => StoreError::Transport(e.to_string()),
            etcd_client::Error::InvalidArgs(msg) => StoreError::InvalidRequest(msg),
            etcd_client::Error::InvalidUri(e) => StoreError::InvalidRequest(e.to_string()),
            other => StoreError::status(Code::Unknown, other.to_string()),
        }
    }
}

/// Store client connected to an etcd cluster
///
/// `etcd_client::Client` is a cheap handle over a shared channel; every call
/// works on its own clone so the store can be shared behind an `Arc`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects to `endpoints`, failing if no endpoint answers within
    /// `dial_timeout`.
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> StoreResult<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::InvalidRequest("no endpoint provided".to_string()));
        }
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = tokio::time::timeout(dial_timeout, Client::connect(endpoints, Some(options)))
            .await
            .map_err(|_| StoreError::DeadlineExceeded(dial_timeout))??;
        info!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

fn kv_from(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: Bytes::copy_from_slice(kv.key()),
        value: Bytes::copy_from_slice(kv.value()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: kv.lease(),
    }
}

fn range_from(resp: &GetResponse) -> RangeResponse {
    RangeResponse {
        kvs: resp.kvs().iter().map(kv_from).collect(),
        count: resp.count(),
        revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
    }
}

fn get_options(request: &RangeRequest) -> GetOptions {
    let mut options = GetOptions::new();
    options = match &request.range_end {
        RangeEnd::Single => options,
        RangeEnd::Prefix => options.with_prefix(),
        RangeEnd::FromKey => options.with_from_key(),
        RangeEnd::Until(end) => options.with_range(end.to_vec()),
    };
    if let Some(limit) = request.limit {
        options = options.with_limit(limit as i64);
    }
    if let Some(order) = request.sort_by_create {
        let order = match order {
            SortOrder::Ascend => EtcdSortOrder::Ascend,
            SortOrder::Descend => EtcdSortOrder::Descend,
        };
        options = options.with_sort(SortTarget::Create, order);
    }
    if let Some(revision) = request.max_create_revision {
        options = options.with_max_create_revision(revision);
    }
    options
}

fn delete_options(range_end: &RangeEnd) -> DeleteOptions {
    let options = DeleteOptions::new();
    match range_end {
        RangeEnd::Single => options,
        RangeEnd::Prefix => options.with_prefix(),
        RangeEnd::FromKey => options.with_from_key(),
        RangeEnd::Until(end) => options.with_range(end.to_vec()),
    }
}

fn put_options(lease: Option<LeaseId>) -> Option<PutOptions> {
    lease.filter(|l| *l != 0).map(|l| PutOptions::new().with_lease(l))
}

fn compare_into(compare: &Compare) -> EtcdCompare {
    let op = match compare.op {
        CompareOp::Equal => EtcdCompareOp::Equal,
        CompareOp::NotEqual => EtcdCompareOp::NotEqual,
        CompareOp::Greater => EtcdCompareOp::Greater,
        CompareOp::Less => EtcdCompareOp::Less,
    };
    let key = compare.key.to_vec();
    match &compare.target {
        CompareTarget::Value(v) => EtcdCompare::value(key, op, v.to_vec()),
        CompareTarget::CreateRevision(r) => EtcdCompare::create_revision(key, op, *r),
        CompareTarget::ModRevision(r) => EtcdCompare::mod_revision(key, op, *r),
        CompareTarget::Version(v) => EtcdCompare::version(key, op, *v),
    }
}

fn txn_into(request: &TxnRequest) -> Txn {
    let ops = |ops: &[TxnOp]| -> Vec<EtcdTxnOp> {
        ops.iter()
            .map(|op| match op {
                TxnOp::Range(r) => EtcdTxnOp::get(r.key.to_vec(), Some(get_options(r))),
                TxnOp::Put(p) => EtcdTxnOp::put(p.key.to_vec(), p.value.to_vec(), put_options(p.lease)),
                TxnOp::Delete(d) => EtcdTxnOp::delete(d.key.to_vec(), Some(delete_options(&d.range_end))),
                TxnOp::Txn(nested) => EtcdTxnOp::txn(txn_into(nested)),
            })
            .collect()
    };

    Txn::new()
        .when(request.compare.iter().map(compare_into).collect::<Vec<_>>())
        .and_then(ops(&request.success))
        .or_else(ops(&request.failure))
}

fn txn_from(resp: &etcd_client::TxnResponse) -> TxnResponse {
    let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
    let responses = resp
        .op_responses()
        .iter()
        .map(|op| match op {
            EtcdTxnOpResponse::Get(get) => TxnOpResponse::Range(range_from(get)),
            EtcdTxnOpResponse::Put(_) => TxnOpResponse::Put(PutResponse { revision }),
            EtcdTxnOpResponse::Delete(del) => TxnOpResponse::Delete(DeleteResponse {
                deleted: del.deleted(),
                revision,
            }),
            EtcdTxnOpResponse::Txn(nested) => TxnOpResponse::Txn(txn_from(nested)),
        })
        .collect();

    TxnResponse {
        succeeded: resp.succeeded(),
        responses,
        revision,
    }
}

#[async_trait]
impl StoreClient for EtcdStore {
    async fn range(
        &self,
        request: RangeRequest,
    ) -> StoreResult<RangeResponse> {
        let mut client = self.client.clone();
        let resp = client.get(request.key.to_vec(), Some(get_options(&request))).await?;
        Ok(range_from(&resp))
    }

    async fn put(
        &self,
        request: PutRequest,
    ) -> StoreResult<PutResponse> {
        let mut client = self.client.clone();
        let resp = client
            .put(request.key.to_vec(), request.value.to_vec(), put_options(request.lease))
            .await?;
        Ok(PutResponse {
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn delete(
        &self,
        request: DeleteRequest,
    ) -> StoreResult<DeleteResponse> {
        let mut client = self.client.clone();
        let resp = client
            .delete(request.key.to_vec(), Some(delete_options(&request.range_end)))
            .await?;
        Ok(DeleteResponse {
            deleted: resp.deleted(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn txn(
        &self,
        request: TxnRequest,
    ) -> StoreResult<TxnResponse> {
        let mut client = self.client.clone();
        let resp = client.txn(txn_into(&request)).await?;
        Ok(txn_from(&resp))
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> StoreResult<WatchStream> {
        let mut options = match &request.range_end {
            RangeEnd::Single => WatchOptions::new(),
            RangeEnd::Prefix => WatchOptions::new().with_prefix(),
            RangeEnd::FromKey => WatchOptions::new().with_from_key(),
            RangeEnd::Until(end) => WatchOptions::new().with_range(end.to_vec()),
        };
        if let Some(revision) = request.start_revision.filter(|r| *r > 0) {
            options = options.with_start_revision(revision);
        }

        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client.watch(request.key.to_vec(), Some(options)).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Forward etcd responses until either side goes away
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("watch receiver dropped, cancelling etcd watch");
                        let _ = watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                let err = if resp.compact_revision() > 0 {
                                    StoreError::Compacted {
                                        requested: request.start_revision.unwrap_or_default(),
                                        compacted: resp.compact_revision(),
                                    }
                                } else {
                                    StoreError::WatchClosed
                                };
                                let _ = tx.send(Err(err));
                                break;
                            }
                            let events: Vec<WatchEvent> = resp
                                .events()
                                .iter()
                                .filter_map(|event| {
                                    let event_type = match event.event_type() {
                                        EtcdEventType::Put => EventType::Put,
                                        EtcdEventType::Delete => EventType::Delete,
                                    };
                                    event.kv().map(|kv| WatchEvent {
                                        event_type,
                                        kv: kv_from(kv),
                                    })
                                })
                                .collect();
                            if !events.is_empty() && tx.send(Ok(events)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("etcd watch failed: {}", e);
                            let _ = tx.send(Err(e.into()));
                            break;
                        }
                    }
                }
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn lease_grant(
        &self,
        ttl: i64,
    ) -> StoreResult<LeaseGrant> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        Ok(LeaseGrant {
            id: resp.id(),
            ttl: resp.ttl(),
        })
    }

    async fn lease_keep_alive(
        &self,
        id: LeaseId,
    ) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(id).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(StoreError::Transport("keepalive stream closed".to_string())),
        }
    }

    async fn lease_revoke(
        &self,
        id: LeaseId,
    ) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.lease_revoke(id).await?;
        Ok(())
    }

    async fn close(&self) {
        debug!("etcd store closed");
    }
}
