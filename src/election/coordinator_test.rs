use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing_test::traced_test;

use super::*;
use crate::registry::ManagedObject;
use crate::registry::ObjectRegistry;
use crate::store::DeleteRequest;
use crate::store::DeleteResponse;
use crate::store::KeyValue;
use crate::store::LeaseGrant;
use crate::store::LeaseId;
use crate::store::MemStore;
use crate::store::PutRequest;
use crate::store::PutResponse;
use crate::store::RangeRequest;
use crate::store::RangeResponse;
use crate::store::StoreClient;
use crate::store::StoreResult;
use crate::store::TxnRequest;
use crate::store::TxnResponse;
use crate::store::WatchRequest;
use crate::store::WatchStream;
use crate::test_utils::fast_settings;
use crate::test_utils::mem_coordinator;
use crate::test_utils::mem_store;
use crate::test_utils::ELECTION_PREFIX;
use crate::Error;
use crate::StoreError;
use crate::RegistryError;
use crate::SessionError;

const HEARTBEAT: Duration = Duration::from_millis(100);
const RESIGN_TIMEOUT: Option<Duration> = Some(Duration::from_secs(1));

#[tokio::test]
#[traced_test]
async fn campaign_resign_then_next_candidate_wins() {
    let (coordinator, _store) = mem_coordinator();

    let first = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        coordinator.registry().lookup(first),
        Ok(ManagedObject::ElectionHandle(_))
    ));
    assert_eq!(
        coordinator.leader(first, RESIGN_TIMEOUT).await.unwrap(),
        Bytes::from_static(b"node1")
    );

    coordinator.resign(first, RESIGN_TIMEOUT).await.unwrap();
    // Resign leaves the handle registered
    assert!(coordinator.registry().lookup(first).is_ok());

    let second = coordinator
        .campaign(ELECTION_PREFIX, b"node2", 5, None, CancellationToken::new())
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(
        coordinator.leader(second, RESIGN_TIMEOUT).await.unwrap(),
        Bytes::from_static(b"node2")
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_campaign_registers_nothing_and_revokes_its_session() {
    let (coordinator, store) = mem_coordinator();
    coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(store.lease_count(), 1);

    let result = coordinator
        .campaign(
            ELECTION_PREFIX,
            b"node2",
            5,
            Some(Duration::from_millis(200)),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(Error::Election(ElectionError::Timeout(_)))));
    assert_eq!(coordinator.registry().len(), 1);
    assert_eq!(store.lease_count(), 1);
}

#[tokio::test]
async fn cancelled_campaign_registers_nothing() {
    let (coordinator, _store) = mem_coordinator();
    coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiting = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .campaign(ELECTION_PREFIX, b"node2", 5, None, cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(Error::Election(ElectionError::Canceled(_)))));
    assert_eq!(coordinator.registry().len(), 1);
}

#[tokio::test]
async fn campaign_with_invalid_ttl_fails_before_touching_the_store() {
    let (coordinator, store) = mem_coordinator();

    let result = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 0, None, CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Session(SessionError::InvalidTtl(0)))));
    assert!(coordinator.registry().is_empty());
    assert_eq!(store.lease_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn observe_reports_change_when_leader_resigns() {
    let (coordinator, _store) = mem_coordinator();
    let handle = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();

    let observing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.observe(handle, b"node1", HEARTBEAT).await })
    };
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!observing.is_finished(), "observe must keep waiting while leadership holds");

    coordinator.resign(handle, RESIGN_TIMEOUT).await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(1), observing)
        .await
        .expect("observe should return after resign")
        .unwrap()
        .unwrap();
    assert_eq!(change, LeaderChange { leader: None });
}

#[tokio::test]
async fn observe_after_resign_reports_change_immediately() {
    let (coordinator, _store) = mem_coordinator();
    let handle = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();
    coordinator.resign(handle, RESIGN_TIMEOUT).await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(1), coordinator.observe(handle, b"node1", HEARTBEAT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.leader, None);
}

#[tokio::test]
async fn observe_reports_new_leader_value() {
    let (coordinator, _store) = mem_coordinator();
    let first = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();
    coordinator.resign(first, RESIGN_TIMEOUT).await.unwrap();
    coordinator
        .campaign(ELECTION_PREFIX, b"node2", 5, None, CancellationToken::new())
        .await
        .unwrap();

    let change = coordinator.observe(first, b"node1", HEARTBEAT).await.unwrap();
    assert_eq!(change.leader, Some(Bytes::from_static(b"node2")));
}

#[tokio::test]
async fn observe_fails_fast_when_store_goes_silent() {
    let (coordinator, store) = mem_coordinator();
    let handle = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();

    let observing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.observe(handle, b"node1", HEARTBEAT).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set_available(false);

    // One probe period is 20ms
    let result = tokio::time::timeout(Duration::from_millis(500), observing)
        .await
        .expect("probe failure should end observe")
        .unwrap();
    assert!(matches!(result, Err(Error::Election(ElectionError::ProbeFailed(_)))));
}

#[tokio::test]
async fn observe_rejects_unknown_and_mistyped_handles() {
    let (coordinator, _store) = mem_coordinator();

    assert!(matches!(
        coordinator.observe(42, b"node1", HEARTBEAT).await,
        Err(Error::Registry(RegistryError::NotFound(42)))
    ));

    let list = coordinator
        .registry()
        .allocate(ManagedObject::KeyValueList(Vec::<KeyValue>::new().into()));
    assert!(matches!(
        coordinator.observe(list, b"node1", HEARTBEAT).await,
        Err(Error::Registry(RegistryError::TypeMismatch { .. }))
    ));
    assert!(matches!(
        coordinator.resign(list, RESIGN_TIMEOUT).await,
        Err(Error::Registry(RegistryError::TypeMismatch { .. }))
    ));
}

#[tokio::test]
async fn second_resign_fails_and_keeps_handle() {
    let (coordinator, _store) = mem_coordinator();
    let handle = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();

    coordinator.resign(handle, RESIGN_TIMEOUT).await.unwrap();
    assert!(coordinator.resign(handle, RESIGN_TIMEOUT).await.is_err());
    assert!(coordinator.registry().lookup(handle).is_ok());
}

#[tokio::test]
async fn resign_fails_while_store_is_unreachable() {
    let (coordinator, store) = mem_coordinator();
    let handle = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();

    store.set_available(false);
    assert!(coordinator.resign(handle, RESIGN_TIMEOUT).await.is_err());

    // The handle stays usable for a retry
    store.set_available(true);
    coordinator.resign(handle, RESIGN_TIMEOUT).await.unwrap();
}

/// Store whose reads of one key hang once the connection goes quiet, while
/// open watches stay attached and silent.
struct QuietStore {
    inner: Arc<MemStore>,
    quiet_key: Bytes,
    quiet: AtomicBool,
}

#[async_trait]
impl StoreClient for QuietStore {
    async fn range(
        &self,
        request: RangeRequest,
    ) -> StoreResult<RangeResponse> {
        if self.quiet.load(Ordering::SeqCst) && request.key == self.quiet_key {
            std::future::pending::<()>().await;
        }
        self.inner.range(request).await
    }

    async fn put(
        &self,
        request: PutRequest,
    ) -> StoreResult<PutResponse> {
        self.inner.put(request).await
    }

    async fn delete(
        &self,
        request: DeleteRequest,
    ) -> StoreResult<DeleteResponse> {
        self.inner.delete(request).await
    }

    async fn txn(
        &self,
        request: TxnRequest,
    ) -> StoreResult<TxnResponse> {
        self.inner.txn(request).await
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> StoreResult<WatchStream> {
        self.inner.watch(request).await
    }

    async fn lease_grant(
        &self,
        ttl: i64,
    ) -> StoreResult<LeaseGrant> {
        self.inner.lease_grant(ttl).await
    }

    async fn lease_keep_alive(
        &self,
        id: LeaseId,
    ) -> StoreResult<i64> {
        self.inner.lease_keep_alive(id).await
    }

    async fn lease_revoke(
        &self,
        id: LeaseId,
    ) -> StoreResult<()> {
        self.inner.lease_revoke(id).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn observe_fails_once_a_hanging_liveness_read_hits_its_deadline() {
    let settings = fast_settings();
    let store = Arc::new(QuietStore {
        inner: mem_store(),
        quiet_key: Bytes::from(settings.election.probe_key.clone()),
        quiet: AtomicBool::new(false),
    });
    let coordinator = ElectionCoordinator::new(
        store.clone(),
        Arc::new(ObjectRegistry::new()),
        &settings.election,
        settings.store.request_timeout(),
    );
    let handle = coordinator
        .campaign(ELECTION_PREFIX, b"node1", 5, None, CancellationToken::new())
        .await
        .unwrap();

    let observing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.observe(handle, b"node1", HEARTBEAT).await })
    };
    // Healthy reads keep observe waiting
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!observing.is_finished());

    let went_quiet = tokio::time::Instant::now();
    store.quiet.store(true, Ordering::SeqCst);

    // Next read starts within heartbeat / 5 and is abandoned after heartbeat
    let result = tokio::time::timeout(Duration::from_millis(600), observing)
        .await
        .expect("observe must not wait on a silent connection")
        .unwrap();
    assert!(matches!(
        result,
        Err(Error::Election(ElectionError::ProbeFailed(StoreError::DeadlineExceeded(_))))
    ));
    assert!(went_quiet.elapsed() >= HEARTBEAT);
}
