use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::store::PutRequest;
use crate::store::StoreClient;
use crate::test_utils::fast_settings;
use crate::test_utils::mem_gateway;
use crate::test_utils::mem_store;
use crate::test_utils::ELECTION_PREFIX;

const TIMEOUT_MS: u64 = 1000;

#[tokio::test]
async fn put_get_delete_round_trip() {
    let (gateway, _store) = mem_gateway();

    assert_eq!(gateway.put("k", "v", TIMEOUT_MS).await, ErrorCode::OK);
    assert_eq!(gateway.get("k", TIMEOUT_MS).await, Ok(Bytes::from_static(b"v")));

    assert_eq!(gateway.delete("k", TIMEOUT_MS).await, ErrorCode::OK);
    assert_eq!(gateway.get("k", TIMEOUT_MS).await, Err(ErrorCode::KeyNotExist));
}

#[tokio::test]
async fn get_missing_key_reports_key_not_exist() {
    let (gateway, _store) = mem_gateway();
    assert_eq!(gateway.get("missing-key", TIMEOUT_MS).await, Err(ErrorCode::KeyNotExist));
}

#[tokio::test]
#[traced_test]
async fn store_failures_surface_as_store_codes() {
    let (gateway, store) = mem_gateway();
    store.set_available(false);

    assert_eq!(gateway.put("k", "v", TIMEOUT_MS).await, ErrorCode::Unavailable);
    assert_eq!(gateway.get("k", TIMEOUT_MS).await, Err(ErrorCode::Unavailable));
    assert_eq!(gateway.delete("k", TIMEOUT_MS).await, ErrorCode::Unavailable);
    assert!(logs_contain("put"));
}

#[tokio::test]
async fn empty_key_is_an_invalid_argument() {
    let (gateway, _store) = mem_gateway();
    assert_eq!(gateway.put("", "v", TIMEOUT_MS).await, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn txn_applies_every_operation() {
    let (gateway, _store) = mem_gateway();
    gateway.put("old", "x", TIMEOUT_MS).await;

    let ops = [
        Operation::put("a", "1"),
        Operation::put("b", "2"),
        Operation::delete("old"),
    ];
    assert_eq!(gateway.txn(&ops, TIMEOUT_MS).await, ErrorCode::OK);

    assert_eq!(gateway.get("a", TIMEOUT_MS).await, Ok(Bytes::from_static(b"1")));
    assert_eq!(gateway.get("b", TIMEOUT_MS).await, Ok(Bytes::from_static(b"2")));
    assert_eq!(gateway.get("old", TIMEOUT_MS).await, Err(ErrorCode::KeyNotExist));
}

#[tokio::test]
async fn txn_with_unknown_op_sends_nothing() {
    let (gateway, store) = mem_gateway();
    let revision = store.revision();

    let ops = [
        Operation::put("a", "1"),
        Operation {
            op_type: 7,
            key: Bytes::from_static(b"b"),
            value: Bytes::new(),
        },
    ];
    assert_eq!(gateway.txn(&ops, TIMEOUT_MS).await, ErrorCode::TxnUnkownOp);
    assert_eq!(store.revision(), revision);
    assert_eq!(gateway.get("a", TIMEOUT_MS).await, Err(ErrorCode::KeyNotExist));
}

#[test]
fn op_type_follows_boundary_numbering() {
    assert_eq!(OpType::try_from(1), Ok(OpType::Put));
    assert_eq!(OpType::try_from(2), Ok(OpType::Delete));
    assert_eq!(OpType::try_from(0), Err(0));
}

#[tokio::test]
async fn compare_and_swap_sets_absent_or_matching_key() {
    let (gateway, store) = mem_gateway();

    assert_eq!(gateway.compare_and_swap("k", "", "first", TIMEOUT_MS).await, ErrorCode::OK);
    assert_eq!(gateway.get("k", TIMEOUT_MS).await, Ok(Bytes::from_static(b"first")));

    let before = store.revision();
    assert_eq!(
        gateway.compare_and_swap("k", "first", "second", TIMEOUT_MS).await,
        ErrorCode::OK
    );
    // A single commit per swap
    assert_eq!(store.revision(), before + 1);
    assert_eq!(gateway.get("k", TIMEOUT_MS).await, Ok(Bytes::from_static(b"second")));

    assert_eq!(
        gateway.compare_and_swap("k", "stale", "third", TIMEOUT_MS).await,
        ErrorCode::FailedPrecondition
    );
    assert_eq!(gateway.get("k", TIMEOUT_MS).await, Ok(Bytes::from_static(b"second")));
}

#[tokio::test]
async fn list_with_empty_end_returns_every_key_from_start() {
    let (gateway, _store) = mem_gateway();
    for (k, v) in [("0", "zero"), ("a", "1"), ("b", "2"), ("c", "3")] {
        gateway.put(k, v, TIMEOUT_MS).await;
    }

    let (handle, count) = gateway.list("a", "", TIMEOUT_MS).await.unwrap();
    assert_eq!(count, 3);
    assert_eq!(gateway.get_single_object(handle), Ok(Bytes::from_static(b"1")));
    assert_eq!(gateway.get_multi_object(handle, 2), Ok(Bytes::from_static(b"3")));
    assert_eq!(gateway.get_multi_object(handle, 3), Err(ErrorCode::OutOfRange));

    let (bounded, count) = gateway.list("a", "c", TIMEOUT_MS).await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(gateway.get_multi_object(bounded, 1), Ok(Bytes::from_static(b"2")));
    assert_ne!(handle, bounded);
}

#[tokio::test]
async fn list_contents_survive_later_writes() {
    let (gateway, _store) = mem_gateway();
    gateway.put("a", "before", TIMEOUT_MS).await;

    let (handle, _) = gateway.list("a", "", TIMEOUT_MS).await.unwrap();
    gateway.put("a", "after", TIMEOUT_MS).await;

    assert_eq!(gateway.get_single_object(handle), Ok(Bytes::from_static(b"before")));
}

#[tokio::test]
async fn released_or_mistyped_objects_are_rejected() {
    let (gateway, _store) = mem_gateway();

    let (empty, count) = gateway.list("x", "y", TIMEOUT_MS).await.unwrap();
    assert_eq!(count, 0);
    assert_eq!(gateway.get_single_object(empty), Err(ErrorCode::OutOfRange));

    gateway.remove_object(empty);
    assert_eq!(gateway.get_single_object(empty), Err(ErrorCode::ObjectNotExist));
    // Releasing twice is harmless
    gateway.remove_object(empty);

    let election = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();
    assert_eq!(gateway.get_single_object(election), Err(ErrorCode::ErrObjectType));
    assert_eq!(gateway.get_multi_object(election, 0), Err(ErrorCode::ErrObjectType));
}

#[tokio::test]
#[traced_test]
async fn campaign_resign_and_campaign_again() {
    let (gateway, _store) = mem_gateway();

    let handle = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();
    assert!(matches!(
        gateway.registry().lookup(handle),
        Ok(ManagedObject::ElectionHandle(_))
    ));
    assert_eq!(gateway.leader(handle, TIMEOUT_MS).await, Ok(Bytes::from_static(b"node1")));

    assert_eq!(gateway.resign(handle, TIMEOUT_MS).await, ErrorCode::LeaderResiginSuccess);

    let next = gateway.campaign(ELECTION_PREFIX, "node2", 5, 0).await.unwrap();
    assert_eq!(gateway.leader(next, TIMEOUT_MS).await, Ok(Bytes::from_static(b"node2")));
    gateway.remove_object(handle);
    gateway.remove_object(next);
    assert!(gateway.registry().is_empty());
}

#[tokio::test]
async fn zero_ttl_uses_configured_session_ttl() {
    let (gateway, _store) = mem_gateway();
    let handle = gateway.campaign(ELECTION_PREFIX, "node1", 0, 0).await.unwrap();

    let election = gateway.registry().lookup_election(handle).unwrap();
    assert_eq!(
        election.session().ttl(),
        gateway.settings().election.session_ttl_in_secs
    );
}

#[tokio::test(start_paused = true)]
async fn contended_campaign_times_out_without_registry_entry() {
    let (gateway, _store) = mem_gateway();
    gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();

    assert_eq!(
        gateway.campaign(ELECTION_PREFIX, "node2", 5, 200).await,
        Err(ErrorCode::CampaignInternalErr)
    );
    assert_eq!(gateway.registry().len(), 1);
}

#[tokio::test]
async fn waiting_campaign_wins_after_leader_resigns() {
    let (gateway, _store) = mem_gateway();
    let gateway = Arc::new(gateway);
    let first = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();

    let waiting = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.campaign(ELECTION_PREFIX, "node2", 5, 0).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    assert_eq!(gateway.resign(first, TIMEOUT_MS).await, ErrorCode::LeaderResiginSuccess);
    let second = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(gateway.leader(second, TIMEOUT_MS).await, Ok(Bytes::from_static(b"node2")));
}

#[tokio::test(start_paused = true)]
async fn campaign_without_timeout_uses_configured_campaign_timeout() {
    let mut settings = fast_settings();
    settings.election.campaign_timeout_in_ms = 300;
    let gateway = Gateway::with_settings(mem_store(), settings);
    gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(
        gateway.campaign(ELECTION_PREFIX, "node2", 5, 0).await,
        Err(ErrorCode::CampaignInternalErr)
    );
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(gateway.registry().len(), 1);
}

#[tokio::test]
async fn campaign_with_oversized_ttl_reports_internal_error() {
    let (gateway, store) = mem_gateway();

    assert_eq!(
        gateway.campaign(ELECTION_PREFIX, "node1", i64::MAX, 1000).await,
        Err(ErrorCode::CampaignInternalErr)
    );
    assert!(gateway.registry().is_empty());
    assert_eq!(store.lease_count(), 0);
}

#[tokio::test]
async fn cancelled_campaign_reports_internal_error() {
    let (gateway, _store) = mem_gateway();
    let gateway = Arc::new(gateway);
    gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();

    let cancel = CancellationToken::new();
    let waiting = {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            gateway
                .campaign_with_cancel(ELECTION_PREFIX, "node2", 5, 0, cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    assert_eq!(waiting.await.unwrap(), Err(ErrorCode::CampaignInternalErr));
    assert_eq!(gateway.registry().len(), 1);
}

#[tokio::test]
async fn observe_reports_leader_change_after_resign() {
    let (gateway, _store) = mem_gateway();
    let handle = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();
    assert_eq!(gateway.resign(handle, TIMEOUT_MS).await, ErrorCode::LeaderResiginSuccess);

    let code = tokio::time::timeout(Duration::from_secs(1), gateway.observe(handle, 0, "node1"))
        .await
        .unwrap();
    assert_eq!(code, ErrorCode::ObserverLeaderChange);
}

#[tokio::test]
async fn observe_keeps_waiting_after_history_compaction() {
    let (gateway, store) = mem_gateway();
    let handle = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();
    for i in 0..3 {
        store.put(PutRequest::new(format!("unrelated/{i}"), "x")).await.unwrap();
    }
    store.compact(store.revision());

    let observed = tokio::time::timeout(Duration::from_millis(500), gateway.observe(handle, 1000, "node1")).await;
    assert!(observed.is_err(), "observe returned {:?} with the leader unchanged", observed);
}

#[tokio::test]
async fn observe_returns_internal_error_shortly_after_connectivity_loss() {
    let (gateway, store) = mem_gateway();
    let gateway = Arc::new(gateway);
    let handle = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();

    let observing = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.observe(handle, 1000, "node1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set_available(false);

    // Probes run every 200ms for a 1000ms heartbeat
    let code = tokio::time::timeout(Duration::from_millis(600), observing)
        .await
        .expect("observe must not block past the next probe")
        .unwrap();
    assert_eq!(code, ErrorCode::ObserverLeaderInternal);
}

#[tokio::test]
async fn election_calls_on_bad_handles_report_object_codes() {
    let (gateway, _store) = mem_gateway();

    assert_eq!(gateway.observe(77, 100, "node1").await, ErrorCode::ObjectNotExist);
    assert_eq!(gateway.resign(77, TIMEOUT_MS).await, ErrorCode::ObjectNotExist);
    assert_eq!(gateway.leader(77, TIMEOUT_MS).await, Err(ErrorCode::ObjectNotExist));

    let (list, _) = gateway.list("a", "", TIMEOUT_MS).await.unwrap();
    assert_eq!(gateway.observe(list, 100, "node1").await, ErrorCode::ErrObjectType);
    assert_eq!(gateway.resign(list, TIMEOUT_MS).await, ErrorCode::ErrObjectType);
}

#[tokio::test]
async fn second_resign_reports_resign_error() {
    let (gateway, _store) = mem_gateway();
    let handle = gateway.campaign(ELECTION_PREFIX, "node1", 5, 0).await.unwrap();

    assert_eq!(gateway.resign(handle, TIMEOUT_MS).await, ErrorCode::LeaderResiginSuccess);
    assert_eq!(gateway.resign(handle, TIMEOUT_MS).await, ErrorCode::LeaderResignErr);
}

#[tokio::test]
async fn close_keeps_registered_objects() {
    let (gateway, _store) = mem_gateway();
    let (handle, _) = gateway.list("a", "", TIMEOUT_MS).await.unwrap();

    gateway.close().await;

    assert!(gateway.registry().lookup(handle).is_ok());
}
