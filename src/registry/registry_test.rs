use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use super::*;
use crate::election::Election;
use crate::election::ElectionState;
use crate::test_utils::mem_store;
use crate::test_utils::session_manager;
use crate::test_utils::ELECTION_PREFIX;

fn kv_list(values: &[&str]) -> ManagedObject {
    let kvs: Vec<KeyValue> = values
        .iter()
        .map(|v| KeyValue {
            key: Bytes::from(format!("key-{}", v)),
            value: Bytes::copy_from_slice(v.as_bytes()),
            ..Default::default()
        })
        .collect();
    ManagedObject::KeyValueList(kvs.into())
}

#[test]
fn lookup_returns_stored_value_until_release() {
    let registry = ObjectRegistry::new();
    let handle = registry.allocate(kv_list(&["a", "b"]));

    let kvs = registry.lookup_list(handle).unwrap();
    assert_eq!(kvs.len(), 2);
    assert_eq!(kvs[1].value, Bytes::from_static(b"b"));
    // Lookup does not remove
    assert!(registry.lookup(handle).is_ok());

    registry.release(handle);
    assert_eq!(registry.lookup(handle).unwrap_err(), RegistryError::NotFound(handle));
    assert!(registry.is_empty());
}

#[test]
fn handles_start_at_one_and_are_never_reused() {
    let registry = ObjectRegistry::new();
    let first = registry.allocate(kv_list(&[]));
    assert_eq!(first, 1);

    registry.release(first);
    let second = registry.allocate(kv_list(&[]));
    assert_ne!(first, second);
    assert!(second > first);
}

#[test]
fn release_of_unknown_handle_is_a_noop() {
    let registry = ObjectRegistry::new();
    let handle = registry.allocate(kv_list(&["a"]));

    registry.release(9999);
    registry.release(handle);
    registry.release(handle);

    assert!(registry.is_empty());
}

#[tokio::test]
async fn lookup_with_wrong_variant_reports_type_mismatch() {
    let registry = ObjectRegistry::new();
    let list = registry.allocate(kv_list(&["a"]));

    match registry.lookup_election(list) {
        Err(RegistryError::TypeMismatch { handle, expected, found }) => {
            assert_eq!(handle, list);
            assert_eq!(expected, "ElectionHandle");
            assert_eq!(found, "KeyValueList");
        }
        other => panic!("unexpected lookup result: {:?}", other),
    }

    let store = mem_store();
    let session = session_manager(store.clone()).create_session(5).await.unwrap();
    let election = registry.allocate(ManagedObject::ElectionHandle(Arc::new(Election::new(
        store,
        session,
        ELECTION_PREFIX,
    ))));
    assert!(matches!(
        registry.lookup_list(election),
        Err(RegistryError::TypeMismatch {
            expected: "KeyValueList",
            ..
        })
    ));
}

#[tokio::test]
async fn releasing_an_election_closes_it() {
    let store = mem_store();
    let session = session_manager(store.clone()).create_session(5).await.unwrap();
    let election = Arc::new(Election::new(store, session, ELECTION_PREFIX));

    let registry = ObjectRegistry::new();
    let handle = registry.allocate(ManagedObject::ElectionHandle(election.clone()));
    registry.release(handle);

    assert_eq!(election.state(), ElectionState::Closed);
    assert!(registry.lookup(handle).is_err());
}

#[test]
fn concurrent_allocations_yield_distinct_handles() {
    let registry = Arc::new(ObjectRegistry::new());
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            std::thread::spawn(move || (0..100).map(|_| registry.allocate(kv_list(&["v"]))).collect::<Vec<_>>())
        })
        .collect();

    let mut seen = HashSet::new();
    for t in threads {
        for handle in t.join().unwrap() {
            assert!(seen.insert(handle), "handle {} allocated twice", handle);
            assert_eq!(registry.lookup_list(handle).unwrap().len(), 1);
        }
    }
    assert_eq!(registry.len(), 800);
}
