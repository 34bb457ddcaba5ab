//! Fixtures shared by the unit tests of every module

use std::sync::Arc;
use std::time::Duration;

use crate::store::MemStore;
use crate::store::StoreClient;
use crate::ElectionCoordinator;
use crate::Gateway;
use crate::ObjectRegistry;
use crate::SessionManager;
use crate::Settings;

pub(crate) const ELECTION_PREFIX: &str = "/election/mds";

/// Settings tuned so election tests finish quickly
pub(crate) fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.store.request_timeout_in_ms = 200;
    settings.election.session_ttl_in_secs = 2;
    settings.election.heartbeat_interval_in_ms = 100;
    settings.election.keepalive_retry_interval_in_ms = 50;
    settings
}

pub(crate) fn mem_store() -> Arc<MemStore> {
    Arc::new(MemStore::with_reap_interval(Duration::from_millis(10)))
}

/// Gateway over a fresh in-memory store; the store is returned for fault
/// injection.
pub(crate) fn mem_gateway() -> (Gateway, Arc<MemStore>) {
    let store = mem_store();
    let gateway = Gateway::with_settings(store.clone() as Arc<dyn StoreClient>, fast_settings());
    (gateway, store)
}

pub(crate) fn mem_coordinator() -> (ElectionCoordinator, Arc<MemStore>) {
    let store = mem_store();
    let settings = fast_settings();
    let coordinator = ElectionCoordinator::new(
        store.clone(),
        Arc::new(ObjectRegistry::new()),
        &settings.election,
        settings.store.request_timeout(),
    );
    (coordinator, store)
}

pub(crate) fn session_manager(store: Arc<dyn StoreClient>) -> SessionManager {
    SessionManager::new(store, Duration::from_millis(50))
}
