//! Handle table for values handed across the boundary
//!
//! Callers on the other side of the boundary cannot hold Rust references, so
//! every multi-valued or stateful result is parked here under an opaque
//! 64-bit [`Handle`]. The registry owns the value until the handle is
//! released.
//!
//! Handles are allocated from a monotonically increasing counter and are
//! never reused within a process.

#[cfg(test)]
mod registry_test;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use tracing::trace;

use crate::constants::FIRST_HANDLE;
use crate::election::Election;
use crate::store::KeyValue;
use crate::RegistryError;

/// Opaque reference to a registry entry
pub type Handle = u64;

/// Values the registry can own
#[derive(Clone)]
pub enum ManagedObject {
    /// Result of a range query; never modified after insertion
    KeyValueList(Arc<[KeyValue]>),
    /// A won election together with its session
    ElectionHandle(Arc<Election>),
}

impl ManagedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ManagedObject::KeyValueList(_) => "KeyValueList",
            ManagedObject::ElectionHandle(_) => "ElectionHandle",
        }
    }
}

impl std::fmt::Debug for ManagedObject {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ManagedObject::KeyValueList(kvs) => f.debug_tuple("KeyValueList").field(&kvs.len()).finish(),
            ManagedObject::ElectionHandle(election) => f
                .debug_tuple("ElectionHandle")
                .field(&election.prefix())
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct ObjectRegistry {
    objects: DashMap<Handle, ManagedObject>,
    next_handle: AtomicU64,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            next_handle: AtomicU64::new(FIRST_HANDLE),
        }
    }

    /// Stores `object` under a fresh handle.
    pub fn allocate(
        &self,
        object: ManagedObject,
    ) -> Handle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(handle, kind = object.kind(), "object registered");
        self.objects.insert(handle, object);
        handle
    }

    /// Returns the object without removing it.
    pub fn lookup(
        &self,
        handle: Handle,
    ) -> Result<ManagedObject, RegistryError> {
        self.objects
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound(handle))
    }

    pub fn lookup_list(
        &self,
        handle: Handle,
    ) -> Result<Arc<[KeyValue]>, RegistryError> {
        match self.lookup(handle)? {
            ManagedObject::KeyValueList(kvs) => Ok(kvs),
            other => Err(RegistryError::TypeMismatch {
                handle,
                expected: "KeyValueList",
                found: other.kind(),
            }),
        }
    }

    pub fn lookup_election(
        &self,
        handle: Handle,
    ) -> Result<Arc<Election>, RegistryError> {
        match self.lookup(handle)? {
            ManagedObject::ElectionHandle(election) => Ok(election),
            other => Err(RegistryError::TypeMismatch {
                handle,
                expected: "ElectionHandle",
                found: other.kind(),
            }),
        }
    }

    /// Removes the entry; releasing an unknown handle is a no-op.
    ///
    /// Releasing an election does not resign it. As a safety net the
    /// election is closed, which stops refreshing its session lease so the
    /// candidate entry disappears once the lease runs out.
    pub fn release(
        &self,
        handle: Handle,
    ) {
        match self.objects.remove(&handle) {
            Some((_, ManagedObject::ElectionHandle(election))) => {
                debug!(handle, prefix = election.prefix(), "election handle released");
                election.close();
            }
            Some((_, object)) => {
                debug!(handle, kind = object.kind(), "object released");
            }
            None => {
                trace!(handle, "release of unknown handle ignored");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
