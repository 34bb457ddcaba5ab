//! Lease-backed leader election over a strongly consistent key-value store.
//!
//! The crate is organised leaves first:
//! - [`store`] - the [`StoreClient`] contract plus the in-memory [`MemStore`]
//!   and (feature `etcd`) the etcd-backed store
//! - [`registry`] - the handle table that owns every value returned across
//!   the boundary
//! - [`session`] - lease-bound sessions with a background keepalive
//! - [`election`] - the campaign/observe/resign state machine
//! - [`gateway`] - the code-returning boundary surface
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//!
//! use elector::ErrorCode;
//! use elector::Gateway;
//! use elector::MemStore;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let gateway = Gateway::new(Arc::new(MemStore::new()));
//!
//!     let handle = gateway
//!         .campaign("/election/mds", "node1", 5, 0)
//!         .await
//!         .expect("campaign should succeed on an empty election");
//!
//!     assert_eq!(gateway.resign(handle, 1000).await, ErrorCode::LeaderResiginSuccess);
//!     gateway.remove_object(handle);
//! }
//! ```

mod config;
mod constants;
mod error_code;
mod errors;
pub mod election;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod store;
pub mod utils;

pub use config::*;
pub use constants::*;
pub use election::*;
pub use error_code::*;
pub use errors::*;
pub use gateway::*;
pub use registry::*;
pub use session::*;
pub use store::*;

#[cfg(test)]
pub(crate) mod test_utils;
