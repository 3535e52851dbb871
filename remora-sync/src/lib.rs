//! Offline-capable sync engine for Remora.
//!
//! Mediates between a local object cache and a remote object store reachable
//! over HTTP. Callers issue declarative queries and writes without knowing
//! whether the data is local, stale, or in flight.
//!
//! # Components
//!
//! - **Cache**: the [`LocalCache`] contract the engine persists through
//! - **Transport**: the [`RemoteTransport`] contract, spoken over HTTP by
//!   [`HttpTransport`]
//! - **Sessions**: per-server authentication state in a [`SessionRegistry`]
//! - **Searches**: [`SearchRequest`]s classify how well the cache answers a
//!   query and decide when to ask the server
//! - **Changes**: [`ChangeRequest`]s queue writes, merge them, dispatch them
//!   one at a time per table, and reconcile conflicts
//! - **Coordinator**: [`SyncCoordinator`] ties it all together and emits
//!   [`SyncEvent`]s
//!
//! # Reading
//!
//! 1. The query is matched against remembered searches (or a new one starts)
//! 2. The first time, the schema signature is checked and the cache consulted
//! 3. The answer is classified: complete, stale, incomplete, or insufficient
//! 4. Depending on the blocking policy the caller waits for a discovery and
//!    retrieval round trip, or gets the cached answer while it runs
//!
//! # Writing
//!
//! 1. The write is queued, merged with an earlier queued write to the same
//!    table, and dispatched when online
//! 2. The server's response replaces temporary ids, patches searches, and
//!    lands in the cache
//! 3. Push notifications of our own writes are recognized and ignored
//!
//! # Example
//!
//! ```no_run
//! use remora_sync::{MemoryCache, Query, SessionRegistry, SyncConfig, SyncCoordinator};
//! use remora_sync::transport::mock::MockRemote;
//! use remora_types::{Criteria, Location, ObjectId};
//! use std::sync::Arc;
//!
//! # async fn run() -> remora_sync::SyncResult<()> {
//! let coordinator = SyncCoordinator::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(MockRemote::new()),
//!     SessionRegistry::new(),
//! )?;
//! let tasks = Location::new("https://example.net", "project", "task");
//! let found = coordinator
//!     .find(Query::new(tasks, Criteria::ids([ObjectId::new(5)])))
//!     .await?;
//! println!("{} objects", found.len());
//! # Ok(())
//! # }
//! ```

mod cache;
mod change;
mod coalesce;
mod config;
mod coordinator;
mod error;
mod events;
mod http;
mod identity;
mod prefetch;
mod search;
mod session;
pub mod transport;

pub use cache::{LocalCache, MemoryCache};
pub use change::{
    ChangeEntry, ChangeOptions, ChangeRequest, ChangeState, ChangeStatus, ChangeSummary, Conflict,
    ConflictHandler, PendingChange,
};
pub use config::{HttpConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use http::HttpTransport;
pub use identity::IdentityMap;
pub use search::{BlockingPolicy, Query, SearchDiff, SearchRequest, SearchStatus};
pub use session::{Session, SessionKind, SessionRegistry};
pub use transport::{Discovery, RemoteTransport, SessionInfo};
