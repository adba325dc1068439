//! # Veil Sync (veil-sync)
//!
//! Synchronization engine for per-item hidden/dimmed/normal state shared
//! between a fast volatile cache and an authoritative persistent store
//! reached over an asynchronous message channel.
//!
//! ## Features
//!
//! - Bounded LRU state cache with consistency validation and repair
//! - Last-writer-wins merging by `updatedAt`, with deletion stamps
//! - Request coalescing: at most one in-flight fetch per id
//! - Messaging client with timeouts, error classification and exponential backoff
//! - Optimistic updates with rollback
//! - Write batching in front of the persistent store
//!
//! ## Reading state
//!
//! ```no_run
//! use std::sync::Arc;
//! use veil_sync::{
//!     BatchConfig, LocalTransport, MemoryStore, StateService, SyncClient, SyncConfig,
//!     WriteBatcher,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig::from_env()?;
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let batcher = WriteBatcher::new(store.clone(), BatchConfig::default());
//!     let service = StateService::new(store, batcher, config.max_stored_records);
//!     let client = SyncClient::new(&config, Arc::new(LocalTransport::new(service)))?;
//!
//!     let ids = vec!["video-1".to_string(), "video-2".to_string()];
//!     for (id, record) in client.fetch_many(&ids).await {
//!         println!("{}: {:?}", id, record.map(|r| r.state));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Optimistic updates
//!
//! ```no_run
//! # use veil_sync::{ItemState, SyncClient};
//! # async fn example(client: SyncClient) -> anyhow::Result<()> {
//! // The cache shows the new state immediately; it is rolled back if the
//! // authoritative side fails to confirm it
//! match client.set_state("video-1", ItemState::Hidden, "Some title").await {
//!     Ok(record) => println!("Confirmed: {:?}", record),
//!     Err(e) => println!("Rolled back ({}): {}", e.kind(), e),
//! }
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod cache;
pub mod classify;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod error_log;
pub mod messaging;
pub mod persist;
pub mod protocol;
pub mod record;
pub mod service;
pub mod sync;
pub mod telemetry;

// Re-export main types for convenience
pub use batcher::{BatchConfig, WriteBatcher};
pub use cache::{CacheConfig, CacheConfigBuilder, CacheStats, Lookup, Snapshot, StateCache};
pub use classify::{classify, ErrorKind, Failure};
pub use coalescer::RequestCoalescer;
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use error_log::{ErrorLog, ErrorLogEntry};
pub use messaging::{MessagingClient, RetryPolicy, Transport};
pub use persist::{MemoryStore, PersistentStore};
pub use protocol::{Envelope, Page, PageRequest, Request, StoreStats};
pub use record::{ItemState, Record};
pub use service::{LocalTransport, StateService};
pub use sync::{MutationState, OptimisticUpdate, Readiness, SyncClient};
pub use telemetry::init_tracing;
