//! # Front-end State Cache
//!
//! This module implements the bounded cache that answers "is this item
//! hidden or dimmed?" without crossing the boundary channel.
//!
//! ## Features
//!
//! - **LRU Eviction**: victims are ranked purely by access recency
//! - **Last-Writer-Wins Merges**: fetched records never overwrite a newer
//!   or equally new cached stamp
//! - **Deletion Stamps**: deleting a record remembers when, so late fetch
//!   responses cannot resurrect it
//! - **Self-Diagnosis**: consistency audit and repair of the co-indexed maps
//!
//! ## Example
//!
//! ```rust
//! use veil_sync::cache::{CacheConfig, StateCache};
//! use veil_sync::{ItemState, Record};
//!
//! # async fn example() {
//! let cache = StateCache::new(CacheConfig::builder().capacity(1_000).build());
//!
//! cache
//!     .apply_update("video:42", Some(Record::new("video:42", ItemState::Hidden, "Clip")))
//!     .await;
//!
//! if let Some(record) = cache.get("video:42").await {
//!     println!("cached state: {}", record.state);
//! }
//! # }
//! ```

pub mod config;
pub mod lru;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use lru::{AuxHandle, ConsistencyReport, ConsistencyViolation, LruEngine, RepairAction};
pub use store::{Lookup, Snapshot, StateCache};
pub use types::CacheStats;
