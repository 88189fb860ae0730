//! In-memory state and persistent-store access for the mapping engine.
//!
//! - [`HotCache`]: forward and reverse association maps served to readers
//! - [`ExpiryQueue`]: insertion-ordered tokens driving promotion
//! - [`PendingBuffers`] / [`DelayedPurge`]: staging between promotion,
//!   storage, and hot-cache eviction
//! - [`DeleteBuckets`]: parity-rotated delete requests
//! - [`MappingStore`]: the sharded persistent-store contract, with adapters
//!   in [`datastores`]

pub mod datastores;
pub mod delete_buckets;
pub mod expiry_queue;
pub mod hot_cache;
pub mod mapping_store;
pub mod pending;

pub use delete_buckets::DeleteBuckets;
pub use expiry_queue::{ExpiryQueue, PopOutcome};
pub use hot_cache::HotCache;
pub use mapping_store::{ensure_tables, IdRow, MappingStore, StoreError};
pub use pending::{DelayedPurge, PendingBuffers, PendingSnapshot};
