//! `MappingStore` implementations.
//!
//! [`MemoryMappingStore`] is always available; [`PostgresMappingStore`] is
//! compiled with the `postgres` feature.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryMappingStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresMappingStore;
