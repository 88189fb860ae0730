//! ID mapping server: hot cache, write-behind persistence to sharded tables,
//! binlog durability, peer fallback, and the HTTP surface.

pub mod binlog;
pub mod cluster;
pub mod engine;
pub mod network;
pub mod service;
pub mod storage;

pub use engine::Engine;
pub use service::{IdMappingService, MappingConfig, ScheduleConfig};
