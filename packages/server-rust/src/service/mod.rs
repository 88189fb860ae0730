//! Service layer: configuration, the request-facing facade, and the
//! periodic jobs that drive the engine.

pub mod config;
pub mod jobs;
pub mod mapping;
pub mod scheduler;

pub use config::{ConfigError, JobSchedule, MappingConfig, ScheduleConfig};
pub use jobs::{spawn_all, BinlogJob, JobHandles, PeerRefreshJob, PersistenceJob, PromotionJob};
pub use mapping::{IdMappingService, LookupSource};
pub use scheduler::{PeriodicJob, ScheduledJob, Scheduler};
