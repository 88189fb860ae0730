use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Engine configuration: sharding, batching, retention, and binlog layout.
///
/// Every field has a default matching the production deployment; tests
/// override individual fields with struct update syntax.
#[derive(Debug, Clone)]
pub struct MappingConfig {
    /// Number of storage shards per table family.
    pub hash_mod: u32,
    /// Concurrent workers in the batch I/O pool.
    pub enter_db_thread_size: usize,
    /// Tasks the pool accepts before callers run work inline.
    pub pool_queue_capacity: usize,
    /// Reverse-cache size that triggers a force flush.
    pub limit_count: usize,
    /// Row cap per retention-sweep delete call.
    pub delete_count: u32,
    /// Row cap per batched insert or delete-by-key call.
    pub batch_count: usize,
    /// How long an association stays hot before promotion, and how long a
    /// dispatched association stays hot before delayed purge.
    pub mem_cache_time: Duration,
    /// How long rows are retained in storage.
    pub db_cache_time: Duration,
    /// Table name prefix; tables are `prefix + "f" | "t" + shard`.
    pub table_prefix: String,
    /// Binlog directory. Empty means the executable's directory.
    pub binlog_dir: PathBuf,
    /// Records per binlog file.
    pub binlog_chunk_size: usize,
    /// Peer answers at or above this length are rejected.
    pub peer_max_value_len: usize,
    /// Upper bound on waiting for a dispatch round.
    pub dispatch_wait: Duration,
    /// Upper bound on waiting for a periodic job's lock.
    pub lock_wait: Duration,
    /// Re-queue rows of failed insert chunks instead of scheduling their purge.
    pub retry_failed_chunks: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            hash_mod: 64,
            enter_db_thread_size: 16,
            pool_queue_capacity: 4096,
            limit_count: 20_000,
            delete_count: 5_000,
            batch_count: 2_000,
            mem_cache_time: Duration::from_secs(600),
            db_cache_time: Duration::from_secs(86_400),
            table_prefix: "id_mapping_".to_string(),
            binlog_dir: PathBuf::new(),
            binlog_chunk_size: 1_000,
            peer_max_value_len: 40,
            dispatch_wait: Duration::from_secs(600),
            lock_wait: Duration::from_secs(60),
            retry_failed_chunks: false,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("table prefix {0:?} may only contain ASCII letters, digits and '_'")]
    BadTablePrefix(String),
}

impl MappingConfig {
    /// Checks the invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks: [(&'static str, bool); 6] = [
            ("hash_mod", self.hash_mod == 0),
            ("enter_db_thread_size", self.enter_db_thread_size == 0),
            ("limit_count", self.limit_count == 0),
            ("delete_count", self.delete_count == 0),
            ("batch_count", self.batch_count == 0),
            ("binlog_chunk_size", self.binlog_chunk_size == 0),
        ];
        if let Some((field, _)) = zero_checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Zero { field });
        }
        let prefix_ok = !self.table_prefix.is_empty()
            && self
                .table_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !prefix_ok {
            return Err(ConfigError::BadTablePrefix(self.table_prefix.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn mem_cache_millis(&self) -> u64 {
        u64::try_from(self.mem_cache_time.as_millis()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn db_cache_millis(&self) -> u64 {
        u64::try_from(self.db_cache_time.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Initial delay and period of one periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl JobSchedule {
    #[must_use]
    pub const fn new(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period,
        }
    }
}

/// Cadences of the background jobs.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub promotion: JobSchedule,
    pub persistence: JobSchedule,
    pub binlog: JobSchedule,
    pub peer_refresh: JobSchedule,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            promotion: JobSchedule::new(Duration::from_secs(60), Duration::from_secs(10)),
            persistence: JobSchedule::new(Duration::from_secs(60), Duration::from_secs(60)),
            binlog: JobSchedule::new(Duration::from_secs(60), Duration::from_secs(60)),
            peer_refresh: JobSchedule::new(Duration::from_secs(60), Duration::from_secs(60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let config = MappingConfig::default();
        assert_eq!(config.hash_mod, 64);
        assert_eq!(config.enter_db_thread_size, 16);
        assert_eq!(config.limit_count, 20_000);
        assert_eq!(config.delete_count, 5_000);
        assert_eq!(config.batch_count, 2_000);
        assert_eq!(config.mem_cache_time, Duration::from_secs(600));
        assert_eq!(config.db_cache_time, Duration::from_secs(86_400));
        assert_eq!(config.table_prefix, "id_mapping_");
        assert!(!config.retry_failed_chunks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_hash_mod_is_rejected() {
        let config = MappingConfig {
            hash_mod: 0,
            ..MappingConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "hash_mod" })
        );
    }

    #[test]
    fn zero_batch_count_is_rejected() {
        let config = MappingConfig {
            batch_count: 0,
            ..MappingConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "batch_count" })
        );
    }

    #[test]
    fn table_prefix_must_be_sql_safe() {
        let config = MappingConfig {
            table_prefix: "id; drop".to_string(),
            ..MappingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadTablePrefix(_))
        ));
    }

    #[test]
    fn schedule_defaults() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.promotion.period, Duration::from_secs(10));
        assert_eq!(schedule.promotion.initial_delay, Duration::from_secs(60));
        assert_eq!(schedule.persistence.period, Duration::from_secs(60));
    }

    #[test]
    fn millis_helpers() {
        let config = MappingConfig::default();
        assert_eq!(config.mem_cache_millis(), 600_000);
        assert_eq!(config.db_cache_millis(), 86_400_000);
    }
}
