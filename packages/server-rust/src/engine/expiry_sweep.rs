//! Retention sweep over every shard table.

use idmap_core::message_id::retention_boundary;
use idmap_core::{TableKind, TableRef};
use serde::Serialize;
use tracing::{debug, warn};

use super::Engine;

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Ids at or below this value were eligible.
    pub boundary: String,
    pub deleted: u64,
    /// Delete calls issued across all tables.
    pub calls: u64,
    /// Tables whose sweep stopped on an error.
    pub failed_tables: usize,
}

impl Engine {
    /// Deletes rows older than `db_cache_time` from every table.
    ///
    /// Each table is swept with bounded calls of `delete_count` rows until a
    /// call deletes fewer than that. A failing call ends that table's sweep
    /// and the next table is tried.
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let boundary = retention_boundary(now.saturating_sub(self.config.db_cache_millis()));
        let cap = self.config.delete_count;
        let mut report = SweepReport {
            boundary,
            ..SweepReport::default()
        };

        for shard in 0..self.config.hash_mod {
            for kind in TableKind::ALL {
                let table = TableRef::new(kind, shard);
                loop {
                    report.calls += 1;
                    match self.store.delete_expired(table, &report.boundary, cap).await {
                        Ok(deleted) => {
                            report.deleted += deleted;
                            if deleted < u64::from(cap) {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(?table, error = %err, "retention sweep failed for table");
                            report.failed_tables += 1;
                            break;
                        }
                    }
                }
            }
        }

        metrics::counter!("idmap_expired_rows_total").increment(report.deleted);
        debug!(
            boundary = %report.boundary,
            deleted = report.deleted,
            calls = report.calls,
            "retention sweep finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use idmap_core::message_id::timestamp_prefix;
    use idmap_core::{TableKind, TableRef};

    use crate::engine::test_support::{harness, message_id, small_config, T0};
    use crate::storage::{IdRow, MappingStore};

    const DAY_MS: u64 = 86_400_000;

    #[tokio::test]
    async fn old_rows_are_deleted_in_bounded_calls() {
        let h = harness(small_config()).await;
        let table = TableRef::new(TableKind::FromIndexed, 2);
        let old: Vec<IdRow> = (0..5)
            .map(|i| IdRow::new(message_id(T0 - 2 * DAY_MS + i, i), format!("v{i}")))
            .collect();
        let fresh = IdRow::new(message_id(T0 - 1_000, 9), "fresh");
        h.store.insert_batch(table, &old).await.unwrap();
        h.store.insert_batch(table, &[fresh.clone()]).await.unwrap();

        let report = h.engine.sweep_expired().await;
        assert_eq!(report.boundary, timestamp_prefix(T0 - DAY_MS));
        assert_eq!(report.deleted, 5);
        assert_eq!(report.failed_tables, 0);
        // delete_count is 2: the swept table takes 2 + 2 + 1, the other
        // seven tables one empty call each.
        assert_eq!(report.calls, 3 + 7);
        assert_eq!(h.store.row_count(table), 1);
        assert_eq!(
            h.store.select_to_id(table, &fresh.from_id).await.unwrap().as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn exact_multiple_of_cap_needs_one_more_call() {
        let h = harness(small_config()).await;
        let table = TableRef::new(TableKind::ToIndexed, 0);
        let rows: Vec<IdRow> = (0..4)
            .map(|i| IdRow::new(format!("2000010100000000{i}"), format!("v{i}")))
            .collect();
        h.store.insert_batch(table, &rows).await.unwrap();

        let report = h.engine.sweep_expired().await;
        assert_eq!(report.deleted, 4);
        // 2 + 2 + 0 on the swept table.
        assert_eq!(report.calls, 3 + 7);
    }

    #[tokio::test]
    async fn failing_table_is_skipped() {
        let h = harness(small_config()).await;
        let broken = TableRef::new(TableKind::FromIndexed, 1);
        h.store.fail_writes_to(broken);
        let ok_table = TableRef::new(TableKind::ToIndexed, 1);
        h.store
            .insert_batch(ok_table, &[IdRow::new("19990101000000000", "v")])
            .await
            .unwrap();

        let report = h.engine.sweep_expired().await;
        assert_eq!(report.failed_tables, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(h.store.row_count(ok_table), 0);
    }
}
