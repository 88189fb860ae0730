//! Promotion: hot-only associations whose TTL elapsed move into the pending
//! buffers.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::Engine;
use crate::storage::PopOutcome;

/// Outcome of one promotion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    /// Tokens whose association was staged.
    pub promoted: usize,
    /// Due tokens whose fromId was no longer hot.
    pub dropped: usize,
    /// Unparsable tokens discarded.
    pub malformed: usize,
    /// The capacity watchdog had requested a full flush.
    pub forced: bool,
}

impl Engine {
    /// Drains every due expiry token into the pending buffers.
    ///
    /// The cutoff is `now - mem_cache_time`, or `now` when the capacity
    /// watchdog fired since the last run. The force flag is captured and
    /// cleared before the queue is read. Work is proportional to the number
    /// of due tokens; the first token past the cutoff ends the run.
    pub fn promote(&self) -> PromotionReport {
        let forced = self.hot.take_force_flush();
        let now = self.clock.now();
        let cutoff = if forced {
            now
        } else {
            now.saturating_sub(self.config.mem_cache_millis())
        };

        let mut report = PromotionReport {
            forced,
            ..PromotionReport::default()
        };
        loop {
            match self.expiry.pop_due(cutoff) {
                PopOutcome::Due(token) => match self.hot.lookup_forward(&token.from_id) {
                    Some(to_id) => {
                        self.pending.stage(&token.from_id, &to_id);
                        report.promoted += 1;
                    }
                    None => {
                        info!(from_id = %token.from_id, "expired id is no longer hot, dropping");
                        report.dropped += 1;
                    }
                },
                PopOutcome::Malformed(err) => {
                    warn!(error = %err, "discarding malformed expiry token");
                    report.malformed += 1;
                }
                PopOutcome::NotDue | PopOutcome::Empty => break,
            }
        }

        metrics::counter!("idmap_promoted_total").increment(report.promoted as u64);
        if forced || report.promoted > 0 {
            info!(
                promoted = report.promoted,
                dropped = report.dropped,
                forced,
                remaining = self.expiry.len(),
                "promotion finished"
            );
        } else {
            debug!(remaining = self.expiry.len(), "nothing due for promotion");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::engine::test_support::{harness, small_config, T0};
    use crate::service::config::MappingConfig;

    #[tokio::test]
    async fn nothing_is_promoted_before_ttl() {
        let h = harness(small_config()).await;
        h.engine.insert("u1", "v1");
        h.clock.advance(Duration::from_secs(599));
        let report = h.engine.promote();
        assert_eq!(report.promoted, 0);
        assert_eq!(h.engine.expiry().len(), 1);
        assert!(!h.engine.pending().contains_forward("u1"));
    }

    #[tokio::test]
    async fn promotion_follows_insertion_order_and_cutoff() {
        let h = harness(small_config()).await;
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            h.clock.set(T0 + i as u64 * 1_000);
            h.engine.insert(id, &format!("{id}-to"));
        }
        // ttl is 600s; cutoff lands between "b" and "c".
        h.clock.set(T0 + 601_500);
        let report = h.engine.promote();
        assert_eq!(report.promoted, 2);
        assert!(h.engine.pending().contains_forward("a"));
        assert!(h.engine.pending().contains_forward("b"));
        assert!(!h.engine.pending().contains_forward("c"));
        assert_eq!(h.engine.expiry().len(), 2);
    }

    #[tokio::test]
    async fn promotion_leaves_hot_cache_alone() {
        let h = harness(small_config()).await;
        h.engine.insert("u1", "v1");
        h.clock.advance(Duration::from_secs(601));
        h.engine.promote();
        assert_eq!(h.engine.lookup_forward("u1").as_deref(), Some("v1"));
        assert!(h.engine.pending().contains_reverse("v1"));
    }

    #[tokio::test]
    async fn deleted_ids_are_dropped_not_staged() {
        let h = harness(small_config()).await;
        h.engine.insert("u1", "v1");
        h.engine.delete_forward("u1");
        h.clock.advance(Duration::from_secs(601));
        let report = h.engine.promote();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.promoted, 0);
        assert!(!h.engine.pending().contains_forward("u1"));
    }

    #[tokio::test]
    async fn malformed_tokens_are_counted() {
        let h = harness(small_config()).await;
        h.engine.expiry().push_token("garbage".to_string());
        let report = h.engine.promote();
        assert_eq!(report.malformed, 1);
        assert!(h.engine.expiry().is_empty());
    }

    #[tokio::test]
    async fn force_flush_promotes_everything_then_resets() {
        let h = harness(MappingConfig {
            limit_count: 20_000,
            ..small_config()
        })
        .await;
        for i in 0..20_000 {
            h.engine.insert(&format!("from-{i}"), &format!("to-{i}"));
        }
        assert!(h.engine.hot().force_flush_requested());

        let report = h.engine.promote();
        assert!(report.forced);
        assert_eq!(report.promoted, 20_000);
        assert!(h.engine.expiry().is_empty());
        assert!(!h.engine.hot().force_flush_requested());

        h.engine.insert("late", "late-to");
        let report = h.engine.promote();
        assert!(report.forced, "hot cache is still above the limit");
    }

    #[tokio::test]
    async fn below_limit_run_is_not_forced() {
        let h = harness(MappingConfig {
            limit_count: 3,
            ..small_config()
        })
        .await;
        h.engine.insert("a", "1");
        h.engine.insert("b", "2");
        let report = h.engine.promote();
        assert!(!report.forced);
        assert_eq!(report.promoted, 0);
    }
}
