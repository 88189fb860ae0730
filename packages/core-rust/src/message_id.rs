//! Timestamp prefix of the sortable message identifiers used as `fromId`.
//!
//! Ids are minted by the producers, not here. They look like
//! `yyyyMMddHHmmssSSS` (UTC) followed by a 3-digit account discriminator, a
//! 3-digit host discriminator, and 13 random alphanumeric characters. Because the timestamp leads, lexicographic order of ids is
//! chronological order, which is what the storage retention sweep relies on:
//! it deletes every row whose id sorts at or below [`retention_boundary`].

use chrono::{DateTime, Utc};

/// `chrono` format string for the leading timestamp.
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Formats epoch milliseconds as the 17-digit id timestamp prefix.
///
/// Out-of-range inputs clamp to the Unix epoch.
///
/// # Examples
///
/// ```
/// use idmap_core::message_id::timestamp_prefix;
///
/// assert_eq!(timestamp_prefix(0), "19700101000000000");
/// assert_eq!(timestamp_prefix(1_700_000_000_123), "20231114221320123");
/// ```
#[must_use]
pub fn timestamp_prefix(millis: u64) -> String {
    let dt = i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default();
    dt.format(TIMESTAMP_FORMAT).to_string()
}

/// The highest id considered expired at `millis`.
///
/// This is the bare timestamp prefix: every id generated strictly before
/// `millis` sorts below it, and every id generated at or after it sorts
/// above (a longer string with an equal prefix is greater).
#[must_use]
pub fn retention_boundary(millis: u64) -> String {
    timestamp_prefix(millis)
}

#[cfg(test)]
mod tests {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    use super::*;
    use crate::hash::fnv1a_hash;

    const RANDOM_SUFFIX_LEN: usize = 13;

    /// Producer-side id layout.
    struct MessageIdGenerator {
        host_discriminator: u32,
    }

    impl MessageIdGenerator {
        fn new(host: &str) -> Self {
            Self {
                host_discriminator: fnv1a_hash(host) % 1000,
            }
        }

        fn generate(&self, millis: u64, account: &str) -> String {
            let suffix: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(RANDOM_SUFFIX_LEN)
                .map(char::from)
                .collect();
            format!(
                "{}{:03}{:03}{}",
                timestamp_prefix(millis),
                fnv1a_hash(account) % 1000,
                self.host_discriminator,
                suffix
            )
        }
    }

    #[test]
    fn generated_ids_have_fixed_width() {
        let id = MessageIdGenerator::new("10.0.0.1").generate(1_700_000_000_000, "acct");
        assert_eq!(id.len(), 17 + 3 + 3 + RANDOM_SUFFIX_LEN);
        assert!(id.starts_with("20231114221320000"));
    }

    #[test]
    fn ids_sort_chronologically() {
        let generator = MessageIdGenerator::new("host");
        let earlier = generator.generate(1_700_000_000_000, "a");
        let later = generator.generate(1_700_000_000_001, "a");
        assert!(earlier < later);
    }

    #[test]
    fn boundary_splits_before_and_after() {
        let generator = MessageIdGenerator::new("host");
        let boundary = retention_boundary(1_700_000_000_500);
        let old = generator.generate(1_700_000_000_499, "a");
        let fresh = generator.generate(1_700_000_000_500, "a");
        assert!(old <= boundary);
        assert!(fresh > boundary);
    }

    #[test]
    fn out_of_range_millis_clamp_to_epoch() {
        assert_eq!(timestamp_prefix(u64::MAX), "19700101000000000");
    }
}
