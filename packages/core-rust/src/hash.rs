//! FNV-1a hashing and shard routing for identifiers.
//!
//! Every component that talks to persistent storage picks its table through
//! [`shard_of`]. The hash is computed from the identifier's UTF-8 bytes only,
//! so the same id lands on the same shard on every instance and across
//! process restarts.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over the UTF-8 bytes of a string.
///
/// # Examples
///
/// ```
/// use idmap_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps an identifier to one of `modulo` storage shards.
///
/// The result is always in `[0, modulo)`. A `modulo` of zero is treated as a
/// single shard; configuration validation rejects it before it gets here.
///
/// # Examples
///
/// ```
/// use idmap_core::hash::shard_of;
///
/// assert!(shard_of("u1", 64) < 64);
/// assert_eq!(shard_of("u1", 64), shard_of("u1", 64));
/// ```
#[must_use]
pub fn shard_of(id: &str, modulo: u32) -> u32 {
    if modulo == 0 {
        return 0;
    }
    fnv1a_hash(id) % modulo
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fnv1a_hash_hello() {
        assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
    }

    #[test]
    fn fnv1a_hash_empty() {
        assert_eq!(fnv1a_hash(""), 2_166_136_261);
    }

    #[test]
    fn fnv1a_hash_case_sensitive() {
        assert_ne!(fnv1a_hash("Hello"), fnv1a_hash("hello"));
    }

    #[test]
    fn shard_of_zero_modulo_is_single_shard() {
        assert_eq!(shard_of("anything", 0), 0);
    }

    #[test]
    fn shard_of_single_shard() {
        assert_eq!(shard_of("a", 1), 0);
        assert_eq!(shard_of("b", 1), 0);
    }

    #[test]
    fn shard_of_spreads_ids() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(shard_of(&format!("id-{i}"), 64));
        }
        // 1000 ids over 64 shards should touch nearly all of them.
        assert!(seen.len() > 56, "only {} shards used", seen.len());
    }

    proptest! {
        #[test]
        fn shard_of_in_range(id in ".*", modulo in 1u32..1024) {
            prop_assert!(shard_of(&id, modulo) < modulo);
        }

        #[test]
        fn shard_of_is_deterministic(id in "[a-z0-9]{1,40}", modulo in 1u32..256) {
            prop_assert_eq!(shard_of(&id, modulo), shard_of(&id.clone(), modulo));
        }
    }
}
