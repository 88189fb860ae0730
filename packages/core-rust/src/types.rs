use serde::{Deserialize, Serialize};

/// A mapped identifier pair.
///
/// Serializes with the camelCase field names used on the wire
/// (`{"fromId": ..., "toId": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Externally-issued identifier.
    pub from_id: String,
    /// Internally-issued identifier.
    pub to_id: String,
}

impl Association {
    #[must_use]
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
        }
    }
}

/// Which side of an association an operation is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Keyed by `from_id`, resolves to `to_id`.
    Forward,
    /// Keyed by `to_id`, resolves to `from_id`.
    Reverse,
}

impl Direction {
    /// One-letter code used in bucket and table names.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Forward => "f",
            Self::Reverse => "t",
        }
    }

    /// The table family holding rows addressed by this direction's key.
    #[must_use]
    pub fn table_kind(self) -> TableKind {
        match self {
            Self::Forward => TableKind::FromIndexed,
            Self::Reverse => TableKind::ToIndexed,
        }
    }
}

/// The two families of sharded tables.
///
/// A from-indexed table for shard `i` holds every row whose `from_id` hashes
/// to `i`; a to-indexed table holds every row whose `to_id` hashes to `i`.
/// Either-direction point lookups therefore hit exactly one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    FromIndexed,
    ToIndexed,
}

impl TableKind {
    pub const ALL: [TableKind; 2] = [TableKind::FromIndexed, TableKind::ToIndexed];

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::FromIndexed => "f",
            Self::ToIndexed => "t",
        }
    }
}

/// Address of one physical table: family plus shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub kind: TableKind,
    pub shard: u32,
}

impl TableRef {
    #[must_use]
    pub fn new(kind: TableKind, shard: u32) -> Self {
        Self { kind, shard }
    }

    /// Physical table name: `prefix + "f" | "t" + shard`.
    ///
    /// # Examples
    ///
    /// ```
    /// use idmap_core::{TableKind, TableRef};
    ///
    /// let table = TableRef::new(TableKind::ToIndexed, 7);
    /// assert_eq!(table.name("id_mapping_"), "id_mapping_t7");
    /// ```
    #[must_use]
    pub fn name(&self, prefix: &str) -> String {
        format!("{prefix}{}{}", self.kind.code(), self.shard)
    }
}
