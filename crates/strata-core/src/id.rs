//! Strongly-typed block identifiers.
//!
//! Block IDs are ULIDs: 128-bit, lexicographically sortable by creation time,
//! and globally unique without coordination. The string order of two IDs
//! equals their creation order, and the embedded millisecond timestamp is
//! recoverable without a lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Identifier of an immutable block in the object store.
///
/// A block is a directory named after its ID, containing chunk data plus a
/// `meta.json` descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Ulid);

impl BlockId {
    /// Generates a new unique block ID stamped with the current time.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a block ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Creates a block ID from an explicit timestamp and random component.
    ///
    /// Intended for tests that need deterministic IDs or IDs minted in the
    /// past; production code uses [`BlockId::generate`].
    #[must_use]
    pub const fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self(Ulid::from_parts(timestamp_ms, random))
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the millisecond Unix timestamp embedded in the ID.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }

    /// Parses a bucket directory entry into a block ID.
    ///
    /// Entries may carry a trailing `/` (directory-style listings). Returns
    /// `None` for anything that is not a valid ULID, which is how non-block
    /// objects at the bucket root are skipped during enumeration.
    #[must_use]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let name = name.strip_suffix('/').unwrap_or(name);
        Ulid::from_string(name).ok().map(Self)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid block ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_string() {
        let id = BlockId::generate();
        let parsed: BlockId = id.to_string().parse().expect("valid ID");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ordering_follows_timestamp() {
        let older = BlockId::from_parts(1_000, 42);
        let newer = BlockId::from_parts(2_000, 0);
        assert!(older < newer);
        assert!(older.to_string() < newer.to_string());
    }

    #[test]
    fn test_timestamp_is_recoverable() {
        let id = BlockId::from_parts(1_600_000_000_000, 7);
        assert_eq!(id.timestamp_ms(), 1_600_000_000_000);
        assert_eq!(id.created_at().timestamp_millis(), 1_600_000_000_000);
    }

    #[test]
    fn test_from_dir_name() {
        let id = BlockId::generate();
        assert_eq!(BlockId::from_dir_name(&format!("{id}/")), Some(id));
        assert_eq!(BlockId::from_dir_name(&id.to_string()), Some(id));
        assert_eq!(BlockId::from_dir_name("chunks/"), None);
        assert_eq!(BlockId::from_dir_name("debug.log"), None);
        assert_eq!(BlockId::from_dir_name(""), None);
    }

    #[test]
    fn test_invalid_string_is_rejected() {
        let err = "not-a-ulid".parse::<BlockId>().expect_err("must fail");
        assert!(matches!(err, Error::InvalidId { .. }));
    }
}
