//! Block descriptors and deletion markers.
//!
//! Every block directory carries a `meta.json` describing its sample range,
//! compaction lineage, and producer extensions, and may carry a
//! `deletion-mark.json` announcing its intended removal. The JSON layouts
//! here are a wire format shared with every producer and consumer of the
//! bucket; field names must not change. Unknown fields are tolerated so
//! newer producers can extend the descriptor without breaking older readers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use strata_core::{BlockId, BucketReader};

use crate::error::SyncError;

/// Descriptor file name inside a block directory.
pub const META_FILENAME: &str = "meta.json";

/// Deletion marker file name inside a block directory.
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

/// The only descriptor version this crate understands.
pub const META_VERSION_1: u32 = 1;

/// The only deletion marker version this crate understands.
pub const DELETION_MARK_VERSION_1: u32 = 1;

/// Downsampling resolutions, in milliseconds between aggregated samples.
pub mod resolution {
    /// Raw samples.
    pub const RAW: i64 = 0;
    /// 5-minute aggregates.
    pub const FIVE_MINUTES: i64 = 300_000;
    /// 1-hour aggregates.
    pub const ONE_HOUR: i64 = 3_600_000;
}

/// Returns the bucket path of a block's descriptor.
#[must_use]
pub fn meta_path(id: BlockId) -> String {
    format!("{id}/{META_FILENAME}")
}

/// Returns the bucket path of a block's deletion marker.
#[must_use]
pub fn deletion_mark_path(id: BlockId) -> String {
    format!("{id}/{DELETION_MARK_FILENAME}")
}

/// A block's `meta.json` descriptor.
///
/// Immutable on disk. The in-memory view may be rewritten by pipeline
/// modifiers, which always act on copies of the current fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Descriptor format version; must equal [`META_VERSION_1`].
    pub version: u32,
    /// The block's identity, repeated inside the descriptor.
    pub ulid: BlockId,
    /// Inclusive millisecond lower bound of contained samples.
    #[serde(rename = "minTime")]
    pub min_time: i64,
    /// Exclusive millisecond upper bound of contained samples.
    #[serde(rename = "maxTime")]
    pub max_time: i64,
    /// Content statistics.
    #[serde(default)]
    pub stats: BlockStats,
    /// Compaction lineage.
    #[serde(default)]
    pub compaction: Compaction,
    /// Producer-extension section (the `thanos` key of the wire format):
    /// external labels, downsample resolution, and producer tag.
    #[serde(default, rename = "thanos")]
    pub ext: ExternalMeta,
}

/// Sample/series/chunk counts of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockStats {
    /// Total samples.
    #[serde(default, rename = "numSamples")]
    pub num_samples: u64,
    /// Distinct series.
    #[serde(default, rename = "numSeries")]
    pub num_series: u64,
    /// Chunk files.
    #[serde(default, rename = "numChunks")]
    pub num_chunks: u64,
}

/// How a block came to be.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Compaction {
    /// Number of compactions applied transitively; 1 for fresh blocks.
    #[serde(default)]
    pub level: u32,
    /// Ancestor ingester-origin blocks merged (transitively) into this one.
    /// A freshly ingested block lists only itself.
    #[serde(default)]
    pub sources: Vec<BlockId>,
    /// Direct parents. Carried through untouched; the synchronization core
    /// never inspects them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockDesc>,
}

/// Abbreviated reference to another block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    /// The referenced block.
    pub ulid: BlockId,
    /// Its inclusive millisecond lower sample bound.
    #[serde(rename = "minTime")]
    pub min_time: i64,
    /// Its exclusive millisecond upper sample bound.
    #[serde(rename = "maxTime")]
    pub max_time: i64,
}

/// Producer-extension section of the descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalMeta {
    /// External key/value labels identifying the producer, shard, and
    /// replica. Sorted for deterministic serialization.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Downsampling state.
    #[serde(default)]
    pub downsample: Downsample,
    /// Which component produced the block.
    #[serde(default)]
    pub source: BlockSource,
}

/// Downsampling state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Downsample {
    /// Milliseconds between aggregated samples; see [`resolution`].
    #[serde(default)]
    pub resolution: i64,
}

/// Producer tag recorded in a block's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlockSource {
    /// Ingestion endpoint receiving remote writes.
    #[serde(rename = "receive")]
    Receive,
    /// Recording/alerting rule evaluator.
    #[serde(rename = "ruler")]
    Ruler,
    /// Scrape-node sidecar uploader.
    #[serde(rename = "sidecar")]
    Sidecar,
    /// The compactor's merge output.
    #[serde(rename = "compactor")]
    Compactor,
    /// Blocks rewritten by compactor repair.
    #[serde(rename = "compactor-repair")]
    CompactorRepair,
    /// Blocks rewritten by offline bucket repair.
    #[serde(rename = "bucket-repair")]
    BucketRepair,
    /// The downsampler's aggregate output.
    #[serde(rename = "downsampler")]
    Downsampler,
    /// Unrecognized producer tag, tolerated for forward compatibility.
    #[default]
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl BlockSource {
    /// Whether this producer uploads blocks atomically.
    ///
    /// Atomic uploaders never expose a half-written block, so the
    /// consistency delay does not apply to them.
    #[must_use]
    pub fn is_atomic_uploader(self) -> bool {
        matches!(
            self,
            Self::BucketRepair | Self::Compactor | Self::CompactorRepair
        )
    }
}

/// A block's `deletion-mark.json` sidecar.
///
/// Declares the block's intended deletion time. Consumers keep serving the
/// block for a grace period so replacement blocks can settle first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// The marked block.
    pub id: BlockId,
    /// Marker format version; must equal [`DELETION_MARK_VERSION_1`].
    pub version: u32,
    /// Unix-second timestamp at which deletion was requested.
    pub deletion_time: i64,
}

/// Reads a block's deletion marker from the bucket.
///
/// # Errors
///
/// Returns [`SyncError::DeletionMarkNotFound`] when the block carries no
/// marker (the common case), [`SyncError::DeletionMarkCorrupted`] when the
/// marker exists but does not parse, and a storage error for transport
/// failures.
pub async fn read_deletion_mark(
    bucket: &dyn BucketReader,
    id: BlockId,
) -> Result<DeletionMark, SyncError> {
    let path = deletion_mark_path(id);
    let raw = match bucket.get(&path).await {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => return Err(SyncError::DeletionMarkNotFound),
        Err(e) => return Err(SyncError::storage(format!("get {path}"), e)),
    };

    let mark: DeletionMark =
        serde_json::from_slice(&raw).map_err(|e| SyncError::DeletionMarkCorrupted {
            block: id,
            message: e.to_string(),
        })?;

    if mark.version != DELETION_MARK_VERSION_1 {
        return Err(SyncError::UnexpectedDeletionMarkVersion {
            block: id,
            version: mark.version,
        });
    }

    Ok(mark)
}
