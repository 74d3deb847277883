//! Block fixtures for tests.
//!
//! [`BlockFixture`] builds complete block descriptors the way producers
//! write them: a `meta.json` under the block's directory, optionally
//! accompanied by a deletion marker. Defaults describe a freshly ingested
//! two-hour raw block whose lineage lists only itself.

use std::collections::BTreeMap;

use strata_block::meta::{
    deletion_mark_path, meta_path, BlockMeta, BlockSource, BlockStats, Compaction, DeletionMark,
    Downsample, ExternalMeta, DELETION_MARK_VERSION_1, META_VERSION_1,
};
use strata_core::BlockId;

use crate::storage::BucketWriter;

/// Builder for a block descriptor inside a test bucket.
#[derive(Debug, Clone)]
pub struct BlockFixture {
    id: BlockId,
    version: u32,
    min_time: i64,
    max_time: i64,
    labels: BTreeMap<String, String>,
    resolution: i64,
    source: BlockSource,
    sources: Option<Vec<BlockId>>,
    stats: BlockStats,
}

impl BlockFixture {
    /// Creates a fixture with a fresh ID and default content.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: BlockId::generate(),
            version: META_VERSION_1,
            min_time: 0,
            max_time: 7_200_000,
            labels: BTreeMap::new(),
            resolution: 0,
            source: BlockSource::Sidecar,
            sources: None,
            stats: BlockStats {
                num_samples: 120,
                num_series: 1,
                num_chunks: 2,
            },
        }
    }

    /// Uses an explicit block ID.
    #[must_use]
    pub fn id(mut self, id: BlockId) -> Self {
        self.id = id;
        self
    }

    /// Overrides the descriptor version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the sample time range in milliseconds.
    #[must_use]
    pub fn time_range(mut self, min_time: i64, max_time: i64) -> Self {
        self.min_time = min_time;
        self.max_time = max_time;
        self
    }

    /// Sets the external labels.
    #[must_use]
    pub fn labels(mut self, pairs: &[(&str, &str)]) -> Self {
        self.labels = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self
    }

    /// Sets the downsample resolution in milliseconds.
    #[must_use]
    pub fn resolution(mut self, resolution: i64) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the producer tag.
    #[must_use]
    pub fn source(mut self, source: BlockSource) -> Self {
        self.source = source;
        self
    }

    /// Sets the compaction source lineage. Without this, the block lists
    /// only itself, like a freshly ingested block.
    #[must_use]
    pub fn sources(mut self, sources: Vec<BlockId>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// The descriptor this fixture describes.
    #[must_use]
    pub fn build(&self) -> BlockMeta {
        BlockMeta {
            version: self.version,
            ulid: self.id,
            min_time: self.min_time,
            max_time: self.max_time,
            stats: self.stats,
            compaction: Compaction {
                level: 1,
                sources: self.sources.clone().unwrap_or_else(|| vec![self.id]),
                parents: Vec::new(),
            },
            ext: ExternalMeta {
                labels: self.labels.clone(),
                downsample: Downsample {
                    resolution: self.resolution,
                },
                source: self.source,
            },
        }
    }

    /// Writes the descriptor into `bucket` and returns the block ID.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor fails to serialize, which means the fixture
    /// itself is broken.
    pub fn write_to(&self, bucket: &impl BucketWriter) -> BlockId {
        let raw = serde_json::to_vec(&self.build()).expect("serialize fixture meta.json");
        bucket.put(&meta_path(self.id), raw);
        self.id
    }
}

impl Default for BlockFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a deletion marker for `id` with the given Unix-second timestamp.
///
/// # Panics
///
/// Panics if the marker fails to serialize.
pub fn write_deletion_mark(bucket: &impl BucketWriter, id: BlockId, deletion_time: i64) {
    let mark = DeletionMark {
        id,
        version: DELETION_MARK_VERSION_1,
        deletion_time,
    };
    let raw = serde_json::to_vec(&mark).expect("serialize fixture deletion mark");
    bucket.put(&deletion_mark_path(id), raw);
}
