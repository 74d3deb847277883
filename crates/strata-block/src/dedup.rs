//! Lineage-based deduplication of compacted blocks.
//!
//! After compaction the same logical time range can be represented by
//! several blocks whose compaction-source sets overlap: a newer block whose
//! sources cover an older block's sources makes the older one redundant.
//! Blocks are partitioned by downsample resolution and, within a partition,
//! arranged into a forest whose edges are source-set containment; everything
//! below the first level is redundant and removed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use strata_core::BlockId;

use crate::error::SyncError;
use crate::filters::MetaFilter;
use crate::meta::BlockMeta;
use crate::metrics::{SyncMetrics, SyncedState};

/// Drops older blocks whose compaction source set is covered by a newer
/// block at the same resolution.
#[derive(Debug, Default)]
pub struct DeduplicateFilter {
    duplicate_ids: Mutex<Vec<BlockId>>,
}

impl DeduplicateFilter {
    /// Creates the filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block IDs removed by the last fetch.
    #[must_use]
    pub fn duplicate_ids(&self) -> Vec<BlockId> {
        self.duplicate_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MetaFilter for DeduplicateFilter {
    fn name(&self) -> &'static str {
        "deduplicate"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        let mut by_resolution: HashMap<i64, Vec<SourceSet>> = HashMap::new();
        for (id, m) in metas.iter() {
            by_resolution
                .entry(m.ext.downsample.resolution)
                .or_default()
                .push(SourceSet::new(*id, &m.compaction.sources));
        }

        let mut duplicates = Vec::new();
        for sets in by_resolution.into_values() {
            duplicates.extend(duplicates_in_partition(sets));
        }

        for id in &duplicates {
            metas.remove(id);
            metrics.inc_synced(SyncedState::Duplicate);
        }

        *self
            .duplicate_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = duplicates;
        Ok(())
    }
}

/// A block's identity plus its precomputed source set.
///
/// Source sets can run to thousands of IDs, so containment checks work on
/// hash sets built once per fetch instead of rescanning the descriptor
/// vectors.
struct SourceSet {
    id: BlockId,
    sources: HashSet<BlockId>,
}

impl SourceSet {
    fn new(id: BlockId, sources: &[BlockId]) -> Self {
        Self {
            id,
            sources: sources.iter().copied().collect(),
        }
    }
}

/// Finds the redundant blocks of a single resolution partition.
fn duplicates_in_partition(mut sets: Vec<SourceSet>) -> Vec<BlockId> {
    // Largest lineage first; ties broken toward the smaller (older) ID so
    // the outcome is independent of input order.
    sets.sort_by(|a, b| {
        b.sources
            .len()
            .cmp(&a.sources.len())
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut forest = SourceForest::new();
    for set in sets {
        forest.insert(set);
    }
    forest.below_first_level()
}

/// Forest whose edges are source-set containment.
///
/// Nodes live in an arena and reference each other by index; children keep
/// insertion order. Node 0 is a synthetic root with an empty source set
/// that never absorbs anything, so first-level children are exactly the
/// surviving blocks.
struct SourceForest {
    nodes: Vec<Node>,
}

struct Node {
    id: Option<BlockId>,
    sources: HashSet<BlockId>,
    children: Vec<usize>,
}

impl SourceForest {
    fn new() -> Self {
        Self {
            nodes: vec![Node {
                id: None,
                sources: HashSet::new(),
                children: Vec::new(),
            }],
        }
    }

    /// Inserts a block under the deepest node whose sources contain it.
    ///
    /// Sets equal to an existing node attach below that node (the earlier,
    /// larger-or-older block wins); strict subsets descend into the first
    /// containing child; everything else becomes a new child of the
    /// current node.
    fn insert(&mut self, set: SourceSet) {
        let new = self.nodes.len();
        self.nodes.push(Node {
            id: Some(set.id),
            sources: set.sources,
            children: Vec::new(),
        });

        let mut cur = 0;
        'descend: loop {
            for i in 0..self.nodes[cur].children.len() {
                let child = self.nodes[cur].children[i];
                if self.nodes[child].sources == self.nodes[new].sources {
                    self.nodes[child].children.push(new);
                    return;
                }
                if self.nodes[new].sources.is_subset(&self.nodes[child].sources) {
                    cur = child;
                    continue 'descend;
                }
            }
            self.nodes[cur].children.push(new);
            return;
        }
    }

    /// IDs of every node deeper than the first level.
    fn below_first_level(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        for &top in &self.nodes[0].children {
            let mut stack = self.nodes[top].children.clone();
            while let Some(n) = stack.pop() {
                if let Some(id) = self.nodes[n].id {
                    out.push(id);
                }
                stack.extend(self.nodes[n].children.iter().copied());
            }
        }
        out
    }
}
