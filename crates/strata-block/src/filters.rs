//! Filter and modifier stages of the fetch pipeline.
//!
//! Stages run sequentially, in registration order, over the meta map of the
//! current fetch. Filters delete entries; modifiers rewrite entries in
//! place. Both share the [`MetaFilter`] capability. The order is a caller
//! contract: the canonical compaction pipeline registers time partitioning,
//! label sharding, consistency delay, deletion markers, replica-label
//! removal, and deduplication, in that order, each stage relying on earlier
//! stages having removed irrelevant blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_core::{BlockId, BucketReader};

use crate::error::SyncError;
use crate::meta::{self, BlockMeta, DeletionMark};
use crate::metrics::{self, ModifiedKind, SyncMetrics, SyncedState};
use crate::relabel::{self, RelabelRule};

/// A stage in the fetch pipeline.
#[async_trait]
pub trait MetaFilter: Send + Sync {
    /// Stage name, used when wrapping stage errors.
    fn name(&self) -> &'static str;

    /// Applies the stage to the current fetch's meta map.
    ///
    /// `incomplete_view` tells the stage whether transient failures left
    /// holes in `metas`; stages that would act destructively on missing
    /// information can use it to back off.
    ///
    /// # Errors
    ///
    /// A stage error aborts the whole fetch.
    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        incomplete_view: bool,
    ) -> Result<(), SyncError>;
}

/// A time bound, either absolute or relative to the moment of evaluation.
#[derive(Debug, Clone, Copy)]
pub enum TimeOrDuration {
    /// Millisecond Unix timestamp.
    Timestamp(i64),
    /// Subtracted from the current time at each evaluation.
    RelativeToNow(chrono::Duration),
}

impl TimeOrDuration {
    /// Resolves the bound against `now`.
    #[must_use]
    pub fn resolve(&self, now: DateTime<Utc>) -> i64 {
        match self {
            Self::Timestamp(ms) => *ms,
            Self::RelativeToNow(d) => (now - *d).timestamp_millis(),
        }
    }
}

/// Drops blocks whose sample range does not intersect the configured window.
///
/// A block survives when `max_time >= min && min_time <= max`. Relative
/// bounds are resolved against the clock at every invocation.
pub struct TimePartitionFilter {
    min_time: TimeOrDuration,
    max_time: TimeOrDuration,
}

impl TimePartitionFilter {
    /// Creates the filter with the given window.
    #[must_use]
    pub fn new(min_time: TimeOrDuration, max_time: TimeOrDuration) -> Self {
        Self { min_time, max_time }
    }
}

#[async_trait]
impl MetaFilter for TimePartitionFilter {
    fn name(&self) -> &'static str {
        "time-partition"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let min = self.min_time.resolve(now);
        let max = self.max_time.resolve(now);

        metas.retain(|_, m| {
            if m.max_time >= min && m.min_time <= max {
                return true;
            }
            metrics.inc_synced(SyncedState::TimeExcluded);
            false
        });
        Ok(())
    }
}

/// Synthetic label carrying the block ID into the relabel ruleset.
pub const BLOCK_ID_LABEL: &str = "__block_id";

/// Drops blocks rejected by a relabel ruleset over their external labels.
///
/// Each block is presented to the ruleset as its external labels plus a
/// synthetic [`BLOCK_ID_LABEL`]; a block whose processed label set comes
/// back empty belongs to another shard and is dropped.
pub struct LabelShardedFilter {
    rules: Vec<RelabelRule>,
}

impl LabelShardedFilter {
    /// Creates the filter with the given ruleset.
    #[must_use]
    pub fn new(rules: Vec<RelabelRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl MetaFilter for LabelShardedFilter {
    fn name(&self) -> &'static str {
        "label-sharded"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        metas.retain(|id, m| {
            let mut lbls = m.ext.labels.clone();
            lbls.insert(BLOCK_ID_LABEL.to_string(), id.to_string());

            match relabel::process(&lbls, &self.rules) {
                Some(processed) if !processed.is_empty() => true,
                _ => {
                    metrics.inc_synced(SyncedState::LabelExcluded);
                    false
                }
            }
        });
        Ok(())
    }
}

/// Drops blocks whose ID was minted more recently than the consistency
/// delay.
///
/// Non-atomic uploads need time to settle before the block's full content
/// is reliably visible; until then the block is treated as not-yet-there.
/// Producers whose uploads are atomic are exempt. The creation time comes
/// from the ULID, not from object modification time, so a block uploaded
/// long after its ID was minted is only protected by the exemption list.
pub struct ConsistencyDelayFilter {
    delay: Duration,
}

impl ConsistencyDelayFilter {
    /// Creates the filter and publishes `consistency_delay_seconds`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        metrics::set_consistency_delay(delay.as_secs_f64());
        Self { delay }
    }
}

#[async_trait]
impl MetaFilter for ConsistencyDelayFilter {
    fn name(&self) -> &'static str {
        "consistency-delay"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);

        metas.retain(|id, m| {
            if now_ms.saturating_sub(id.timestamp_ms()) < delay_ms
                && !m.ext.source.is_atomic_uploader()
            {
                tracing::debug!(block = %id, "block is too fresh for now");
                metrics.inc_synced(SyncedState::TooFresh);
                return false;
            }
            true
        });
        Ok(())
    }
}

/// Drops blocks whose deletion marker is older than the grace delay.
///
/// Marked blocks keep being served during the grace period so replacement
/// blocks can appear before the old one vanishes from views. The full
/// marker map is exposed independent of the delay and recomputed on every
/// fetch.
pub struct IgnoreDeletionMarkFilter {
    bucket: Arc<dyn BucketReader>,
    delay: Duration,
    deletion_marks: Mutex<HashMap<BlockId, DeletionMark>>,
}

impl IgnoreDeletionMarkFilter {
    /// Creates the filter.
    #[must_use]
    pub fn new(bucket: Arc<dyn BucketReader>, delay: Duration) -> Self {
        Self {
            bucket,
            delay,
            deletion_marks: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks carrying a valid deletion marker, as of the last fetch.
    #[must_use]
    pub fn deletion_mark_blocks(&self) -> HashMap<BlockId, DeletionMark> {
        self.deletion_marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MetaFilter for IgnoreDeletionMarkFilter {
    fn name(&self) -> &'static str {
        "ignore-deletion-mark"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        let mut marks = HashMap::new();
        let now = Utc::now().timestamp();
        let delay_secs = i64::try_from(self.delay.as_secs()).unwrap_or(i64::MAX);

        let ids: Vec<BlockId> = metas.keys().copied().collect();
        for id in ids {
            let mark = match meta::read_deletion_mark(self.bucket.as_ref(), id).await {
                Ok(mark) => mark,
                Err(SyncError::DeletionMarkNotFound) => continue,
                Err(err @ SyncError::DeletionMarkCorrupted { .. }) => {
                    tracing::warn!(
                        block = %id,
                        error = %err,
                        "found partial deletion-mark.json; if this repeats for the same block, \
                         consider deleting the marker from the object storage manually"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            let deletion_time = mark.deletion_time;
            marks.insert(id, mark);
            if now - deletion_time > delay_secs {
                metrics.inc_synced(SyncedState::MarkedForDeletion);
                metas.remove(&id);
            }
        }

        *self
            .deletion_marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = marks;
        Ok(())
    }
}

/// Strips configured replica labels from external label sets.
///
/// Must run before deduplication so blocks that differ only in a replica
/// label converge on the same external-label identity.
pub struct ReplicaLabelRemover {
    replica_labels: Vec<String>,
}

impl ReplicaLabelRemover {
    /// Creates the modifier.
    #[must_use]
    pub fn new(replica_labels: Vec<String>) -> Self {
        Self { replica_labels }
    }
}

#[async_trait]
impl MetaFilter for ReplicaLabelRemover {
    fn name(&self) -> &'static str {
        "replica-label-remover"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<BlockId, BlockMeta>,
        metrics: &SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        for (id, m) in metas.iter_mut() {
            for label in &self.replica_labels {
                if m.ext.labels.remove(label).is_some() {
                    tracing::debug!(block = %id, label = %label, "replica label removed");
                    metrics.inc_modified(ModifiedKind::ReplicaLabelRemoved);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::BlockSource;
    use crate::relabel::Pattern;
    use strata_core::MemoryBucket;

    fn block(id: BlockId, min_time: i64, max_time: i64) -> BlockMeta {
        BlockMeta {
            version: meta::META_VERSION_1,
            ulid: id,
            min_time,
            max_time,
            stats: Default::default(),
            compaction: Default::default(),
            ext: Default::default(),
        }
    }

    fn metas_of(blocks: Vec<BlockMeta>) -> HashMap<BlockId, BlockMeta> {
        blocks.into_iter().map(|m| (m.ulid, m)).collect()
    }

    #[tokio::test]
    async fn test_time_partition_keeps_intersecting_ranges() {
        let inside = BlockId::generate();
        let overlapping = BlockId::generate();
        let outside = BlockId::generate();
        let mut metas = metas_of(vec![
            block(inside, 1_000, 2_000),
            block(overlapping, 1_500, 5_000),
            block(outside, 4_000, 5_000),
        ]);

        let filter = TimePartitionFilter::new(
            TimeOrDuration::Timestamp(0),
            TimeOrDuration::Timestamp(3_000),
        );
        let metrics = SyncMetrics::new();
        filter
            .filter(&mut metas, &metrics, false)
            .await
            .expect("filter");

        assert!(metas.contains_key(&inside));
        assert!(metas.contains_key(&overlapping));
        assert!(!metas.contains_key(&outside));

        metrics.synced.submit();
        assert_eq!(metrics.synced_value(SyncedState::TimeExcluded), 1.0);
    }

    #[tokio::test]
    async fn test_time_partition_relative_bounds() {
        let now_ms = Utc::now().timestamp_millis();
        let recent = BlockId::generate();
        let ancient = BlockId::generate();
        let mut metas = metas_of(vec![
            block(recent, now_ms - 60_000, now_ms),
            block(ancient, now_ms - 7_200_000, now_ms - 3_600_000 - 60_000),
        ]);

        // Window: the last hour.
        let filter = TimePartitionFilter::new(
            TimeOrDuration::RelativeToNow(chrono::Duration::hours(1)),
            TimeOrDuration::RelativeToNow(chrono::Duration::zero()),
        );
        let metrics = SyncMetrics::new();
        filter
            .filter(&mut metas, &metrics, false)
            .await
            .expect("filter");

        assert!(metas.contains_key(&recent));
        assert!(!metas.contains_key(&ancient));
    }

    #[tokio::test]
    async fn test_label_sharding_by_block_id() {
        let mine = BlockId::generate();
        let other = BlockId::generate();
        let mut metas = metas_of(vec![block(mine, 0, 1), block(other, 0, 1)]);

        let rules = vec![RelabelRule {
            source_labels: vec![BLOCK_ID_LABEL.into()],
            regex: Pattern::new(&mine.to_string()).expect("pattern"),
            action: crate::relabel::RelabelAction::Keep,
            ..RelabelRule::default()
        }];
        let filter = LabelShardedFilter::new(rules);
        let metrics = SyncMetrics::new();
        filter
            .filter(&mut metas, &metrics, false)
            .await
            .expect("filter");

        assert!(metas.contains_key(&mine));
        assert!(!metas.contains_key(&other));

        metrics.synced.submit();
        assert_eq!(metrics.synced_value(SyncedState::LabelExcluded), 1.0);
    }

    #[tokio::test]
    async fn test_consistency_delay_drops_fresh_blocks() {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).expect("timestamp");
        let fresh = BlockId::from_parts(now_ms, 1);
        let settled = BlockId::from_parts(now_ms - 3_600_000, 2);
        let fresh_but_atomic = BlockId::from_parts(now_ms, 3);

        let mut atomic_block = block(fresh_but_atomic, 0, 1);
        atomic_block.ext.source = BlockSource::Compactor;

        let mut metas = metas_of(vec![
            block(fresh, 0, 1),
            block(settled, 0, 1),
            atomic_block,
        ]);

        let filter = ConsistencyDelayFilter::new(Duration::from_secs(30 * 60));
        let metrics = SyncMetrics::new();
        filter
            .filter(&mut metas, &metrics, false)
            .await
            .expect("filter");

        assert!(!metas.contains_key(&fresh));
        assert!(metas.contains_key(&settled));
        assert!(metas.contains_key(&fresh_but_atomic));

        metrics.synced.submit();
        assert_eq!(metrics.synced_value(SyncedState::TooFresh), 1.0);
    }

    #[tokio::test]
    async fn test_deletion_mark_grace_period() {
        let bucket = MemoryBucket::new();
        let expired = BlockId::generate();
        let in_grace = BlockId::generate();
        let unmarked = BlockId::generate();

        let now = Utc::now().timestamp();
        bucket.insert(
            meta::deletion_mark_path(expired),
            format!(r#"{{"id": "{expired}", "version": 1, "deletion_time": {}}}"#, now - 3_600),
        );
        bucket.insert(
            meta::deletion_mark_path(in_grace),
            format!(r#"{{"id": "{in_grace}", "version": 1, "deletion_time": {now}}}"#),
        );

        let mut metas = metas_of(vec![
            block(expired, 0, 1),
            block(in_grace, 0, 1),
            block(unmarked, 0, 1),
        ]);

        let filter =
            IgnoreDeletionMarkFilter::new(Arc::new(bucket), Duration::from_secs(30 * 60));
        let metrics = SyncMetrics::new();
        filter
            .filter(&mut metas, &metrics, false)
            .await
            .expect("filter");

        assert!(!metas.contains_key(&expired));
        assert!(metas.contains_key(&in_grace));
        assert!(metas.contains_key(&unmarked));

        // The marker map covers marked blocks regardless of the grace delay.
        let marks = filter.deletion_mark_blocks();
        assert_eq!(marks.len(), 2);
        assert!(marks.contains_key(&expired));
        assert!(marks.contains_key(&in_grace));

        metrics.synced.submit();
        assert_eq!(metrics.synced_value(SyncedState::MarkedForDeletion), 1.0);
    }

    #[tokio::test]
    async fn test_unparseable_deletion_mark_keeps_block() {
        let bucket = MemoryBucket::new();
        let id = BlockId::generate();
        bucket.insert(meta::deletion_mark_path(id), "{broken");

        let mut metas = metas_of(vec![block(id, 0, 1)]);
        let filter = IgnoreDeletionMarkFilter::new(Arc::new(bucket), Duration::from_secs(0));
        let metrics = SyncMetrics::new();
        filter
            .filter(&mut metas, &metrics, false)
            .await
            .expect("filter");

        assert!(metas.contains_key(&id));
        assert!(filter.deletion_mark_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_replica_label_remover() {
        let a = BlockId::generate();
        let b = BlockId::generate();

        let mut block_a = block(a, 0, 1);
        block_a.ext.labels = [("ext1", "value1"), ("replica", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut block_b = block(b, 0, 1);
        block_b.ext.labels = [("ext1", "value1"), ("rule_replica", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut metas = metas_of(vec![block_a, block_b]);
        let remover = ReplicaLabelRemover::new(vec!["replica".into(), "rule_replica".into()]);
        let metrics = SyncMetrics::new();
        remover
            .filter(&mut metas, &metrics, false)
            .await
            .expect("modify");

        for m in metas.values() {
            assert!(!m.ext.labels.contains_key("replica"));
            assert!(!m.ext.labels.contains_key("rule_replica"));
            assert_eq!(m.ext.labels["ext1"], "value1");
        }

        metrics.modified.submit();
        assert_eq!(metrics.modified_value(ModifiedKind::ReplicaLabelRemoved), 2.0);
    }
}
