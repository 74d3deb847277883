//! End-to-end fetch scenarios over the canonical filter pipeline.
//!
//! Each scenario builds blocks in an in-memory bucket the way producers
//! would, runs a fetch through the full pipeline (time partition → label
//! sharding → consistency delay → deletion markers → replica-label removal
//! → deduplication), and checks the surviving view plus the committed
//! metrics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use strata_block::meta::resolution;
use strata_block::{
    ConsistencyDelayFilter, DeduplicateFilter, FetchedMetas, IgnoreDeletionMarkFilter,
    LabelShardedFilter, MetaFetcher, MetaFilter, MetadataFetcher, ModifiedKind,
    ReplicaLabelRemover, SyncError, SyncedState, TimeOrDuration, TimePartitionFilter,
};
use strata_core::{BlockId, BucketReader};
use strata_test_utils::fixtures::write_deletion_mark;
use strata_test_utils::{BlockFixture, TracingMemoryBucket};

struct Pipeline {
    fetcher: MetaFetcher,
    dedup: Arc<DeduplicateFilter>,
    marks: Arc<IgnoreDeletionMarkFilter>,
}

/// Builds a fetcher over the canonical pipeline, with a zero consistency
/// delay so freshly minted fixtures pass through.
fn canonical_pipeline(bucket: Arc<dyn BucketReader>, replica_labels: &[&str]) -> Pipeline {
    let dedup = Arc::new(DeduplicateFilter::new());
    let marks = Arc::new(IgnoreDeletionMarkFilter::new(
        Arc::clone(&bucket),
        Duration::from_secs(30 * 60),
    ));

    let filters: Vec<Arc<dyn MetaFilter>> = vec![
        Arc::new(TimePartitionFilter::new(
            TimeOrDuration::Timestamp(0),
            TimeOrDuration::Timestamp(i64::MAX),
        )) as Arc<dyn MetaFilter>,
        Arc::new(LabelShardedFilter::new(Vec::new())) as Arc<dyn MetaFilter>,
        Arc::new(ConsistencyDelayFilter::new(Duration::ZERO)) as Arc<dyn MetaFilter>,
        Arc::clone(&marks) as Arc<dyn MetaFilter>,
        Arc::new(ReplicaLabelRemover::new(
            replica_labels.iter().map(|l| (*l).to_string()).collect(),
        )) as Arc<dyn MetaFilter>,
        Arc::clone(&dedup) as Arc<dyn MetaFilter>,
    ];

    let fetcher = MetaFetcher::new(8, bucket, None, filters).expect("fetcher");
    Pipeline {
        fetcher,
        dedup,
        marks,
    }
}

fn labels_of(fetched: &FetchedMetas, id: BlockId) -> &BTreeMap<String, String> {
    &fetched.metas[&id].ext.labels
}

fn shared_sources(n: u128) -> Vec<BlockId> {
    (0..n).map(|i| BlockId::from_parts(1_000 + i as u64, i)).collect()
}

#[tokio::test]
async fn full_replica_dedup_keeps_one_block() {
    let bucket = TracingMemoryBucket::new();
    let sources = shared_sources(2);

    // Three uploads of the same logical data, one per replica.
    let replica_1 = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("replica", "1")])
        .sources(sources.clone())
        .write_to(&bucket);
    let replica_2 = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("replica", "2")])
        .sources(sources.clone())
        .write_to(&bucket);
    let rule_replica = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("rule_replica", "1")])
        .sources(sources)
        .write_to(&bucket);

    let mut p = canonical_pipeline(Arc::new(bucket), &["replica", "rule_replica"]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    assert!(fetched.incomplete.is_none());
    assert_eq!(fetched.metas.len(), 1);

    // The oldest upload survives with its replica identity stripped.
    let survivor = *fetched.metas.keys().next().expect("survivor");
    assert_eq!(survivor, replica_1.min(replica_2).min(rule_replica));
    let expected: BTreeMap<String, String> =
        [("ext1".to_string(), "value1".to_string())].into_iter().collect();
    assert_eq!(labels_of(&fetched, survivor), &expected);

    // No surviving meta carries a replica label.
    for meta in fetched.metas.values() {
        assert!(!meta.ext.labels.contains_key("replica"));
        assert!(!meta.ext.labels.contains_key("rule_replica"));
    }

    let metrics = p.fetcher.metrics();
    assert_eq!(metrics.modified_value(ModifiedKind::ReplicaLabelRemoved), 3.0);
    assert_eq!(metrics.synced_value(SyncedState::Duplicate), 2.0);
    assert_eq!(metrics.synced_value(SyncedState::Loaded), 1.0);
    assert_eq!(metrics.synced_sum(), 3.0);
    assert_eq!(p.dedup.duplicate_ids().len(), 2);
}

#[tokio::test]
async fn partial_overlap_drops_the_covered_block() {
    let bucket = TracingMemoryBucket::new();
    let sources = shared_sources(2);

    let two_hours = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("replica", "1")])
        .time_range(0, 7_200_000)
        .sources(sources.clone())
        .write_to(&bucket);
    let one_hour = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("replica", "2")])
        .time_range(0, 3_600_000)
        .sources(sources[..1].to_vec())
        .write_to(&bucket);

    let mut p = canonical_pipeline(Arc::new(bucket), &["replica"]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    assert_eq!(fetched.metas.len(), 1);
    assert!(fetched.metas.contains_key(&two_hours));
    assert_eq!(p.dedup.duplicate_ids(), vec![one_hour]);

    let metrics = p.fetcher.metrics();
    assert_eq!(metrics.synced_value(SyncedState::Duplicate), 1.0);
    assert_eq!(metrics.modified_value(ModifiedKind::ReplicaLabelRemoved), 2.0);
}

#[tokio::test]
async fn contained_range_keeps_the_larger_lineage() {
    let bucket = TracingMemoryBucket::new();
    let sources = shared_sources(3);

    let contained = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("replica", "1")])
        .time_range(1_800_000, 3_600_000)
        .sources(sources[..1].to_vec())
        .write_to(&bucket);
    let covering = BlockFixture::new()
        .labels(&[("ext1", "value1"), ("replica", "2")])
        .time_range(0, 7_200_000)
        .sources(sources)
        .write_to(&bucket);

    let mut p = canonical_pipeline(Arc::new(bucket), &["replica"]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    assert_eq!(fetched.metas.len(), 1);
    assert!(fetched.metas.contains_key(&covering));
    assert_eq!(p.dedup.duplicate_ids(), vec![contained]);
}

#[tokio::test]
async fn disjoint_external_labels_both_survive() {
    let bucket = TracingMemoryBucket::new();

    let shard_1 = BlockFixture::new()
        .labels(&[("ext1", "value1")])
        .write_to(&bucket);
    let shard_2 = BlockFixture::new()
        .labels(&[("ext1", "value2")])
        .write_to(&bucket);

    let mut p = canonical_pipeline(Arc::new(bucket), &["replica"]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    assert_eq!(fetched.metas.len(), 2);
    assert!(fetched.metas.contains_key(&shard_1));
    assert!(fetched.metas.contains_key(&shard_2));

    let metrics = p.fetcher.metrics();
    assert_eq!(metrics.synced_value(SyncedState::Duplicate), 0.0);
    assert_eq!(metrics.modified_value(ModifiedKind::ReplicaLabelRemoved), 0.0);
    assert_eq!(metrics.synced_value(SyncedState::Loaded), 2.0);
    assert!(p.dedup.duplicate_ids().is_empty());
}

#[tokio::test]
async fn resolutions_never_deduplicate_against_each_other() {
    let bucket = TracingMemoryBucket::new();
    let sources = shared_sources(2);

    // The same data at raw, 5m, and 1h resolution, as the downsampler
    // produces it.
    for res in [resolution::RAW, resolution::FIVE_MINUTES, resolution::ONE_HOUR] {
        BlockFixture::new()
            .labels(&[("ext1", "value1")])
            .resolution(res)
            .sources(sources.clone())
            .write_to(&bucket);
    }

    let mut p = canonical_pipeline(Arc::new(bucket), &[]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    assert_eq!(fetched.metas.len(), 3);
    assert_eq!(p.fetcher.metrics().synced_value(SyncedState::Duplicate), 0.0);
    assert_eq!(p.fetcher.metrics().synced_value(SyncedState::Loaded), 3.0);
}

#[tokio::test]
async fn corrupted_descriptor_is_partial_not_failed() {
    let bucket = TracingMemoryBucket::new();
    let good = BlockFixture::new()
        .labels(&[("ext1", "value1")])
        .write_to(&bucket);
    let corrupted = BlockId::generate();
    bucket.insert(format!("{corrupted}/meta.json"), "{not json at all");

    let mut p = canonical_pipeline(Arc::new(bucket.clone()), &[]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    // Corruption is compatible with a complete view.
    assert!(fetched.incomplete.is_none());
    assert!(fetched.metas.contains_key(&good));
    assert!(!fetched.metas.contains_key(&corrupted));
    assert!(matches!(
        fetched.partial.get(&corrupted),
        Some(SyncError::MetaCorrupted { .. })
    ));
    // A block is never both loaded and partial.
    for id in fetched.metas.keys() {
        assert!(!fetched.partial.contains_key(id));
    }

    let metrics = p.fetcher.metrics();
    assert_eq!(metrics.synced_value(SyncedState::CorruptedMeta), 1.0);
    assert_eq!(metrics.synced_value(SyncedState::Failed), 0.0);
    assert_eq!(metrics.synced_value(SyncedState::Loaded), 1.0);

    // The cache was updated: the next fetch revalidates the good block
    // without re-reading its descriptor.
    bucket.clear_operations();
    p.fetcher.fetch().await.expect("second fetch");
    assert!(
        !bucket.get_paths().contains(&format!("{good}/meta.json")),
        "complete view must have cached the good descriptor"
    );
}

#[tokio::test]
async fn deletion_marks_are_exposed_independent_of_grace() {
    let bucket = TracingMemoryBucket::new();
    let now = chrono::Utc::now().timestamp();

    let expired = BlockFixture::new().write_to(&bucket);
    let in_grace = BlockFixture::new().write_to(&bucket);
    let unmarked = BlockFixture::new().write_to(&bucket);
    write_deletion_mark(&bucket, expired, now - 3_600);
    write_deletion_mark(&bucket, in_grace, now);

    let mut p = canonical_pipeline(Arc::new(bucket), &[]);
    let fetched = p.fetcher.fetch().await.expect("fetch");

    assert!(!fetched.metas.contains_key(&expired));
    assert!(fetched.metas.contains_key(&in_grace));
    assert!(fetched.metas.contains_key(&unmarked));

    let marks = p.marks.deletion_mark_blocks();
    assert_eq!(marks.len(), 2);
    assert!(marks.contains_key(&expired));
    assert!(marks.contains_key(&in_grace));

    let metrics = p.fetcher.metrics();
    assert_eq!(metrics.synced_value(SyncedState::MarkedForDeletion), 1.0);
    assert_eq!(metrics.synced_value(SyncedState::Loaded), 2.0);
    assert_eq!(metrics.synced_sum(), 3.0);
}

#[tokio::test]
async fn dedup_is_idempotent_across_fetches() {
    let bucket = TracingMemoryBucket::new();
    let sources = shared_sources(2);
    for replica in ["1", "2"] {
        BlockFixture::new()
            .labels(&[("ext1", "value1"), ("replica", replica)])
            .sources(sources.clone())
            .write_to(&bucket);
    }

    let mut p = canonical_pipeline(Arc::new(bucket), &["replica"]);
    let first = p.fetcher.fetch().await.expect("first fetch");
    let survivors: Vec<BlockId> = first.metas.keys().copied().collect();
    assert_eq!(survivors.len(), 1);

    // The same bucket state yields the same survivors and the same counts.
    let second = p.fetcher.fetch().await.expect("second fetch");
    assert_eq!(second.metas.keys().copied().collect::<Vec<_>>(), survivors);
    assert_eq!(p.fetcher.metrics().synced_value(SyncedState::Duplicate), 1.0);
}

/// A stage that always fails, for exercising pipeline abort.
struct FailingFilter;

#[async_trait::async_trait]
impl MetaFilter for FailingFilter {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn filter(
        &self,
        _metas: &mut std::collections::HashMap<BlockId, strata_block::BlockMeta>,
        _metrics: &strata_block::SyncMetrics,
        _incomplete_view: bool,
    ) -> Result<(), SyncError> {
        Err(SyncError::DeletionMarkNotFound)
    }
}

#[tokio::test]
async fn filter_error_aborts_the_fetch() {
    let bucket = TracingMemoryBucket::new();
    BlockFixture::new().write_to(&bucket);

    let filters: Vec<Arc<dyn MetaFilter>> = vec![Arc::new(FailingFilter) as Arc<dyn MetaFilter>];
    let mut fetcher = MetaFetcher::new(2, Arc::new(bucket), None, filters).expect("fetcher");

    let err = fetcher.fetch().await.expect_err("must abort");
    assert!(matches!(err, SyncError::Filter { filter: "failing", .. }));
}
