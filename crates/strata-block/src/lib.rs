//! # strata-block
//!
//! Block metadata synchronization and filtering for the strata object store.
//!
//! Producers upload immutable time-series blocks to a bucket, each a
//! directory named after a ULID containing chunk data plus a `meta.json`
//! descriptor. This crate maintains a coherent, filtered view of that
//! inventory for consumers such as the compaction planner and the serving
//! layer:
//!
//! - [`fetcher::MetaFetcher`] enumerates the bucket, loads descriptors with
//!   bounded parallelism and a local disk cache, and commits sync metrics
//!   transactionally
//! - [`filters`] holds the filter/modifier pipeline stages (time
//!   partitioning, label sharding, consistency delay, deletion markers,
//!   replica-label stripping)
//! - [`dedup`] drops blocks made redundant by compaction lineage
//!
//! The crate only reads remote state; uploads, deletions, and the
//! orchestration that acts on the fetched view live elsewhere.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod filters;
pub mod meta;
pub mod metrics;
pub mod relabel;

pub use dedup::DeduplicateFilter;
pub use error::{MultiError, SyncError};
pub use fetcher::{FetchedMetas, MetaFetcher, MetadataFetcher};
pub use filters::{
    ConsistencyDelayFilter, IgnoreDeletionMarkFilter, LabelShardedFilter, MetaFilter,
    ReplicaLabelRemover, TimeOrDuration, TimePartitionFilter,
};
pub use meta::{BlockMeta, BlockSource, DeletionMark};
pub use metrics::{ModifiedKind, SyncMetrics, SyncedState};
