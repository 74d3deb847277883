//! Block descriptor loading and synchronization.
//!
//! [`MetaFetcher`] keeps a local view of the bucket's block inventory in
//! sync: it enumerates the bucket root, loads descriptors with bounded
//! parallelism through [`MetaLoader`], runs the registered filter pipeline
//! over the result, and commits the per-state metrics transactionally.
//!
//! Two caches back the loader. The in-memory cache short-circuits repeat
//! loads within a process; the optional disk cache mirrors descriptor bytes
//! across restarts. Both are only ever replaced after a fetch that saw no
//! transient failures: a stale view heals on the next fetch, while a view
//! with holes would poison every consumer decision made from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use strata_core::{BlockId, BucketReader};

use crate::error::{MultiError, SyncError};
use crate::filters::MetaFilter;
use crate::meta::{self, BlockMeta, META_VERSION_1};
use crate::metrics::{self, SyncMetrics, SyncedState};

/// Subdirectory of the configured cache dir holding mirrored descriptors.
const CACHE_SUBDIR: &str = "meta-syncer";

/// Capability of producing a filtered view of the block inventory.
#[async_trait]
pub trait MetadataFetcher: Send {
    /// Synchronizes block metadata from the bucket.
    ///
    /// # Errors
    ///
    /// Fails on enumeration errors and filter errors. Per-block load
    /// failures never fail the call; see [`FetchedMetas::incomplete`].
    async fn fetch(&mut self) -> Result<FetchedMetas, SyncError>;
}

/// Outcome of a fetch.
#[derive(Debug)]
pub struct FetchedMetas {
    /// Descriptors that loaded cleanly and were accepted by every filter.
    pub metas: HashMap<BlockId, BlockMeta>,
    /// Blocks observed in the bucket whose descriptor was missing or
    /// corrupt, with the per-block cause. Disjoint from `metas`.
    pub partial: HashMap<BlockId, SyncError>,
    /// Transient failures that left holes in `metas`. When set, everything
    /// in `metas` is still valid and filtered, but some blocks are silently
    /// absent and the caches were left untouched.
    pub incomplete: Option<MultiError>,
}

/// Loads and parses a single block's descriptor.
struct MetaLoader {
    bucket: Arc<dyn BucketReader>,
    cache_dir: Option<PathBuf>,
}

impl MetaLoader {
    fn cached_block_dir(&self, id: BlockId) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(id.to_string()))
    }

    /// Loads one descriptor.
    ///
    /// The existence pre-check distinguishes a missing `meta.json` (normal
    /// for in-flight uploads and fresh deletions) from corruption and from
    /// transport failures, and revalidates cached entries against the
    /// bucket. The disk cache stores the raw remote bytes, so a cached
    /// descriptor is byte-equivalent to its origin.
    async fn load(
        &self,
        id: BlockId,
        cached: Option<&BlockMeta>,
    ) -> Result<BlockMeta, SyncError> {
        let meta_path = meta::meta_path(id);

        let exists = self
            .bucket
            .exists(&meta_path)
            .await
            .map_err(|e| SyncError::storage(format!("check {meta_path} exists"), e))?;
        if !exists {
            return Err(SyncError::MetaNotFound { cause: None });
        }

        if let Some(m) = cached {
            return Ok(m.clone());
        }

        if let Some(dir) = self.cached_block_dir(id) {
            match Self::read_disk_cached(&dir).await {
                Ok(Some(m)) => return Ok(m),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %err,
                        "best effort read of the cached meta.json failed; removing cached block dir"
                    );
                    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                        tracing::warn!(
                            dir = %dir.display(),
                            error = %err,
                            "best effort removal of the cached block dir failed; ignoring"
                        );
                    }
                }
            }
        }

        let raw = match self.bucket.get(&meta_path).await {
            Ok(raw) => raw,
            // Deleted between the existence check and the read.
            Err(e) if e.is_not_found() => return Err(SyncError::MetaNotFound { cause: Some(e) }),
            Err(e) => return Err(SyncError::storage(format!("get {meta_path}"), e)),
        };

        let m: BlockMeta =
            serde_json::from_slice(&raw).map_err(|e| SyncError::MetaCorrupted {
                block: id,
                message: e.to_string(),
            })?;

        if m.version != META_VERSION_1 {
            return Err(SyncError::UnexpectedMetaVersion {
                block: id,
                version: m.version,
            });
        }

        if let Some(dir) = self.cached_block_dir(id) {
            if let Err(err) = Self::write_disk_cache(&dir, &raw).await {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %err,
                    "best effort save of meta.json to the cache dir failed; ignoring"
                );
            }
        }

        Ok(m)
    }

    /// Reads a cached descriptor. `Ok(None)` means no cached file;
    /// truncated or otherwise unreadable entries are errors and get removed
    /// by the caller.
    async fn read_disk_cached(
        dir: &Path,
    ) -> Result<Option<BlockMeta>, Box<dyn std::error::Error + Send + Sync>> {
        let path = dir.join(meta::META_FILENAME);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Box::new(e)),
        };
        let m = serde_json::from_slice(&raw)?;
        Ok(Some(m))
    }

    async fn write_disk_cache(dir: &Path, raw: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(meta::META_FILENAME), raw).await
    }
}

/// Synchronizes filtered block metadata from the object store with local
/// state.
///
/// One fetcher serves one caller: `fetch` takes `&mut self`, so two fetches
/// on the same instance can never overlap.
pub struct MetaFetcher {
    concurrency: usize,
    bucket: Arc<dyn BucketReader>,
    loader: MetaLoader,
    cache_dir: Option<PathBuf>,
    metrics: SyncMetrics,
    filters: Vec<Arc<dyn MetaFilter>>,
    cached: HashMap<BlockId, BlockMeta>,
}

impl MetaFetcher {
    /// Creates a fetcher.
    ///
    /// `cache_dir`, when given, receives a `meta-syncer/` subdirectory
    /// mirroring the descriptors of the current view. Filters run in the
    /// given order on every fetch.
    ///
    /// # Errors
    ///
    /// Fails if the cache directory cannot be created.
    pub fn new(
        concurrency: usize,
        bucket: Arc<dyn BucketReader>,
        cache_dir: Option<&Path>,
        filters: Vec<Arc<dyn MetaFilter>>,
    ) -> Result<Self, SyncError> {
        let cache_dir = match cache_dir {
            Some(dir) => {
                let dir = dir.join(CACHE_SUBDIR);
                std::fs::create_dir_all(&dir).map_err(|e| SyncError::Io {
                    message: format!("create cache dir {}", dir.display()),
                    source: e,
                })?;
                Some(dir)
            }
            None => None,
        };

        Ok(Self {
            concurrency: concurrency.max(1),
            loader: MetaLoader {
                bucket: Arc::clone(&bucket),
                cache_dir: cache_dir.clone(),
            },
            bucket,
            cache_dir,
            metrics: SyncMetrics::new(),
            filters,
            cached: HashMap::new(),
        })
    }

    /// The fetcher's metric set.
    #[must_use]
    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    async fn fetch_inner(&mut self) -> Result<FetchedMetas, SyncError> {
        self.metrics.synced.reset_tx();
        self.metrics.modified.reset_tx();

        let names = self
            .bucket
            .iter("")
            .await
            .map_err(|e| SyncError::storage("iter bucket root", e))?;
        let ids: Vec<BlockId> = names
            .iter()
            .filter_map(|n| BlockId::from_dir_name(n))
            .collect();

        let loader = &self.loader;
        let cached = &self.cached;
        let results: Vec<(BlockId, Result<BlockMeta, SyncError>)> = stream::iter(ids)
            .map(|id| async move { (id, loader.load(id, cached.get(&id)).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut metas = HashMap::new();
        let mut partial = HashMap::new();
        let mut meta_errs = MultiError::default();

        for (id, res) in results {
            match res {
                Ok(m) => {
                    metas.insert(id, m);
                }
                Err(err @ SyncError::MetaNotFound { .. }) => {
                    self.metrics.inc_synced(SyncedState::NoMeta);
                    partial.insert(id, err);
                }
                Err(err @ SyncError::MetaCorrupted { .. }) => {
                    self.metrics.inc_synced(SyncedState::CorruptedMeta);
                    partial.insert(id, err);
                }
                Err(err) => {
                    self.metrics.inc_synced(SyncedState::Failed);
                    meta_errs.push(err);
                }
            }
        }

        let incomplete_view = !meta_errs.is_empty();

        // Only a complete view may replace the caches: stale data beats
        // data with holes.
        if !incomplete_view {
            self.cached = metas.clone();
            self.evict_stale_cache_dirs(&metas).await;
        }

        for filter in &self.filters {
            filter
                .filter(&mut metas, &self.metrics, incomplete_view)
                .await
                .map_err(|e| SyncError::Filter {
                    filter: filter.name(),
                    source: Box::new(e),
                })?;
        }

        #[allow(clippy::cast_precision_loss)]
        self.metrics.set_synced(SyncedState::Loaded, metas.len() as f64);
        self.metrics.synced.submit();
        self.metrics.modified.submit();

        if incomplete_view {
            return Ok(FetchedMetas {
                metas,
                partial,
                incomplete: Some(meta_errs),
            });
        }

        tracing::debug!(
            cached = self.cached.len(),
            returned = metas.len(),
            partial = partial.len(),
            "successfully fetched block metadata"
        );
        Ok(FetchedMetas {
            metas,
            partial,
            incomplete: None,
        })
    }

    /// Best-effort removal of disk-cached descriptors for blocks that left
    /// the view.
    async fn evict_stale_cache_dirs(&self, metas: &HashMap<BlockId, BlockMeta>) {
        let Some(cache_dir) = &self.cache_dir else {
            return;
        };

        let mut entries = match tokio::fs::read_dir(cache_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "best effort listing of the meta cache dir failed; ignoring"
                );
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "best effort listing of the meta cache dir failed; ignoring"
                    );
                    break;
                }
            };

            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(BlockId::from_dir_name) else {
                continue;
            };
            if metas.contains_key(&id) {
                continue;
            }

            let dir = entry.path();
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %err,
                    "best effort removal of the stale cached block dir failed; ignoring"
                );
            }
        }
    }
}

#[async_trait]
impl MetadataFetcher for MetaFetcher {
    async fn fetch(&mut self) -> Result<FetchedMetas, SyncError> {
        let start = Instant::now();
        metrics::record_sync_attempt();

        let result = self.fetch_inner().await;

        metrics::record_sync_duration(start.elapsed().as_secs_f64());
        match &result {
            Ok(fetched) if fetched.incomplete.is_none() => {}
            _ => metrics::record_sync_failure(),
        }
        result
    }
}
