//! Per-operation timeouts for bucket access.
//!
//! The synchronization core imposes no deadlines of its own; callers that
//! want every bucket call bounded wrap their reader in [`TimeoutBucket`].
//! An elapsed timer surfaces as [`Error::Timeout`], which the fetch layer
//! treats like any other transient storage failure.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::storage::BucketReader;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Deadlines applied to individual bucket operations.
#[derive(Debug, Clone, Copy)]
pub struct OpTimeouts {
    /// Deadline for a single enumeration call.
    pub iter: Duration,
    /// Deadline for an existence check.
    pub exists: Duration,
    /// Deadline for a full object read.
    pub get: Duration,
}

impl Default for OpTimeouts {
    fn default() -> Self {
        Self {
            iter: DEFAULT_OP_TIMEOUT,
            exists: DEFAULT_OP_TIMEOUT,
            get: DEFAULT_OP_TIMEOUT,
        }
    }
}

/// Decorates a [`BucketReader`] so every operation has its own deadline.
#[derive(Debug)]
pub struct TimeoutBucket<B> {
    inner: B,
    timeouts: OpTimeouts,
}

impl<B: BucketReader> TimeoutBucket<B> {
    /// Wraps `inner` with the default deadlines.
    pub fn new(inner: B) -> Self {
        Self::with_timeouts(inner, OpTimeouts::default())
    }

    /// Wraps `inner` with explicit deadlines.
    pub fn with_timeouts(inner: B, timeouts: OpTimeouts) -> Self {
        Self { inner, timeouts }
    }
}

#[async_trait]
impl<B: BucketReader> BucketReader for TimeoutBucket<B> {
    async fn iter(&self, prefix: &str) -> Result<Vec<String>> {
        timeout(self.timeouts.iter, self.inner.iter(prefix))
            .await
            .map_err(|_| Error::Timeout { operation: "iter" })?
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        timeout(self.timeouts.exists, self.inner.exists(path))
            .await
            .map_err(|_| Error::Timeout { operation: "exists" })?
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        timeout(self.timeouts.get, self.inner.get(path))
            .await
            .map_err(|_| Error::Timeout { operation: "get" })?
    }
}
