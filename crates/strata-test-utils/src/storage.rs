//! Test bucket implementations with operation tracing.
//!
//! Provides an in-memory bucket that records all read operations for test
//! assertions and supports path-prefix failure injection.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use strata_core::error::{Error, Result};
use strata_core::{BlockId, BucketReader, MemoryBucket};

/// Record of a bucket operation for test assertions.
#[derive(Debug, Clone)]
pub enum BucketOp {
    /// Enumeration of a prefix.
    Iter {
        /// Prefix that was listed.
        prefix: String,
    },
    /// Existence check.
    Exists {
        /// Path that was checked.
        path: String,
    },
    /// Full object read.
    Get {
        /// Path that was read.
        path: String,
    },
}

/// Test-side write access to a bucket.
///
/// The production read capability is deliberately narrow; fixtures use this
/// trait to populate whichever bucket implementation a test runs against.
pub trait BucketWriter {
    /// Stores an object, replacing any previous content.
    fn put(&self, path: &str, data: Vec<u8>);
}

impl BucketWriter for MemoryBucket {
    fn put(&self, path: &str, data: Vec<u8>) {
        self.insert(path, data);
    }
}

/// In-memory bucket with operation tracing.
///
/// Records all read operations for later assertion, fails reads under
/// injected path prefixes, and optionally simulates per-operation latency.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBucket {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    operations: Arc<Mutex<Vec<BucketOp>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBucket {
    /// Creates a new empty tracing bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bucket with simulated per-operation latency.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Stores an object, replacing any previous content.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .expect("lock")
            .insert(path.into(), data.into());
    }

    /// Removes a single object if present.
    pub fn remove(&self, path: &str) {
        self.objects.lock().expect("lock").remove(path);
    }

    /// Removes everything under a block's directory.
    pub fn delete_block(&self, id: BlockId) {
        let prefix = format!("{id}/");
        self.objects
            .lock()
            .expect("lock")
            .retain(|path, _| !path.starts_with(&prefix));
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<BucketOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns the paths of all recorded `get` operations.
    #[must_use]
    pub fn get_paths(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                BucketOp::Get { path } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Injects a failure for the given path prefix. An empty prefix fails
    /// every operation, including enumeration.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().expect("lock").clear();
    }

    fn record(&self, op: BucketOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let prefixes = self.fail_prefixes.lock().expect("lock");
        if prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(Error::Internal {
                message: format!("injected failure for path: {path}"),
            });
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BucketReader for TracingMemoryBucket {
    async fn iter(&self, prefix: &str) -> Result<Vec<String>> {
        self.maybe_delay().await;
        self.check_failure(prefix)?;
        self.record(BucketOp::Iter {
            prefix: prefix.to_string(),
        });

        let objects = self.objects.lock().expect("lock");
        let mut children = BTreeSet::new();
        for key in objects.keys() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                Some(idx) => children.insert(rest[..=idx].to_string()),
                None => children.insert(rest.to_string()),
            };
        }
        Ok(children.into_iter().collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(BucketOp::Exists {
            path: path.to_string(),
        });

        Ok(self.objects.lock().expect("lock").contains_key(path))
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(BucketOp::Get {
            path: path.to_string(),
        });

        self.objects
            .lock()
            .expect("lock")
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }
}

impl BucketWriter for TracingMemoryBucket {
    fn put(&self, path: &str, data: Vec<u8>) {
        self.insert(path, data);
    }
}
