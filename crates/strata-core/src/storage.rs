//! Read-only object store capability.
//!
//! The block synchronization core never mutates remote state: it enumerates,
//! exist-checks, and reads. The contract is therefore a *reader* capability;
//! components that upload or delete blocks hold a wider interface supplied
//! elsewhere.
//!
//! ## Consistency
//!
//! The object store is the source of truth and is eventually consistent.
//! `iter` may return entries whose `meta.json` has not appeared yet or has
//! just been deleted; callers must treat missing objects as a normal outcome
//! (see [`crate::Error::is_not_found`]).

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Read capability over an object store bucket.
#[async_trait]
pub trait BucketReader: Send + Sync + 'static {
    /// Lists the immediate children of `prefix`.
    ///
    /// Returned names are relative to `prefix`; directory-style entries keep
    /// a trailing `/`. Ordering is backend-defined.
    async fn iter(&self, prefix: &str) -> Result<Vec<String>>;

    /// Checks whether an object exists without reading it.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;
}

/// In-memory bucket for tests.
///
/// Thread-safe via `RwLock`. Not suitable for production. Mutation happens
/// through inherent methods only; the [`BucketReader`] surface stays
/// read-only, matching what the synchronization core is allowed to do.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucket {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBucket {
    /// Creates a new empty bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object, replacing any previous content.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(path.into(), data.into());
    }

    /// Removes an object if present.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn remove(&self, path: &str) {
        self.objects.write().expect("lock poisoned").remove(path);
    }

    /// Returns all stored paths (for debugging).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BucketReader for MemoryBucket {
    async fn iter(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

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
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        Ok(objects.contains_key(path))
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }
}
