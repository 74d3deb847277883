//! Errors of the synchronization domain.
//!
//! Two error classes matter to the fetch loop: *sentinel* outcomes
//! (descriptor missing or corrupt) that are expected conditions recorded in
//! the partial map, and everything else, which is treated as a transient
//! failure and accumulated into a [`MultiError`] without aborting the fetch.

use std::fmt;

use strata_core::BlockId;

/// Errors produced while synchronizing block metadata.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// `meta.json` is absent. Normal for in-flight uploads and freshly
    /// deleted blocks; the block lands in the partial map.
    #[error("meta.json not found")]
    MetaNotFound {
        /// Set when the absence was discovered by a failed read racing a
        /// concurrent deletion rather than by the existence pre-check.
        #[source]
        cause: Option<strata_core::Error>,
    },

    /// `meta.json` exists but does not parse. The block lands in the
    /// partial map.
    #[error("meta.json of block {block} corrupted: {message}")]
    MetaCorrupted {
        /// The affected block.
        block: BlockId,
        /// Parser diagnostic.
        message: String,
    },

    /// `meta.json` parsed but declares an unsupported descriptor version.
    #[error("unexpected meta.json version {version} for block {block}")]
    UnexpectedMetaVersion {
        /// The affected block.
        block: BlockId,
        /// The version the descriptor declared.
        version: u32,
    },

    /// `deletion-mark.json` is absent, which is the common case.
    #[error("deletion-mark.json not found")]
    DeletionMarkNotFound,

    /// `deletion-mark.json` exists but does not parse.
    #[error("deletion-mark.json of block {block} corrupted: {message}")]
    DeletionMarkCorrupted {
        /// The affected block.
        block: BlockId,
        /// Parser diagnostic.
        message: String,
    },

    /// `deletion-mark.json` parsed but declares an unsupported version.
    #[error("unexpected deletion-mark.json version {version} for block {block}")]
    UnexpectedDeletionMarkVersion {
        /// The affected block.
        block: BlockId,
        /// The version the marker declared.
        version: u32,
    },

    /// A bucket operation failed.
    #[error("{message}")]
    Storage {
        /// What was being attempted.
        message: String,
        /// The storage-layer failure.
        #[source]
        source: strata_core::Error,
    },

    /// A local filesystem operation failed.
    #[error("{message}")]
    Io {
        /// What was being attempted.
        message: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A pipeline stage failed; the fetch is aborted.
    #[error("filter {filter} failed")]
    Filter {
        /// Name of the failing stage.
        filter: &'static str,
        /// The stage's error.
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Creates a storage error wrapping a bucket failure.
    #[must_use]
    pub fn storage(message: impl Into<String>, source: strata_core::Error) -> Self {
        Self::Storage {
            message: message.into(),
            source,
        }
    }
}

/// Accumulated per-block failures of a single fetch.
///
/// A fetch never aborts on individual descriptor loads; transient failures
/// collect here and mark the view as incomplete.
#[derive(Debug, Default)]
pub struct MultiError(Vec<SyncError>);

impl MultiError {
    /// Adds an error to the collection.
    pub fn push(&mut self, err: SyncError) {
        self.0.push(err);
    }

    /// Returns true if no errors were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of collected errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The collected errors.
    #[must_use]
    pub fn errors(&self) -> &[SyncError] {
        &self.0
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_display_joins_members() {
        let mut errs = MultiError::default();
        assert!(errs.is_empty());

        errs.push(SyncError::DeletionMarkNotFound);
        errs.push(SyncError::MetaNotFound { cause: None });

        assert_eq!(errs.len(), 2);
        assert_eq!(
            errs.to_string(),
            "2 errors: deletion-mark.json not found; meta.json not found"
        );
    }
}
