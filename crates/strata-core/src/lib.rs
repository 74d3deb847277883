//! # strata-core
//!
//! Core abstractions for the strata block store.
//!
//! This crate provides the foundational types shared by all strata components:
//!
//! - **Identifiers**: strongly-typed, time-sortable block IDs
//! - **Bucket Access**: the read-only object store capability and an
//!   in-memory implementation for tests
//! - **Timeouts**: a decorator constraining the execution time of every
//!   bucket operation
//! - **Error Types**: shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `strata-core` is the **only** crate allowed to define shared primitives.
//! Higher layers (block synchronization, compaction planning, serving) build
//! on the contracts defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod storage;
pub mod timeout;

pub use error::{Error, Result};
pub use id::BlockId;
pub use observability::{init_logging, LogFormat};
pub use storage::{BucketReader, MemoryBucket};
pub use timeout::{OpTimeouts, TimeoutBucket};
