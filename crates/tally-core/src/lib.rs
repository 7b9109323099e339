//! # tally-core
//!
//! Shared primitives for the tally usage-metering pipeline.
//!
//! This crate provides the building blocks the reduce engine is assembled
//! from:
//!
//! - **Key coding**: composite document identifiers combining a key tuple
//!   and a time tuple, order-preserving under lexicographic range scans
//! - **Partitioning**: bucket/epoch routing of documents to store partitions
//!   and sink instances
//! - **Duplicate filtering**: a fast in-memory probabilistic set gating
//!   authoritative store lookups
//! - **Group locks**: cooperative per-group mutual exclusion
//!
//! ## Example
//!
//! ```rust
//! use tally_core::id::{kturi, tkuri, pad16};
//!
//! let input_id = tkuri("org-1", 1_700_000_000_000);
//! assert_eq!(input_id, "t/0001700000000000/k/org-1");
//!
//! let output_id = kturi("org-1", 1_700_000_000_000);
//! assert_eq!(output_id, "k/org-1/t/0001700000000000");
//!
//! // pad16 preserves numeric order lexicographically.
//! assert!(pad16(9) < pad16(10));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dedupe;
pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod partition;

pub use dedupe::DedupeFilter;
pub use error::{Error, Result};
pub use lock::{GroupGuard, GroupLocks};
pub use partition::{Destination, Op, Partitioner};
