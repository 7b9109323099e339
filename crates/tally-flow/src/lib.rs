//! # tally-flow
//!
//! The dataflow reduce engine behind the tally metering pipeline.
//!
//! Usage documents arrive at a service, are deduplicated, keyed into
//! groups, reduced against the most recent accumulated state of each
//! group, persisted as new output documents, and forwarded to a downstream
//! sink service. The engine guarantees at-most-once effective application
//! of each input to its group's accumulator while tolerating retries,
//! concurrent writers, partitioned storage, and partial sink failures.
//!
//! ## Core pieces
//!
//! - **Store facade** ([`store`]): typed handle over the partitioned
//!   document store with transparent batching, retry, and circuit-breaker
//!   middleware
//! - **Reduce engine** ([`reduce`]): per-group serialized read-modify-write
//!   of accumulators through a user-supplied reducer
//! - **Sink** ([`sink`]): partition-routed POST fan-out with response
//!   classification
//! - **Logger** ([`logger`]): durable input/output/error records
//! - **Replay** ([`replay`]): bounded rescan re-submitting inputs that have
//!   neither an output nor an error record
//! - **Pipeline** ([`pipeline`]): the service facade the router calls
//!
//! ## Guarantees
//!
//! - Strict serial order of reduces per group within one instance
//! - Accumulator updates are optimistic: a revision conflict fails the
//!   batch instead of dropping reducer output
//! - Duplicate submissions have one durable effect; the repeat maps to a
//!   conflict the router reports as success

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod doc;
pub mod error;
pub mod logger;
pub mod pipeline;
pub mod reduce;
pub mod replay;
pub mod sink;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{
        Config, ErrorConfig, InputConfig, OutputConfig, PipelineConfig, SinkConfig,
    };
    pub use crate::doc::Doc;
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{Pipeline, PipelineBuilder};
    pub use crate::reduce::{ReduceCall, ReduceEngine};
    pub use crate::replay::{ReplayDriver, ReplayStats};
    pub use crate::sink::{AuthProvider, HttpSink, MemorySink, SinkPoster, SinkTransport};
    pub use crate::store::memory::MemoryStore;
    pub use crate::store::{AllDocsQuery, DocRow, DocStore};
}
