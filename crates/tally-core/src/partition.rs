//! Partition routing for documents and sink instances.
//!
//! Storage and sink routing share one model: a document's key hashes to a
//! **bucket**, its time falls into a monthly **epoch**, and a partitioner
//! maps `(bucket, epoch, op)` to concrete `(partition, epoch)` destinations.
//!
//! Three partitioners cover the deployment shapes:
//!
//! - [`Partitioner::None`] — single destination, used when the configured
//!   shard count is 1
//! - [`Partitioner::SingleDb`] — one partition per app instance with
//!   per-month epochs, used for input stores
//! - [`Partitioner::Forward`] — deterministic shard selection by bucket
//!   hash over N shards, used for output stores and sink routing
//!
//! [`Balance`] layers round-robin selection over forwarded candidates for
//! operations that have no natural key.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The kind of store operation being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// A read (get or range scan).
    Read,
    /// A write (put or remove).
    Write,
}

/// A concrete routing destination: a partition index and a month epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    /// Partition index in `[0, shards)`.
    pub partition: u32,
    /// Month epoch as a `YYYYMM` integer.
    pub epoch: i32,
}

/// Returns the `YYYYMM` month epoch of a millisecond timestamp.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the timestamp is out of the
/// representable datetime range.
pub fn epoch(time_ms: i64) -> Result<i32> {
    let dt = datetime(time_ms)?;
    Ok(dt.year() * 100 + i32::try_from(dt.month()).unwrap_or(0))
}

/// Returns the first millisecond of the month containing `time_ms`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the timestamp is out of range.
pub fn month_start(time_ms: i64) -> Result<i64> {
    let dt = datetime(time_ms)?;
    let first = NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| Error::InvalidInput(format!("timestamp {time_ms} out of range")))?;
    Ok(first.and_utc().timestamp_millis())
}

/// Returns the last millisecond of the month containing `time_ms`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the timestamp is out of range.
pub fn month_end(time_ms: i64) -> Result<i64> {
    let dt = datetime(time_ms)?;
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    let next = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| Error::InvalidInput(format!("timestamp {time_ms} out of range")))?;
    Ok(next.and_utc().timestamp_millis() - 1)
}

/// Hashes a document key to its bucket number.
///
/// Uses the first eight bytes of a SHA-256 digest, so the mapping is stable
/// across processes and deployments.
#[must_use]
pub fn bucket(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8]))
}

fn datetime(time_ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(time_ms)
        .ok_or_else(|| Error::InvalidInput(format!("timestamp {time_ms} out of range")))
}

/// Maps `(key, time, op)` to store partitions and month epochs.
#[derive(Debug)]
pub enum Partitioner {
    /// Single destination: partition 0, epoch of the document time.
    ///
    /// Used as the short-circuit when the configured shard count is 1.
    None,

    /// One partition per app instance, epoch per month.
    ///
    /// Input stores use this shape: each app instance owns exactly one
    /// input partition, which is what gives every group a single writer.
    SingleDb,

    /// Deterministic forwarding over `shards` partitions by bucket hash.
    Forward {
        /// Number of shards to forward over.
        shards: u32,
    },
}

impl Partitioner {
    /// Builds the partitioner for a configured shard count.
    ///
    /// A count of one short-circuits to [`Partitioner::None`].
    #[must_use]
    pub fn forward(shards: u32) -> Self {
        if shards <= 1 {
            Self::None
        } else {
            Self::Forward { shards }
        }
    }

    /// Routes a single-document operation to its destination.
    ///
    /// # Errors
    ///
    /// Returns an error when the timestamp is out of range.
    pub fn route(&self, key: &str, time_ms: i64, _op: Op) -> Result<Destination> {
        let epoch = epoch(time_ms)?;
        let partition = match self {
            Self::None | Self::SingleDb => 0,
            Self::Forward { shards } => partition_of(key, *shards),
        };
        Ok(Destination { partition, epoch })
    }

    /// Routes a range scan, one destination per month epoch the window
    /// `[start_ms, end_ms]` spans.
    ///
    /// # Errors
    ///
    /// Returns an error when either bound is out of range.
    pub fn route_range(&self, key: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Destination>> {
        let (lo, hi) = if start_ms <= end_ms {
            (start_ms, end_ms)
        } else {
            (end_ms, start_ms)
        };
        let partition = match self {
            Self::None | Self::SingleDb => 0,
            Self::Forward { shards } => partition_of(key, *shards),
        };

        let mut destinations = Vec::new();
        let mut cursor = month_start(lo)?;
        while cursor <= hi {
            destinations.push(Destination {
                partition,
                epoch: epoch(cursor)?,
            });
            cursor = month_end(cursor)? + 1;
        }
        Ok(destinations)
    }

    /// Returns the number of partitions this partitioner routes over.
    #[must_use]
    pub fn shards(&self) -> u32 {
        match self {
            Self::None | Self::SingleDb => 1,
            Self::Forward { shards } => *shards,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn partition_of(key: &str, shards: u32) -> u32 {
    (bucket(key) % u64::from(shards.max(1))) as u32
}

/// Round-robin selection over forwarded candidates.
///
/// Picks one destination per write operation, cycling across candidates so
/// keyless writes spread evenly.
#[derive(Debug, Default)]
pub struct Balance {
    counter: AtomicU64,
}

impl Balance {
    /// Creates a new balancer starting at the first candidate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next destination round-robin.
    ///
    /// Returns `None` when `candidates` is empty.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pick(&self, candidates: &[Destination]) -> Option<Destination> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(candidates[(n % candidates.len() as u64) as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14T22:13:20Z
    const T: i64 = 1_700_000_000_000;

    #[test]
    fn epoch_is_year_month() {
        assert_eq!(epoch(T).unwrap(), 202_311);
        assert_eq!(epoch(0).unwrap(), 197_001);
    }

    #[test]
    fn month_bounds_bracket_the_timestamp() {
        let start = month_start(T).unwrap();
        let end = month_end(T).unwrap();
        assert!(start <= T && T <= end);
        assert_eq!(epoch(start).unwrap(), epoch(T).unwrap());
        assert_eq!(epoch(end).unwrap(), epoch(T).unwrap());
        assert_ne!(epoch(end + 1).unwrap(), epoch(T).unwrap());
    }

    #[test]
    fn month_end_handles_december() {
        // 2023-12-15T00:00:00Z
        let december = 1_702_598_400_000;
        let end = month_end(december).unwrap();
        assert_eq!(epoch(end).unwrap(), 202_312);
        assert_eq!(epoch(end + 1).unwrap(), 202_401);
    }

    #[test]
    fn forward_is_deterministic_and_in_range() {
        let p = Partitioner::forward(6);
        let a = p.route("org-1", T, Op::Write).unwrap();
        let b = p.route("org-1", T, Op::Write).unwrap();
        assert_eq!(a, b);
        assert!(a.partition < 6);
        assert_eq!(a.epoch, 202_311);
    }

    #[test]
    fn forward_of_one_short_circuits() {
        let p = Partitioner::forward(1);
        assert!(matches!(p, Partitioner::None));
        assert_eq!(p.route("anything", T, Op::Read).unwrap().partition, 0);
    }

    #[test]
    fn single_db_pins_partition_zero() {
        let p = Partitioner::SingleDb;
        assert_eq!(p.route("org-1", T, Op::Write).unwrap().partition, 0);
        assert_eq!(p.route("org-2", T, Op::Write).unwrap().partition, 0);
    }

    #[test]
    fn route_range_enumerates_spanned_epochs() {
        let p = Partitioner::SingleDb;
        // Mid-November to mid-January spans three epochs.
        let start = T;
        let end = 1_705_276_800_000; // 2024-01-15T00:00:00Z
        let destinations = p.route_range("", start, end).unwrap();
        let epochs: Vec<i32> = destinations.iter().map(|d| d.epoch).collect();
        assert_eq!(epochs, vec![202_311, 202_312, 202_401]);
    }

    #[test]
    fn route_range_single_month() {
        let p = Partitioner::forward(4);
        let destinations = p.route_range("org-1", T, T + 1000).unwrap();
        assert_eq!(destinations.len(), 1);
    }

    #[test]
    fn balance_cycles_candidates() {
        let balance = Balance::new();
        let candidates = [
            Destination { partition: 0, epoch: 202_311 },
            Destination { partition: 1, epoch: 202_311 },
        ];
        let first = balance.pick(&candidates).unwrap();
        let second = balance.pick(&candidates).unwrap();
        assert_ne!(first.partition, second.partition);
        assert_eq!(balance.pick(&[]), None);
    }
}
