//! Pluggable document storage for the pipeline.
//!
//! The [`DocStore`] trait defines the persistence contract the engine runs
//! against: point reads, conditional writes with revision tokens, and
//! lexicographic range scans.
//!
//! ## Design Principles
//!
//! - **Optimistic concurrency**: a put carrying a revision token succeeds
//!   only when it matches the stored revision; a mismatch is a typed
//!   [`Error::Conflict`](crate::error::Error::Conflict)
//! - **Order-preserving scans**: `all_docs` ranges rely on the key coder's
//!   zero-padded time encoding
//! - **Transparent middleware**: batching, retry, and circuit breaking wrap
//!   any store without changing the contract
//! - **Testability**: an in-memory implementation for tests, a partitioned
//!   facade for deployment shapes

pub mod batch;
pub mod breaker;
pub mod memory;
pub mod partitioned;
pub mod retry;

use async_trait::async_trait;

use crate::doc::Doc;
use crate::error::Result;

/// A range-scan query over document identifiers.
#[derive(Debug, Clone)]
pub struct AllDocsQuery {
    /// First key of the scan (inclusive). For descending scans this is the
    /// upper bound.
    pub startkey: String,
    /// Last key of the scan (inclusive). For descending scans this is the
    /// lower bound.
    pub endkey: String,
    /// Scan from high keys to low keys.
    pub descending: bool,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
    /// Include full documents in the rows.
    pub include_docs: bool,
}

impl AllDocsQuery {
    /// Builds an ascending scan over `[startkey, endkey]`.
    #[must_use]
    pub fn ascending(startkey: impl Into<String>, endkey: impl Into<String>) -> Self {
        Self {
            startkey: startkey.into(),
            endkey: endkey.into(),
            descending: false,
            limit: None,
            include_docs: false,
        }
    }

    /// Builds a descending scan from `startkey` down to `endkey`.
    #[must_use]
    pub fn descending(startkey: impl Into<String>, endkey: impl Into<String>) -> Self {
        Self {
            startkey: startkey.into(),
            endkey: endkey.into(),
            descending: true,
            limit: None,
            include_docs: false,
        }
    }

    /// Sets the row limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Requests full documents in the rows.
    #[must_use]
    pub fn with_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }
}

/// One row of an `all_docs` result.
#[derive(Debug, Clone)]
pub struct DocRow {
    /// The document identifier.
    pub id: String,
    /// The current revision token.
    pub rev: String,
    /// The document, when `include_docs` was requested.
    pub doc: Option<Doc>,
}

/// Storage abstraction for pipeline documents.
///
/// ## Revision semantics
///
/// `put` of a document without a `rev` field inserts; an existing document
/// at that id is a conflict. `put` of a document carrying a `rev` updates
/// and succeeds only when the token matches the stored revision. Either
/// way the new revision token is returned and also stamped on the stored
/// document.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Gets a document by id, `None` when absent.
    async fn get(&self, id: &str) -> Result<Option<Doc>>;

    /// Writes a document, returning the new revision token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`](crate::error::Error::Conflict) when the
    /// carried revision does not match the stored one.
    async fn put(&self, doc: &Doc) -> Result<String>;

    /// Removes a document by id and revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::error::Error::NotFound) when the
    /// document does not exist.
    async fn remove(&self, id: &str, rev: &str) -> Result<()>;

    /// Runs a range scan.
    async fn all_docs(&self, query: &AllDocsQuery) -> Result<Vec<DocRow>>;

    /// Gets many documents, one result per id.
    ///
    /// The default implementation loops; batching backends override this
    /// with a single round trip.
    async fn get_many(&self, ids: &[String]) -> Vec<Result<Option<Doc>>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.get(id).await);
        }
        results
    }

    /// Writes many documents, one result per document.
    ///
    /// The default implementation loops; batching backends override this
    /// with a single round trip.
    async fn put_many(&self, docs: &[Doc]) -> Vec<Result<String>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            results.push(self.put(doc).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builders() {
        let query = AllDocsQuery::descending("k/o1/t/9", "k/o1/t/0")
            .with_limit(1)
            .with_docs();
        assert!(query.descending);
        assert_eq!(query.limit, Some(1));
        assert!(query.include_docs);
        assert_eq!(query.startkey, "k/o1/t/9");
        assert_eq!(query.endkey, "k/o1/t/0");
    }
}
