//! In-memory store implementation.
//!
//! [`MemoryStore`] keeps documents in an ordered map with numeric revision
//! tokens, which makes it a faithful stand-in for the partitioned document
//! store in tests and development.
//!
//! ## Limitations
//!
//! - **Not durable**: all state is lost when the process exits
//! - **Single-process only**: state is not shared across processes

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::doc::Doc;
use crate::error::{Error, Result};

use super::{AllDocsQuery, DocRow, DocStore};

/// In-memory document store with revision tracking.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Stored>>,
}

#[derive(Debug, Clone)]
struct Stored {
    doc: Doc,
    rev: u64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Doc>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(id).map(|stored| stored.doc.clone()))
    }

    async fn put(&self, doc: &Doc) -> Result<String> {
        let id = doc
            .id()
            .ok_or_else(|| Error::InvalidInput("document has no id".into()))?
            .to_string();

        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let new_rev = match (docs.get(&id), doc.rev()) {
            // Insert: no stored doc, no carried rev.
            (None, None) => 1,
            // Update: carried rev must match the stored one.
            (Some(stored), Some(rev)) if stored.rev.to_string() == rev => stored.rev + 1,
            _ => return Err(Error::Conflict { id }),
        };

        let mut stamped = doc.clone();
        stamped.set_rev(new_rev.to_string());
        docs.insert(
            id,
            Stored {
                doc: stamped,
                rev: new_rev,
            },
        );
        Ok(new_rev.to_string())
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        match docs.get(id) {
            None => Err(Error::NotFound { id: id.to_string() }),
            Some(stored) if stored.rev.to_string() != rev => {
                Err(Error::Conflict { id: id.to_string() })
            }
            Some(_) => {
                docs.remove(id);
                Ok(())
            }
        }
    }

    async fn all_docs(&self, query: &AllDocsQuery) -> Result<Vec<DocRow>> {
        let (lo, hi) = if query.descending {
            (&query.endkey, &query.startkey)
        } else {
            (&query.startkey, &query.endkey)
        };
        if lo > hi {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let range = docs.range::<String, _>((Bound::Included(lo), Bound::Included(hi)));

        let mut rows: Vec<DocRow> = range
            .map(|(id, stored)| DocRow {
                id: id.clone(),
                rev: stored.rev.to_string(),
                doc: query.include_docs.then(|| stored.doc.clone()),
            })
            .collect();
        if query.descending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::id::kturi;

    fn doc(id: &str, body: serde_json::Value) -> Doc {
        let mut doc = Doc::from_value(body).unwrap();
        doc.set_id(id);
        doc
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = MemoryStore::new();
        let rev = store
            .put(&doc("k/o1/t/0000000000000001", json!({"total": 1})))
            .await
            .unwrap();
        assert_eq!(rev, "1");

        let fetched = store.get("k/o1/t/0000000000000001").await.unwrap().unwrap();
        assert_eq!(fetched.get("total"), Some(&json!(1)));
        assert_eq!(fetched.rev(), Some("1"));
    }

    #[tokio::test]
    async fn update_requires_matching_rev() {
        let store = MemoryStore::new();
        let id = "k/o1/t/0000000000000001";
        store.put(&doc(id, json!({"total": 1}))).await.unwrap();

        // Re-insert without rev conflicts.
        let err = store.put(&doc(id, json!({"total": 2}))).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(err.status(), 409);

        // Update with the right rev advances.
        let mut update = doc(id, json!({"total": 2}));
        update.set_rev("1");
        assert_eq!(store.put(&update).await.unwrap(), "2");

        // The stale rev now conflicts.
        let mut stale = doc(id, json!({"total": 3}));
        stale.set_rev("1");
        assert!(matches!(
            store.put(&stale).await,
            Err(Error::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn update_of_missing_doc_conflicts() {
        let store = MemoryStore::new();
        let mut update = doc("k/o1/t/0000000000000001", json!({"total": 1}));
        update.set_rev("1");
        assert!(matches!(
            store.put(&update).await,
            Err(Error::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn remove_checks_rev_and_existence() {
        let store = MemoryStore::new();
        let id = "k/o1/t/0000000000000001";
        store.put(&doc(id, json!({}))).await.unwrap();

        assert!(matches!(
            store.remove(id, "9").await,
            Err(Error::Conflict { .. })
        ));
        store.remove(id, "1").await.unwrap();
        assert!(matches!(
            store.remove(id, "1").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn descending_scan_finds_latest() {
        let store = MemoryStore::new();
        for t in [1_i64, 5, 3] {
            store
                .put(&doc(&kturi("o1", t), json!({"t": t})))
                .await
                .unwrap();
        }
        // Another key outside the scan range.
        store
            .put(&doc(&kturi("o2", 9), json!({"t": 9})))
            .await
            .unwrap();

        let rows = store
            .all_docs(
                &AllDocsQuery::descending(format!("{}ZZZ", kturi("o1", 9)), kturi("o1", 0))
                    .with_limit(1)
                    .with_docs(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, kturi("o1", 5));
        assert_eq!(rows[0].doc.as_ref().unwrap().get("t"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn ascending_scan_orders_and_limits() {
        let store = MemoryStore::new();
        for t in [4_i64, 2, 8, 6] {
            store
                .put(&doc(&kturi("o1", t), json!({})))
                .await
                .unwrap();
        }
        let rows = store
            .all_docs(&AllDocsQuery::ascending(kturi("o1", 0), kturi("o1", 9)).with_limit(3))
            .await
            .unwrap();
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![kturi("o1", 2), kturi("o1", 4), kturi("o1", 6)]);
        assert!(rows[0].doc.is_none());
    }
}
