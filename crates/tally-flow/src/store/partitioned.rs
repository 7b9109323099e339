//! Partitioned store facade.
//!
//! [`PartitionedStore`] presents one logical [`DocStore`] over many physical
//! partitions. Single-document operations route by the id's `(key, time)`
//! through a [`Partitioner`]; range scans fan out across every month epoch
//! the window spans and merge the rows.
//!
//! Physical partitions are opened lazily through a [`StoreProvider`], one
//! backend per `(partition, epoch)` pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use tally_core::id::{key_of, time_of};
use tally_core::partition::{Destination, Op, Partitioner};

use crate::doc::Doc;
use crate::error::{Error, Result};

use super::memory::MemoryStore;
use super::{AllDocsQuery, DocRow, DocStore};

/// Opens physical store partitions on demand.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Opens (or creates) the backend for one `(partition, epoch)` of a
    /// named store.
    async fn open(&self, name: &str, destination: Destination) -> Result<Arc<dyn DocStore>>;
}

/// Provider handing out in-memory partitions, for tests and development.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    stores: Mutex<HashMap<(String, u32, i32), Arc<MemoryStore>>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreProvider for MemoryProvider {
    async fn open(&self, name: &str, destination: Destination) -> Result<Arc<dyn DocStore>> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let store = stores
            .entry((name.to_string(), destination.partition, destination.epoch))
            .or_insert_with(|| Arc::new(MemoryStore::new()));
        Ok(Arc::clone(store) as Arc<dyn DocStore>)
    }
}

/// One logical store routed over physical partitions.
pub struct PartitionedStore {
    name: String,
    partitioner: Partitioner,
    provider: Arc<dyn StoreProvider>,
}

impl PartitionedStore {
    /// Creates a partitioned store facade.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        partitioner: Partitioner,
        provider: Arc<dyn StoreProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            partitioner,
            provider,
        }
    }

    /// The logical store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn store_for(&self, id: &str, op: Op) -> Result<Arc<dyn DocStore>> {
        let key = key_of(id)?;
        let time = time_of(id)?;
        let destination = self.partitioner.route(&key, time, op)?;
        self.provider.open(&self.name, destination).await
    }
}

#[async_trait]
impl DocStore for PartitionedStore {
    async fn get(&self, id: &str) -> Result<Option<Doc>> {
        self.store_for(id, Op::Read).await?.get(id).await
    }

    async fn put(&self, doc: &Doc) -> Result<String> {
        let id = doc
            .id()
            .ok_or_else(|| Error::InvalidInput("document has no id".into()))?;
        self.store_for(id, Op::Write).await?.put(doc).await
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<()> {
        self.store_for(id, Op::Write).await?.remove(id, rev).await
    }

    async fn all_docs(&self, query: &AllDocsQuery) -> Result<Vec<DocRow>> {
        // Both bounds share the scanned key; the partition comes from it
        // and the epochs from the time window the bounds bracket.
        let key = key_of(&query.startkey).unwrap_or_default();
        let start = time_of(&query.startkey)?;
        let end = time_of(&query.endkey)?;
        let destinations = self.partitioner.route_range(&key, start, end)?;

        let mut rows = Vec::new();
        for destination in destinations {
            let store = self.provider.open(&self.name, destination).await?;
            rows.extend(store.all_docs(query).await?);
        }

        if query.descending {
            rows.sort_by(|a, b| b.id.cmp(&a.id));
        } else {
            rows.sort_by(|a, b| a.id.cmp(&b.id));
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
    use tally_core::id::{kturi, pad16, tkuri};

    // 2023-11-14T22:13:20Z
    const NOV: i64 = 1_700_000_000_000;
    // 2023-12-15T00:00:00Z
    const DEC: i64 = 1_702_598_400_000;

    fn doc(id: &str) -> Doc {
        let mut doc = Doc::from_value(json!({})).unwrap();
        doc.set_id(id);
        doc
    }

    #[tokio::test]
    async fn routes_by_key_and_epoch() {
        let provider = Arc::new(MemoryProvider::new());
        let store = PartitionedStore::new(
            "outputs",
            Partitioner::forward(4),
            Arc::clone(&provider) as Arc<dyn StoreProvider>,
        );

        store.put(&doc(&kturi("o1", NOV))).await.unwrap();
        store.put(&doc(&kturi("o1", DEC))).await.unwrap();

        // Two epochs means two physical partitions were opened.
        assert_eq!(
            provider
                .stores
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            2
        );
        assert!(store.get(&kturi("o1", NOV)).await.unwrap().is_some());
        assert!(store.get(&kturi("o1", DEC)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn range_scan_merges_epochs() {
        let provider: Arc<dyn StoreProvider> = Arc::new(MemoryProvider::new());
        let store = PartitionedStore::new("inputs", Partitioner::SingleDb, provider);

        store.put(&doc(&tkuri("o1", NOV))).await.unwrap();
        store.put(&doc(&tkuri("o1", DEC))).await.unwrap();
        store.put(&doc(&tkuri("o2", DEC + 1))).await.unwrap();

        let rows = store
            .all_docs(&AllDocsQuery::ascending(
                format!("t/{}", pad16(NOV - 1000)),
                format!("t/{}ZZZ", pad16(DEC + 2)),
            ))
            .await
            .unwrap();
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        assert_eq!(
            ids,
            vec![tkuri("o1", NOV), tkuri("o1", DEC), tkuri("o2", DEC + 1)]
        );
    }

    #[tokio::test]
    async fn descending_scan_merges_in_reverse() {
        let provider: Arc<dyn StoreProvider> = Arc::new(MemoryProvider::new());
        let store = PartitionedStore::new("outputs", Partitioner::None, provider);

        store.put(&doc(&kturi("o1", NOV))).await.unwrap();
        store.put(&doc(&kturi("o1", NOV + 5))).await.unwrap();

        let rows = store
            .all_docs(
                &AllDocsQuery::descending(
                    format!("{}ZZZ", kturi("o1", NOV + 10)),
                    kturi("o1", NOV),
                )
                .with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, kturi("o1", NOV + 5));
    }
}
