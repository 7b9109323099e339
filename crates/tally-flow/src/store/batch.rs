//! Request-coalescing middleware for stores.
//!
//! [`BatchStore`] funnels individual `get`/`put` calls through a background
//! worker that coalesces them into bulk `get_many`/`put_many` round trips.
//! A batch flushes when it reaches 100 items, roughly 1 MiB of document
//! payload, or the end of a short collection window, whichever comes first.
//! Requests keep their arrival order within a batch.
//!
//! Range scans and removes are not coalesced; they pass straight through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::doc::Doc;
use crate::error::{Error, Result};

use super::{AllDocsQuery, DocRow, DocStore};

/// Batching window configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum requests per flush.
    pub max_items: usize,
    /// Approximate maximum payload bytes per flush.
    pub max_bytes: usize,
    /// Collection window after the first request of a batch.
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 100,
            max_bytes: 1 << 20,
            max_delay: Duration::from_millis(5),
        }
    }
}

enum Request {
    Get {
        id: String,
        tx: oneshot::Sender<Result<Option<Doc>>>,
    },
    Put {
        doc: Doc,
        tx: oneshot::Sender<Result<String>>,
    },
}

impl Request {
    fn approx_size(&self) -> usize {
        match self {
            Self::Get { id, .. } => id.len(),
            Self::Put { doc, .. } => doc.approx_size(),
        }
    }
}

/// A store wrapper that coalesces point reads and writes.
///
/// Must be constructed inside a tokio runtime; the coalescing worker is a
/// spawned task that exits when the wrapper is dropped.
pub struct BatchStore {
    tx: mpsc::Sender<Request>,
    inner: Arc<dyn DocStore>,
}

impl BatchStore {
    /// Wraps a store with the default batching window.
    #[must_use]
    pub fn wrap(inner: Arc<dyn DocStore>) -> Self {
        Self::with_config(inner, BatchConfig::default())
    }

    /// Wraps a store with an explicit batching window.
    #[must_use]
    pub fn with_config(inner: Arc<dyn DocStore>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_items.max(1) * 2);
        let worker_inner = Arc::clone(&inner);
        tokio::spawn(worker(worker_inner, rx, config));
        Self { tx, inner }
    }
}

async fn worker(inner: Arc<dyn DocStore>, mut rx: mpsc::Receiver<Request>, config: BatchConfig) {
    while let Some(first) = rx.recv().await {
        let mut bytes = first.approx_size();
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + config.max_delay;

        while batch.len() < config.max_items && bytes < config.max_bytes {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(request)) => {
                    bytes += request.approx_size();
                    batch.push(request);
                }
                Ok(None) | Err(_) => break,
            }
        }

        debug!(items = batch.len(), bytes, "flushing store batch");
        flush(&inner, batch).await;
    }
}

async fn flush(inner: &Arc<dyn DocStore>, batch: Vec<Request>) {
    let mut get_ids = Vec::new();
    let mut get_txs = Vec::new();
    let mut put_docs = Vec::new();
    let mut put_txs = Vec::new();

    for request in batch {
        match request {
            Request::Get { id, tx } => {
                get_ids.push(id);
                get_txs.push(tx);
            }
            Request::Put { doc, tx } => {
                put_docs.push(doc);
                put_txs.push(tx);
            }
        }
    }

    if !get_ids.is_empty() {
        let results = inner.get_many(&get_ids).await;
        for (tx, result) in get_txs.into_iter().zip(results) {
            let _ = tx.send(result);
        }
    }
    if !put_docs.is_empty() {
        let results = inner.put_many(&put_docs).await;
        for (tx, result) in put_txs.into_iter().zip(results) {
            let _ = tx.send(result);
        }
    }
}

fn worker_gone() -> Error {
    Error::storage("batch worker stopped")
}

#[async_trait]
impl DocStore for BatchStore {
    async fn get(&self, id: &str) -> Result<Option<Doc>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Get {
                id: id.to_string(),
                tx,
            })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    async fn put(&self, doc: &Doc) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Put {
                doc: doc.clone(),
                tx,
            })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<()> {
        self.inner.remove(id, rev).await
    }

    async fn all_docs(&self, query: &AllDocsQuery) -> Result<Vec<DocRow>> {
        self.inner.all_docs(query).await
    }

    async fn get_many(&self, ids: &[String]) -> Vec<Result<Option<Doc>>> {
        self.inner.get_many(ids).await
    }

    async fn put_many(&self, docs: &[Doc]) -> Vec<Result<String>> {
        self.inner.put_many(docs).await
    }
}
