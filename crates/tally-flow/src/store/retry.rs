//! Per-call retry middleware for stores.
//!
//! [`RetryStore`] re-attempts failed store calls with exponential backoff.
//! Errors flagged `noretry` (duplicates, conflicts, window limits) pass
//! straight through: a revision conflict must surface to the reduce batch,
//! which retries as a whole.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::doc::Doc;
use crate::error::Result;

use super::{AllDocsQuery, DocRow, DocStore};

/// Retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per retry.
    pub base_backoff: Duration,
    /// Ceiling for the backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// A store wrapper that retries transient failures.
pub struct RetryStore {
    inner: Arc<dyn DocStore>,
    policy: RetryPolicy,
}

impl RetryStore {
    /// Wraps a store with the default retry policy.
    #[must_use]
    pub fn wrap(inner: Arc<dyn DocStore>) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    /// Wraps a store with an explicit retry policy.
    #[must_use]
    pub fn with_policy(inner: Arc<dyn DocStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = self.policy.base_backoff;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_noretry() || attempt >= self.policy.max_attempts => {
                    return Err(err);
                }
                Err(err) => {
                    debug!(op, attempt, error = %err, "retrying store call");
                    tokio::time::sleep(backoff.min(self.policy.max_backoff)).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl DocStore for RetryStore {
    async fn get(&self, id: &str) -> Result<Option<Doc>> {
        self.run("get", || self.inner.get(id)).await
    }

    async fn put(&self, doc: &Doc) -> Result<String> {
        self.run("put", || self.inner.put(doc)).await
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<()> {
        self.run("remove", || self.inner.remove(id, rev)).await
    }

    async fn all_docs(&self, query: &AllDocsQuery) -> Result<Vec<DocRow>> {
        self.run("all_docs", || self.inner.all_docs(query)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::Error;

    /// Store that fails a configurable number of times before succeeding.
    #[derive(Default)]
    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DocStore for Flaky {
        async fn get(&self, _id: &str) -> Result<Option<Doc>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures.load(Ordering::SeqCst) {
                Err(Error::storage("transient"))
            } else {
                Ok(None)
            }
        }

        async fn put(&self, doc: &Doc) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Conflict {
                id: doc.id().unwrap_or("").to_string(),
            })
        }

        async fn remove(&self, _id: &str, _rev: &str) -> Result<()> {
            Ok(())
        }

        async fn all_docs(&self, _query: &AllDocsQuery) -> Result<Vec<DocRow>> {
            Ok(Vec::new())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let flaky = Arc::new(Flaky::default());
        flaky.failures.store(2, Ordering::SeqCst);
        let store = RetryStore::with_policy(Arc::clone(&flaky) as Arc<dyn DocStore>, fast_policy());

        assert!(store.get("t/0000000000000001/k/o1").await.unwrap().is_none());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let flaky = Arc::new(Flaky::default());
        flaky.failures.store(100, Ordering::SeqCst);
        let store = RetryStore::with_policy(Arc::clone(&flaky) as Arc<dyn DocStore>, fast_policy());

        assert!(store.get("t/0000000000000001/k/o1").await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let flaky = Arc::new(Flaky::default());
        let store = RetryStore::with_policy(Arc::clone(&flaky) as Arc<dyn DocStore>, fast_policy());

        let mut doc = Doc::new();
        doc.set_id("k/o1/t/0000000000000001");
        assert!(matches!(
            store.put(&doc).await,
            Err(Error::Conflict { .. })
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
