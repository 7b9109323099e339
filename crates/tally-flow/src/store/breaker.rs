//! Circuit breaker middleware for stores.
//!
//! [`BreakerStore`] follows the standard closed/open/half-open model: the
//! circuit opens after a run of consecutive failures and fails fast until a
//! recovery timeout elapses, then lets probe calls through and closes again
//! after enough successes. Errors flagged `nobreaker` (duplicates,
//! conflicts) never count as failures.
//!
//! Breaker state is per wrapped store, so each storage target trips
//! independently.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::doc::Doc;
use crate::error::{Error, Result};

use super::{AllDocsQuery, DocRow, DocStore};

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A store wrapper that fails fast while its target is unhealthy.
pub struct BreakerStore {
    inner: Arc<dyn DocStore>,
    target: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl BreakerStore {
    /// Wraps a store with the default breaker configuration.
    #[must_use]
    pub fn wrap(target: impl Into<String>, inner: Arc<dyn DocStore>) -> Self {
        Self::with_config(target, inner, BreakerConfig::default())
    }

    /// Wraps a store with an explicit breaker configuration.
    #[must_use]
    pub fn with_config(
        target: impl Into<String>,
        inner: Arc<dyn DocStore>,
        config: BreakerConfig,
    ) -> Self {
        Self {
            inner,
            target: target.into(),
            config,
            state: Mutex::new(BreakerState {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Admission check before a call; transitions open -> half-open once
    /// the recovery timeout has elapsed.
    fn admit(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => {
                let elapsed = state
                    .opened_at
                    .map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= self.config.recovery_timeout {
                    state.state = State::HalfOpen;
                    state.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(Error::BreakerOpen {
                        target: self.target.clone(),
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_failures = 0;
        if state.state == State::HalfOpen {
            state.consecutive_successes += 1;
            if state.consecutive_successes >= self.config.success_threshold {
                state.state = State::Closed;
                state.opened_at = None;
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        let tripped = state.state == State::HalfOpen
            || state.consecutive_failures >= self.config.failure_threshold;
        if tripped && state.state != State::Open {
            state.state = State::Open;
            state.opened_at = Some(Instant::now());
            warn!(target = %self.target, "circuit opened");
        }
    }

    async fn run<T, Fut>(&self, call: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.admit()?;
        match call.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if !err.is_nobreaker() {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl DocStore for BreakerStore {
    async fn get(&self, id: &str) -> Result<Option<Doc>> {
        self.run(self.inner.get(id)).await
    }

    async fn put(&self, doc: &Doc) -> Result<String> {
        self.run(self.inner.put(doc)).await
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<()> {
        self.run(self.inner.remove(id, rev)).await
    }

    async fn all_docs(&self, query: &AllDocsQuery) -> Result<Vec<DocRow>> {
        self.run(self.inner.all_docs(query)).await
    }
}
