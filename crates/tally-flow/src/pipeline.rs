//! The pipeline service facade.
//!
//! [`Pipeline`] wires the configured stores, the duplicate filter, the
//! group locks, the sink poster, and the reduce engine into the operations
//! the router exposes: `play`, `get_input`, `get_output`, `get_errors`,
//! and `delete_error`.
//!
//! Construction goes through [`PipelineBuilder`]: deployment settings come
//! from [`Config`], application wiring from
//! [`PipelineConfig`](crate::config::PipelineConfig). Stores are opened as
//! partitioned facades and wrapped with the batching, circuit-breaker, and
//! retry middleware; the wrapping is invisible to callers.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, Instrument};

use tally_core::dedupe::DedupeFilter;
use tally_core::id::{pad16, tkuri};
use tally_core::lock::GroupLocks;
use tally_core::observability::pipeline_span;
use tally_core::partition::Partitioner;

use crate::config::{Config, PipelineConfig};
use crate::doc::{Doc, PROCESSED, PROCESSED_ID};
use crate::error::{Error, Result, MONTH_MS};
use crate::reduce::{ReduceCall, ReduceEngine};
use crate::replay::{ReplayDriver, ReplayStats};
use crate::sink::{HttpSink, SinkPoster, SinkTransport};
use crate::store::batch::BatchStore;
use crate::store::breaker::BreakerStore;
use crate::store::partitioned::{MemoryProvider, PartitionedStore, StoreProvider};
use crate::store::retry::RetryStore;
use crate::store::{AllDocsQuery, DocStore};
use crate::logger::Logger;

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    env: Config,
    provider: Option<Arc<dyn StoreProvider>>,
    transport: Option<Arc<dyn SinkTransport>>,
}

impl PipelineBuilder {
    /// Starts a builder from the application wiring and deployment config.
    #[must_use]
    pub fn new(config: PipelineConfig, env: Config) -> Self {
        Self {
            config,
            env,
            provider: None,
            transport: None,
        }
    }

    /// Sets the store provider. Defaults to in-memory partitions.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn StoreProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the sink transport. Defaults to the HTTP transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn SinkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the pipeline.
    ///
    /// Must run inside a tokio runtime (the store batching middleware
    /// spawns its coalescing worker).
    ///
    /// # Errors
    ///
    /// Returns an error when the store connection is missing or the sink
    /// transport cannot be constructed.
    pub fn build(self) -> Result<Pipeline> {
        if self.env.db_uri.trim().is_empty() {
            return Err(Error::MissingConfig("Missing DB configuration".into()));
        }
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(MemoryProvider::new()));

        let input_store = self
            .env
            .input_db
            .as_ref()
            .map(|name| wrap_store(name, Partitioner::SingleDb, &provider));
        let output_store = self.env.output_db.as_ref().map(|name| {
            wrap_store(
                name,
                Partitioner::forward(self.env.db_partitions),
                &provider,
            )
        });
        let error_store = self
            .env
            .error_db
            .as_ref()
            .map(|name| wrap_store(name, Partitioner::SingleDb, &provider));

        let poster = match &self.config.sink.host {
            Some(host) => {
                let transport = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(HttpSink::new()?) as Arc<dyn SinkTransport>,
                };
                Some(Arc::new(SinkPoster::new(
                    transport,
                    host.clone(),
                    self.env.sink_apps,
                    self.config.sink.posts.clone(),
                    self.env.sink_retries,
                    self.config.sink.authentication.clone(),
                    self.config.input.dedupe,
                )))
            }
            None => None,
        };

        let dedupe = self
            .config
            .input
            .dedupe
            .then(|| Arc::new(DedupeFilter::default()));
        let logger = Logger::new(
            input_store.clone(),
            output_store.clone(),
            error_store.clone(),
        );
        let engine = ReduceEngine::new(
            self.config.clone(),
            output_store.clone(),
            poster,
            Arc::new(GroupLocks::new()),
            dedupe,
            logger,
        );

        Ok(Pipeline {
            config: self.config,
            env: self.env,
            input_store,
            output_store,
            error_store,
            engine,
        })
    }
}

/// Opens a named store and wraps it with the middleware chain:
/// retry(breaker(batch(partitioned))).
fn wrap_store(
    name: &str,
    partitioner: Partitioner,
    provider: &Arc<dyn StoreProvider>,
) -> Arc<dyn DocStore> {
    let partitioned: Arc<dyn DocStore> = Arc::new(PartitionedStore::new(
        name,
        partitioner,
        Arc::clone(provider),
    ));
    let batched: Arc<dyn DocStore> = Arc::new(BatchStore::wrap(partitioned));
    let guarded: Arc<dyn DocStore> = Arc::new(BreakerStore::wrap(name, batched));
    Arc::new(RetryStore::wrap(guarded))
}

/// The dataflow reduce pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    env: Config,
    input_store: Option<Arc<dyn DocStore>>,
    output_store: Option<Arc<dyn DocStore>>,
    error_store: Option<Arc<dyn DocStore>>,
    engine: ReduceEngine,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: PipelineConfig, env: Config) -> PipelineBuilder {
        PipelineBuilder::new(config, env)
    }

    /// The application wiring.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The deployment settings.
    #[must_use]
    pub fn env(&self) -> &Config {
        &self.env
    }

    pub(crate) fn input_store(&self) -> Option<&Arc<dyn DocStore>> {
        self.input_store.as_ref()
    }

    pub(crate) fn output_store(&self) -> Option<&Arc<dyn DocStore>> {
        self.output_store.as_ref()
    }

    pub(crate) fn error_store(&self) -> Option<&Arc<dyn DocStore>> {
        self.error_store.as_ref()
    }

    /// Runs the full pipeline for one input document.
    ///
    /// Returns the stamped input on success.
    ///
    /// # Errors
    ///
    /// Returns the structured pipeline error; the router maps it to an
    /// HTTP status via [`Error::status`].
    pub async fn play(&self, idoc: Doc, auth: Option<Value>) -> Result<Doc> {
        let call = self.build_call(idoc, auth);
        let group = call.igroups.first().cloned().unwrap_or_default();
        let mut results = self
            .engine
            .process_batch(vec![call])
            .instrument(pipeline_span("play", &group))
            .await;
        results
            .pop()
            .unwrap_or_else(|| Err(Error::storage("empty batch result")))
    }

    /// Runs the pipeline for many inputs, batching calls that share a
    /// group key. Results keep the input order.
    pub async fn play_all(&self, idocs: Vec<Doc>, auth: Option<Value>) -> Vec<Result<Doc>> {
        let calls = idocs
            .into_iter()
            .map(|idoc| self.build_call(idoc, auth.clone()))
            .collect();
        self.engine.process_batch(calls).await
    }

    /// Stamps an input and derives its routing tuples.
    fn build_call(&self, mut idoc: Doc, auth: Option<Value>) -> ReduceCall {
        let ikey = (self.config.input.key)(&idoc, auth.as_ref());
        let itime = (self.config.input.time)(&idoc);
        idoc.set_id(tkuri(&ikey, itime));
        // processed keeps an existing value; processed_id is always the
        // padded input time.
        let processed = idoc.processed().unwrap_or(itime);
        idoc.set(PROCESSED, Value::from(processed));
        idoc.set(PROCESSED_ID, Value::String(pad16(itime)));

        let igroups = (self.config.input.groups)(&idoc);
        let okeys = (self.config.output.keys)(&idoc);
        let otimes = (self.config.output.times)(&idoc);
        let skeys = self
            .config
            .sink
            .keys
            .as_ref()
            .map_or_else(|| okeys.clone(), |f| f(&idoc));
        let stimes = self
            .config
            .sink
            .times
            .as_ref()
            .map_or_else(|| otimes.clone(), |f| f(&idoc));

        ReduceCall {
            idoc,
            itime,
            igroups,
            okeys,
            otimes,
            skeys,
            stimes,
            auth,
        }
    }

    /// Gets a logged input by `(key, time)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get_input(&self, key: &str, time_ms: i64) -> Result<Doc> {
        let id = tkuri(key, time_ms);
        let doc = match &self.input_store {
            Some(store) => store.get(&id).await?,
            None => None,
        };
        doc.ok_or(Error::NotFound { id })
    }

    /// Gets a logged output by `(key, time)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get_output(&self, key: &str, time_ms: i64) -> Result<Doc> {
        let id = tally_core::id::kturi(key, time_ms);
        let doc = match &self.output_store {
            Some(store) => store.get(&id).await?,
            None => None,
        };
        doc.ok_or(Error::NotFound { id })
    }

    /// Lists error documents in `[tstart, tend]`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WindowLimit`] when the window exceeds one month.
    pub async fn get_errors(&self, tstart: i64, tend: i64) -> Result<Vec<Doc>> {
        let window_ms = tend.saturating_sub(tstart);
        if window_ms > MONTH_MS {
            return Err(Error::WindowLimit { window_ms });
        }
        let Some(store) = &self.error_store else {
            return Ok(Vec::new());
        };
        let rows = store
            .all_docs(
                &AllDocsQuery::descending(
                    format!("t/{}ZZZ", pad16(tend)),
                    format!("t/{}", pad16(tstart)),
                )
                .with_docs(),
            )
            .await?;
        Ok(rows.into_iter().filter_map(|row| row.doc).collect())
    }

    /// Deletes an error document by `(key, time)`. The deletion is audited
    /// with the caller's identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn delete_error(&self, key: &str, time_ms: i64, actor: &str) -> Result<()> {
        let id = tkuri(key, time_ms);
        let Some(store) = &self.error_store else {
            return Err(Error::NotFound { id });
        };
        let Some(edoc) = store.get(&id).await? else {
            return Err(Error::NotFound { id });
        };
        let rev = edoc.rev().unwrap_or_default().to_string();
        store.remove(&id, &rev).await?;
        info!(actor, id = %id, "error document deleted");
        Ok(())
    }

    /// Runs the startup replay when a replay window is configured.
    ///
    /// # Errors
    ///
    /// Returns the replay scan error; per-input failures are counted, not
    /// propagated.
    pub async fn replay_on_start(&self) -> Result<Option<ReplayStats>> {
        if self.env.replay_window_ms <= 0 {
            debug!("replay disabled");
            return Ok(None);
        }
        let driver = ReplayDriver::new(self.env.replay_window_ms, self.env.page_size);
        let stats = driver.run(self).await?;
        info!(
            replayed = stats.replayed,
            failed = stats.failed,
            "startup replay finished"
        );
        Ok(Some(stats))
    }
}
