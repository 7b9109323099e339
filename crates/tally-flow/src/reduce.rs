//! The reduce engine.
//!
//! Inputs are folded against the most recent accumulated state of their
//! group. Calls with identical group keys are processed together as one
//! batch under the group lock:
//!
//! 1. acquire the group lock
//! 2. admit each call: duplicate-filter check confirmed against the output
//!    store, then idempotent input logging
//! 3. read the latest accumulator per output slot (descending range scan
//!    over the accumulator's month, limit 1) and retain its revision
//! 4. fold each input through the user reducer, each call seeing the
//!    previous call's outputs
//! 5. materialize final output documents (back-reference, id, processing
//!    stamps); calls whose outputs carry an `error` mark fail and skip the
//!    sink and log steps
//! 6. POST each call's outputs to the sink
//! 7. only when every call in the batch succeeded at the sink, log the
//!    outputs — in place when the id matches the accumulator read in step
//!    3 (reusing its revision), fresh otherwise
//! 8. release the lock (guaranteed by the guard)
//!
//! A revision conflict between step 3 and step 7 means another writer got
//! there first; the store surfaces a 409 and the whole batch fails so the
//! caller can retry.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use tally_core::dedupe::DedupeFilter;
use tally_core::id::{kturi, tkuri};
use tally_core::lock::GroupLocks;
use tally_core::partition::{month_end, month_start};

use crate::config::PipelineConfig;
use crate::doc::Doc;
use crate::error::{Error, Result};
use crate::logger::{build_error_doc, Logger};
use crate::sink::SinkPoster;
use crate::store::{AllDocsQuery, DocStore};

/// Returns the current time in milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One reduce call: a stamped input with its derived routing tuples.
#[derive(Clone)]
pub struct ReduceCall {
    /// The stamped input document.
    pub idoc: Doc,
    /// The input time.
    pub itime: i64,
    /// Group identifiers; the first one keys the group lock.
    pub igroups: Vec<String>,
    /// Output keys, one per slot.
    pub okeys: Vec<String>,
    /// Output times, one per slot.
    pub otimes: Vec<i64>,
    /// Sink routing keys, one per slot.
    pub skeys: Vec<String>,
    /// Sink routing times, one per slot.
    pub stimes: Vec<i64>,
    /// The caller's auth context, passed through to key functions.
    pub auth: Option<Value>,
}

impl ReduceCall {
    /// The batch grouping key.
    #[must_use]
    pub fn group_key(&self) -> String {
        self.igroups.join("/")
    }
}

/// The engine folding grouped inputs into accumulated outputs.
pub struct ReduceEngine {
    config: PipelineConfig,
    output_store: Option<Arc<dyn DocStore>>,
    poster: Option<Arc<SinkPoster>>,
    locks: Arc<GroupLocks>,
    dedupe: Option<Arc<DedupeFilter>>,
    logger: Logger,
}

impl ReduceEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        output_store: Option<Arc<dyn DocStore>>,
        poster: Option<Arc<SinkPoster>>,
        locks: Arc<GroupLocks>,
        dedupe: Option<Arc<DedupeFilter>>,
        logger: Logger,
    ) -> Self {
        Self {
            config,
            output_store,
            poster,
            locks,
            dedupe,
            logger,
        }
    }

    /// The back-reference field outputs carry (`<inputType>_id`).
    #[must_use]
    pub fn back_reference_field(&self) -> String {
        format!("{}_id", self.config.input.doc_type)
    }

    /// Processes a batch of calls, grouping by group key. Per-call results
    /// keep the input order: the stamped input on success, the structured
    /// error otherwise.
    pub async fn process_batch(&self, calls: Vec<ReduceCall>) -> Vec<Result<Doc>> {
        let total = calls.len();
        let mut groups: Vec<(String, Vec<(usize, ReduceCall)>)> = Vec::new();
        for (index, call) in calls.into_iter().enumerate() {
            let key = call.group_key();
            if let Some((_, members)) = groups.iter_mut().find(|(k, _)| *k == key) {
                members.push((index, call));
            } else {
                groups.push((key, vec![(index, call)]));
            }
        }

        let mut results: Vec<Option<Result<Doc>>> = (0..total).map(|_| None).collect();
        for (_, members) in groups {
            let (indexes, group_calls): (Vec<usize>, Vec<ReduceCall>) =
                members.into_iter().unzip();
            let group_results = self.process_group(group_calls).await;
            for (index, result) in indexes.into_iter().zip(group_results) {
                results[index] = Some(result);
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::storage("call lost in batch"))))
            .collect()
    }

    /// Processes one group's calls under its lock.
    async fn process_group(&self, calls: Vec<ReduceCall>) -> Vec<Result<Doc>> {
        let group = calls
            .first()
            .and_then(|c| c.igroups.first())
            .cloned()
            .unwrap_or_default();
        let _guard = self.locks.acquire(&group).await;
        debug!(group = %group, calls = calls.len(), "reducing group batch");

        let mut results: Vec<Option<Result<Doc>>> = (0..calls.len()).map(|_| None).collect();

        // Admission: duplicate detection, then idempotent input logging.
        let mut active: Vec<usize> = Vec::new();
        for (j, call) in calls.iter().enumerate() {
            match self.admit(call).await {
                Ok(()) => active.push(j),
                Err(e) => results[j] = Some(Err(e)),
            }
        }
        if active.is_empty() {
            return finish(results);
        }

        match self.reduce_active(&calls, &active).await {
            Ok(per_call) => {
                for (j, outcome) in active.iter().copied().zip(per_call) {
                    results[j] = Some(match outcome {
                        Ok(()) => {
                            if let (Some(filter), Some(id)) = (&self.dedupe, calls[j].idoc.id()) {
                                filter.add(id);
                            }
                            Ok(calls[j].idoc.clone())
                        }
                        Err(e) => {
                            self.log_call_error(&calls[j], &e).await;
                            Err(e)
                        }
                    });
                }
            }
            Err(batch_error) => {
                // The whole batch failed (reducer threw, or the output log
                // conflicted): every admitted call gets the error.
                for j in active {
                    let e = replicate(&batch_error);
                    self.log_call_error(&calls[j], &e).await;
                    results[j] = Some(Err(e));
                }
            }
        }
        finish(results)
    }

    /// Runs steps 3-7 for the admitted calls of a group batch.
    ///
    /// The outer `Err` is a batch-level failure; the inner results are
    /// per-call sink/mark outcomes.
    async fn reduce_active(
        &self,
        calls: &[ReduceCall],
        active: &[usize],
    ) -> Result<Vec<std::result::Result<(), Error>>> {
        let first = &calls[active[0]];
        let slots = first.okeys.len();

        // Step 3: latest accumulator (and its revision) per output slot.
        let mut accums: Vec<Option<Doc>> = Vec::with_capacity(slots);
        for i in 0..slots {
            accums.push(self.last_accum(&first.okeys[i], first.otimes[i]).await?);
        }

        // Step 4: fold the reducer, each call seeing its predecessor's
        // outputs. The seed is the accumulator row, Null where absent.
        let seed: Vec<Value> = accums
            .iter()
            .map(|a| a.as_ref().map_or(Value::Null, Doc::to_value))
            .collect();
        let mut log: Vec<Vec<Value>> = vec![seed];
        for &j in active {
            let call = &calls[j];
            let previous = log.last().map(Vec::as_slice).unwrap_or(&[]);
            let reduced = (self.config.reducer)(previous, &call.idoc)
                .map_err(|e| Error::Reducer {
                    message: e.to_string(),
                })?;
            log.push(reduced);
        }

        // Step 5: materialize each call's outputs and check error marks.
        let back_reference = self.back_reference_field();
        let mut outputs: Vec<Vec<Doc>> = Vec::with_capacity(active.len());
        let mut outcomes: Vec<std::result::Result<(), Error>> = Vec::with_capacity(active.len());
        for (position, &j) in active.iter().enumerate() {
            let call = &calls[j];
            let entries = &log[position + 1];
            if entries.len() != call.okeys.len() {
                outcomes.push(Err(Error::Reducer {
                    message: format!(
                        "reducer returned {} outputs for {} slots",
                        entries.len(),
                        call.okeys.len()
                    ),
                }));
                outputs.push(Vec::new());
                continue;
            }

            let now = now_ms();
            let mut odocs = Vec::with_capacity(entries.len());
            let mut marked = None;
            for (i, entry) in entries.iter().enumerate() {
                let mut odoc = Doc::from_value(entry.clone())?;
                if let Some(input_id) = call.idoc.id() {
                    let input_id = input_id.to_string();
                    odoc.set(back_reference.clone(), Value::String(input_id));
                }
                odoc.set_id(kturi(&call.okeys[i], call.otimes[i]));
                odoc.set_processed(now);
                if marked.is_none() {
                    if let Some(mark) = odoc.error() {
                        marked = Some(Error::from_reducer_mark(
                            mark,
                            odoc.get(crate::doc::REASON),
                        ));
                    }
                }
                odocs.push(odoc);
            }
            match marked {
                Some(e) => {
                    outcomes.push(Err(e));
                    outputs.push(Vec::new());
                }
                None => {
                    outcomes.push(Ok(()));
                    outputs.push(odocs);
                }
            }
        }

        // Step 6: sink fan-out per call; marked calls are skipped.
        if let Some(poster) = &self.poster {
            for (position, &j) in active.iter().enumerate() {
                if outcomes[position].is_err() {
                    continue;
                }
                let call = &calls[j];
                let route_ids: Vec<String> = call
                    .skeys
                    .iter()
                    .zip(&call.stimes)
                    .map(|(k, t)| kturi(k, *t))
                    .collect();
                if let Err(e) = poster.post_outputs(&outputs[position], &route_ids).await {
                    outcomes[position] = Err(e);
                }
            }
        }

        // Step 7: log outputs only when every call succeeded at the sink.
        if outcomes.iter().all(std::result::Result::is_ok) {
            let mut to_log: Vec<Doc> = Vec::new();
            for (position, odocs) in outputs.iter().enumerate() {
                let call = &calls[active[position]];
                for (i, odoc) in odocs.iter().enumerate() {
                    let mut odoc = odoc.clone();
                    let accum = accums.get(i).and_then(Option::as_ref);
                    match accum {
                        Some(accum)
                            if accum.id() == odoc.id() && accum.rev().is_some() =>
                        {
                            // Update in place with the revision read in
                            // step 3.
                            let rev = accum.rev().unwrap_or_default().to_string();
                            odoc.set_rev(rev);
                        }
                        _ => {
                            // A fresh document: drop any revision inherited
                            // from the fold seed.
                            odoc.remove(crate::doc::REV);
                        }
                    }
                    debug!(id = ?odoc.id(), input = ?call.idoc.id(), "logging output");
                    to_log.push(odoc);
                }
            }
            self.logger.log_outputs(&to_log).await?;
        } else {
            warn!(group = ?first.igroups, "sink failures in batch, outputs not logged");
        }

        Ok(outcomes)
    }

    /// Duplicate detection and idempotent input logging for one call.
    async fn admit(&self, call: &ReduceCall) -> Result<()> {
        let Some(input_id) = call.idoc.id() else {
            return Err(Error::InvalidInput("input document has no id".into()));
        };

        if let Some(filter) = &self.dedupe {
            if filter.has(input_id) {
                // Possibly seen: confirm against the output store before
                // rejecting, the filter can report false positives.
                if let (Some(store), Some(okey), Some(otime)) = (
                    &self.output_store,
                    call.okeys.last(),
                    call.otimes.last(),
                ) {
                    let output_id = kturi(okey, *otime);
                    if let Some(odoc) = store.get(&output_id).await? {
                        let back_reference = self.back_reference_field();
                        let referenced = odoc
                            .get(&back_reference)
                            .and_then(Value::as_str)
                            .is_some_and(|id| id == input_id);
                        if referenced {
                            debug!(id = input_id, "duplicate input rejected");
                            return Err(Error::Duplicate {
                                id: input_id.to_string(),
                            });
                        }
                    }
                }
            }
        }

        self.logger.log_input(&call.idoc).await
    }

    /// Reads the latest accumulator for an output slot.
    async fn last_accum(&self, okey: &str, otime: i64) -> Result<Option<Doc>> {
        let Some(store) = &self.output_store else {
            return Ok(None);
        };
        let startkey = format!("{}ZZZ", kturi(okey, month_end(otime)?));
        let endkey = kturi(okey, month_start(otime)?);
        let rows = store
            .all_docs(
                &AllDocsQuery::descending(startkey, endkey)
                    .with_limit(1)
                    .with_docs(),
            )
            .await?;
        Ok(rows.into_iter().next().and_then(|row| row.doc))
    }

    /// Writes the error document for a failed call.
    async fn log_call_error(&self, call: &ReduceCall, error: &Error) {
        if matches!(error, Error::Duplicate { .. }) {
            return;
        }
        let key_fn = self
            .config
            .error
            .key
            .clone()
            .unwrap_or_else(|| self.config.input.key.clone());
        let time_fn = self
            .config
            .error
            .time
            .clone()
            .unwrap_or_else(|| self.config.input.time.clone());
        let ekey = key_fn(&call.idoc, call.auth.as_ref());
        let etime = time_fn(&call.idoc);
        let error_id = tkuri(&ekey, etime);
        let edoc = build_error_doc(&call.idoc, &error_id, error);
        if let Err(e) = self.logger.log_error(&edoc).await {
            warn!(id = %error_id, error = %e, "failed to log error document");
        }
    }
}

/// Replicates a batch-level error for fan-out to every call.
fn replicate(error: &Error) -> Error {
    match error {
        Error::Conflict { id } => Error::Conflict { id: id.clone() },
        Error::Duplicate { id } => Error::Duplicate { id: id.clone() },
        Error::Sink { reasons } => Error::Sink {
            reasons: reasons.clone(),
        },
        Error::Reducer { message } => Error::Reducer {
            message: message.clone(),
        },
        Error::Marked { error, reason } => Error::Marked {
            error: error.clone(),
            reason: reason.clone(),
        },
        other => Error::storage(other.to_string()),
    }
}

fn finish(results: Vec<Option<Result<Doc>>>) -> Vec<Result<Doc>> {
    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(Error::storage("call lost in group"))))
        .collect()
}
