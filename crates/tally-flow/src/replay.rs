//! Replay of unprocessed inputs.
//!
//! An input that was logged but produced neither an output nor an error
//! document was interrupted mid-pipeline (a crash between the input log and
//! the output log). The replay driver rescans a bounded time window of the
//! input store and re-submits such inputs through the normal `play` path;
//! idempotence comes from the duplicate filter and the output-existence
//! check itself.
//!
//! Replay deletes nothing: error documents age out of their store
//! out-of-band (they are retained for a month), and outputs are permanent.

use tracing::{debug, warn};

use tally_core::id::{kturi, pad16, tkuri};

use crate::doc::{Doc, ID, PROCESSED, PROCESSED_ID, REV};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::reduce::now_ms;
use crate::store::AllDocsQuery;

/// Outcome counters of one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Inputs re-submitted through the pipeline.
    pub replayed: usize,
    /// Re-submissions that failed; logged, not retried inside replay.
    pub failed: usize,
}

/// Scans a time window of the input store and re-submits repairable inputs.
pub struct ReplayDriver {
    window_ms: i64,
    page_size: usize,
}

impl ReplayDriver {
    /// Creates a driver for the given window and page size.
    #[must_use]
    pub fn new(window_ms: i64, page_size: usize) -> Self {
        Self {
            window_ms,
            page_size: page_size.max(1),
        }
    }

    /// Runs the replay against a pipeline.
    ///
    /// # Errors
    ///
    /// Returns scan errors from the input store; individual re-submission
    /// failures only increment the `failed` counter.
    pub async fn run(&self, pipeline: &Pipeline) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        let Some(input_store) = pipeline.input_store() else {
            return Ok(stats);
        };

        let now = now_ms();
        let endkey = format!("t/{}", pad16(now));
        let mut startkey = format!("t/{}", pad16((now - self.window_ms).max(0)));

        loop {
            let rows = input_store
                .all_docs(
                    &AllDocsQuery::ascending(startkey.clone(), endkey.clone())
                        .with_limit(self.page_size)
                        .with_docs(),
                )
                .await?;
            let page_len = rows.len();

            for row in &rows {
                let Some(idoc) = &row.doc else { continue };
                match self.replay_one(pipeline, idoc).await {
                    Ok(true) => stats.replayed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(id = %row.id, error = %e, "replay failed for input");
                        stats.failed += 1;
                    }
                }
            }

            if page_len < self.page_size {
                break;
            }
            if let Some(last) = rows.last() {
                // Resume just past the last seen id.
                startkey = format!("{}\u{0}", last.id);
            }
        }

        Ok(stats)
    }

    /// Re-submits one input unless it already has an output or an error
    /// record. Returns whether it was re-submitted.
    async fn replay_one(&self, pipeline: &Pipeline, idoc: &Doc) -> Result<bool> {
        let config = pipeline.config();

        // Skip when the final output slot already exists.
        if let Some(output_store) = pipeline.output_store() {
            let okeys = (config.output.keys)(idoc);
            let otimes = (config.output.times)(idoc);
            if let (Some(okey), Some(otime)) = (okeys.last(), otimes.last()) {
                let output_id = kturi(okey, *otime);
                if output_store.get(&output_id).await?.is_some() {
                    debug!(id = ?idoc.id(), "output exists, skipping replay");
                    return Ok(false);
                }
            }
        }

        // Skip when an error record exists for the input.
        if let Some(error_store) = pipeline.error_store() {
            let key_fn = config
                .error
                .key
                .clone()
                .unwrap_or_else(|| config.input.key.clone());
            let time_fn = config
                .error
                .time
                .clone()
                .unwrap_or_else(|| config.input.time.clone());
            let error_id = tkuri(&key_fn(idoc, None), time_fn(idoc));
            if error_store.get(&error_id).await?.is_some() {
                debug!(id = ?idoc.id(), "error record exists, skipping replay");
                return Ok(false);
            }
        }

        // Strip the stamps so play re-assigns them.
        let mut fresh = idoc.clone();
        fresh.remove(ID);
        fresh.remove(PROCESSED);
        fresh.remove(PROCESSED_ID);
        fresh.remove(REV);

        debug!(id = ?idoc.id(), "replaying input");
        pipeline.play(fresh, None).await?;
        Ok(true)
    }
}
