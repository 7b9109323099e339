//! Durable logging of inputs, outputs, and errors.
//!
//! Each store is optional; logging against a disabled store is a no-op.
//! Semantics per document kind:
//!
//! - inputs: idempotent — a 409 means a previous attempt already logged the
//!   input (replays hit this) and is treated as success
//! - outputs: conditional — the carried revision updates the accumulator in
//!   place, conflicts propagate so the batch retries
//! - errors: written once — an existing error document at the id is never
//!   overwritten

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::doc::{Doc, CAUSE, ERROR, ID, INPUT_ID, REASON};
use crate::error::{Error, Result};
use crate::store::DocStore;

/// Persists pipeline documents to the configured stores.
#[derive(Clone)]
pub struct Logger {
    input_store: Option<Arc<dyn DocStore>>,
    output_store: Option<Arc<dyn DocStore>>,
    error_store: Option<Arc<dyn DocStore>>,
}

impl Logger {
    /// Creates a logger over the configured stores.
    #[must_use]
    pub fn new(
        input_store: Option<Arc<dyn DocStore>>,
        output_store: Option<Arc<dyn DocStore>>,
        error_store: Option<Arc<dyn DocStore>>,
    ) -> Self {
        Self {
            input_store,
            output_store,
            error_store,
        }
    }

    /// Logs an input document. Idempotent: a conflict means the input was
    /// already logged and counts as success.
    pub async fn log_input(&self, idoc: &Doc) -> Result<()> {
        let Some(store) = &self.input_store else {
            return Ok(());
        };
        match store.put(idoc).await {
            Ok(_) | Err(Error::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Logs one output document, inserting or updating by its carried
    /// revision. Conflicts propagate.
    pub async fn log_output(&self, odoc: &Doc) -> Result<()> {
        let Some(store) = &self.output_store else {
            return Ok(());
        };
        store.put(odoc).await?;
        Ok(())
    }

    /// Logs a batch of outputs: deduplicates by id keeping the last
    /// occurrence, then writes in reverse chronological order.
    pub async fn log_outputs(&self, odocs: &[Doc]) -> Result<()> {
        if self.output_store.is_none() {
            return Ok(());
        }

        // Keep only the last occurrence per id; later entries supersede
        // earlier ones within a batch.
        let mut deduped: Vec<Doc> = Vec::new();
        for odoc in odocs {
            if let Some(existing) = deduped.iter_mut().find(|d| d.id() == odoc.id()) {
                *existing = odoc.clone();
            } else {
                deduped.push(odoc.clone());
            }
        }
        deduped.sort_by(|a, b| {
            b.processed()
                .cmp(&a.processed())
                .then_with(|| b.id().cmp(&a.id()))
        });

        for odoc in &deduped {
            self.log_output(odoc).await?;
        }
        Ok(())
    }

    /// Logs an error document once. An existing document at the id is left
    /// untouched; a racing write that conflicts also counts as logged.
    pub async fn log_error(&self, edoc: &Doc) -> Result<()> {
        let Some(store) = &self.error_store else {
            return Ok(());
        };
        let Some(id) = edoc.id() else {
            return Err(Error::InvalidInput("error document has no id".into()));
        };
        if store.get(id).await?.is_some() {
            debug!(id, "error already logged");
            return Ok(());
        }
        match store.put(edoc).await {
            Ok(_) | Err(Error::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Builds an error document from the failed input and the error.
///
/// The input's payload is carried over; its original id is preserved in
/// `input_id` before `id` is overwritten with the error identifier.
#[must_use]
pub fn build_error_doc(idoc: &Doc, error_id: &str, error: &Error) -> Doc {
    let mut edoc = idoc.clone();
    if let Some(original) = idoc.id() {
        let original = original.to_string();
        edoc.set(INPUT_ID, Value::String(original));
    }
    edoc.set_id(error_id);
    edoc.remove(crate::doc::REV);

    match error {
        Error::Marked { error, reason } => {
            edoc.set(ERROR, error.clone());
            if let Some(reason) = reason {
                edoc.set(REASON, reason.clone());
            }
        }
        Error::Sink { reasons } => {
            edoc.set(ERROR, Value::String("esink".into()));
            edoc.set(REASON, Value::Array(reasons.clone()));
        }
        other => {
            edoc.set(ERROR, Value::String(other.label().into()));
            edoc.set(REASON, Value::String(other.to_string()));
            if let Error::Storage {
                source: Some(source),
                ..
            } = other
            {
                edoc.set(CAUSE, Value::String(source.to_string()));
            }
        }
    }
    debug_assert!(edoc.get(ID).is_some());
    edoc
}
