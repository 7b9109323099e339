//! Schemaless document model.
//!
//! Input, output, and error documents are JSON objects with a handful of
//! reserved fields the engine stamps and reads:
//!
//! - `id` — the composite `tkuri`/`kturi` identifier
//! - `rev` — the store's revision token (never sent to the sink)
//! - `processed` — numeric processing time in milliseconds
//! - `processed_id` — zero-padded processing time, orders within a batch
//! - `<inputType>_id` — an output's back-reference to its input
//! - `error` / `reason` / `cause` — failure marks on error documents
//!
//! Everything else is opaque payload owned by the reducer and the key/time
//! callback functions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Reserved field: document identifier.
pub const ID: &str = "id";
/// Reserved field: store revision token.
pub const REV: &str = "rev";
/// Reserved field: numeric processing time (ms).
pub const PROCESSED: &str = "processed";
/// Reserved field: padded processing time.
pub const PROCESSED_ID: &str = "processed_id";
/// Reserved field: failure mark on error documents.
pub const ERROR: &str = "error";
/// Reserved field: failure detail on error documents.
pub const REASON: &str = "reason";
/// Reserved field: nested cause on error documents.
pub const CAUSE: &str = "cause";
/// Reserved field: the original input id preserved on error documents.
pub const INPUT_ID: &str = "input_id";

/// A schemaless JSON document.
///
/// The wire form is the bare JSON object; `Doc` only adds typed access to
/// the reserved fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Doc(Map<String, Value>);

impl Doc {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] when the value is not an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Serialization {
                message: format!("expected a JSON object, got {other}"),
            }),
        }
    }

    /// Returns the document as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Consumes the document into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Reads a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a field, returning the document for chaining.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
        self.0.insert(field.into(), value);
        self
    }

    /// Removes a field, returning its prior value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// The document identifier, when stamped.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID).and_then(Value::as_str)
    }

    /// The store revision token, when present.
    #[must_use]
    pub fn rev(&self) -> Option<&str> {
        self.0.get(REV).and_then(Value::as_str)
    }

    /// The numeric processing time, when stamped.
    #[must_use]
    pub fn processed(&self) -> Option<i64> {
        self.0.get(PROCESSED).and_then(Value::as_i64)
    }

    /// The padded processing time, when stamped.
    #[must_use]
    pub fn processed_id(&self) -> Option<&str> {
        self.0.get(PROCESSED_ID).and_then(Value::as_str)
    }

    /// The `error` mark, when the reducer flagged this document.
    #[must_use]
    pub fn error(&self) -> Option<&Value> {
        self.0.get(ERROR)
    }

    /// Sets the document identifier.
    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.set(ID, Value::String(id.into()))
    }

    /// Sets the store revision token.
    pub fn set_rev(&mut self, rev: impl Into<String>) -> &mut Self {
        self.set(REV, Value::String(rev.into()))
    }

    /// Stamps the processing time fields.
    pub fn set_processed(&mut self, time_ms: i64) -> &mut Self {
        self.set(PROCESSED, Value::from(time_ms));
        self.set(PROCESSED_ID, Value::String(tally_core::id::pad16(time_ms)))
    }

    /// Returns a copy without the revision token, the wire form sent to
    /// the sink.
    #[must_use]
    pub fn without_rev(&self) -> Self {
        let mut copy = self.clone();
        copy.remove(REV);
        copy
    }

    /// Approximate serialized size in bytes, used by the batching window.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }
}

impl From<Map<String, Value>> for Doc {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_field_accessors() {
        let mut doc = Doc::from_value(json!({"usage": 1, "org": "o1"})).unwrap();
        doc.set_id("t/0001700000000000/k/o1");
        doc.set_rev("3");
        doc.set_processed(1_700_000_000_000);

        assert_eq!(doc.id(), Some("t/0001700000000000/k/o1"));
        assert_eq!(doc.rev(), Some("3"));
        assert_eq!(doc.processed(), Some(1_700_000_000_000));
        assert_eq!(doc.processed_id(), Some("0001700000000000"));
        assert_eq!(doc.get("usage"), Some(&json!(1)));
    }

    #[test]
    fn without_rev_strips_only_the_revision() {
        let mut doc = Doc::from_value(json!({"total": 3})).unwrap();
        doc.set_id("k/o1/t/0001700000000000").set_rev("2");

        let wire = doc.without_rev();
        assert_eq!(wire.rev(), None);
        assert_eq!(wire.id(), Some("k/o1/t/0001700000000000"));
        assert_eq!(wire.get("total"), Some(&json!(3)));
        // The original keeps its revision.
        assert_eq!(doc.rev(), Some("2"));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(Doc::from_value(json!([1, 2])).is_err());
        assert!(Doc::from_value(json!("doc")).is_err());
    }

    #[test]
    fn wire_form_is_the_bare_object() {
        let doc = Doc::from_value(json!({"usage": 1})).unwrap();
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"usage":1}"#);
    }
}
