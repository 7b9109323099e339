//! Pipeline configuration.
//!
//! Two layers of configuration:
//!
//! - [`Config`] — deployment settings loaded once from the environment and
//!   threaded through construction (no process-wide mutable state)
//! - [`PipelineConfig`] — the application's wiring: document types, store
//!   names, the key/time/group functions, the reducer, and the sink
//!   description, all supplied as explicit fields and callbacks

use std::sync::Arc;

use serde_json::Value;

use crate::doc::Doc;
use crate::error::{Error, Result};
use crate::sink::AuthProvider;

/// Derives a document's key from its payload and the caller's auth context.
pub type KeyFn = Arc<dyn Fn(&Doc, Option<&Value>) -> String + Send + Sync>;

/// Derives a document's time in milliseconds.
pub type TimeFn = Arc<dyn Fn(&Doc) -> i64 + Send + Sync>;

/// Derives a document's group identifiers.
pub type GroupsFn = Arc<dyn Fn(&Doc) -> Vec<String> + Send + Sync>;

/// Derives the output keys of an input, one per output slot.
pub type KeysFn = Arc<dyn Fn(&Doc) -> Vec<String> + Send + Sync>;

/// Derives the output times of an input, one per output slot.
pub type TimesFn = Arc<dyn Fn(&Doc) -> Vec<i64> + Send + Sync>;

/// The user reducer: folds an input document over the previous accumulated
/// outputs (one JSON value per output slot, `Null` when the slot has no
/// accumulator yet) and returns the new outputs, aligned with the slots.
pub type ReducerFn =
    Arc<dyn Fn(&[Value], &Doc) -> std::result::Result<Vec<Value>, Error> + Send + Sync>;

/// Deployment configuration, loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store connection URI.
    pub db_uri: String,
    /// Output store partition count.
    pub db_partitions: u32,
    /// Sink instance count.
    pub sink_apps: u32,
    /// Sink POST attempt count.
    pub sink_retries: u32,
    /// Input store name; `None` disables input logging.
    pub input_db: Option<String>,
    /// Output store name; `None` disables output logging.
    pub output_db: Option<String>,
    /// Error store name; `None` disables error logging.
    pub error_db: Option<String>,
    /// Replay window in milliseconds; 0 disables replay.
    pub replay_window_ms: i64,
    /// Replay page size.
    pub page_size: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `DB_URI` — required; store connection
    /// - `DB_PARTITIONS` — output partition count (default 1)
    /// - `SINK_APPS` — sink partition count (default 1)
    /// - `SINK_RETRIES` — sink POST retry count (default 5)
    /// - `INPUT_DB`, `OUTPUT_DB`, `ERROR_DB` — store names; `false` or an
    ///   empty value disables that store
    /// - `REPLAY` — replay window in ms; unset/0 disables replay
    /// - `PAGE_SIZE` — replay page size (default 200)
    ///
    /// # Errors
    ///
    /// Returns an error when `DB_URI` is absent or any variable is present
    /// but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let db_uri = env_string("DB_URI")
            .ok_or_else(|| Error::MissingConfig("Missing DB configuration".into()))?;

        Ok(Self {
            db_uri,
            db_partitions: env_u32("DB_PARTITIONS")?.unwrap_or(1),
            sink_apps: env_u32("SINK_APPS")?.unwrap_or(1),
            sink_retries: env_u32("SINK_RETRIES")?.unwrap_or(5),
            input_db: store_name("INPUT_DB", "inputs"),
            output_db: store_name("OUTPUT_DB", "outputs"),
            error_db: store_name("ERROR_DB", "errors"),
            replay_window_ms: env_i64("REPLAY")?.unwrap_or(0),
            page_size: env_usize("PAGE_SIZE")?.unwrap_or(200),
        })
    }

    /// A config with the given store URI and all defaults.
    #[must_use]
    pub fn with_db_uri(db_uri: impl Into<String>) -> Self {
        Self {
            db_uri: db_uri.into(),
            db_partitions: 1,
            sink_apps: 1,
            sink_retries: 5,
            input_db: Some("inputs".into()),
            output_db: Some("outputs".into()),
            error_db: Some("errors".into()),
            replay_window_ms: 0,
            page_size: 200,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Reads a store name: unset falls back to the default, `false`/empty
/// disables the store.
fn store_name(name: &str, default: &str) -> Option<String> {
    match std::env::var(name) {
        Err(_) => Some(default.to_string()),
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
    }
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn env_i64(name: &str) -> Result<Option<i64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<i64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be an i64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

/// Input-side wiring: how to key, time, and group incoming documents.
#[derive(Clone)]
pub struct InputConfig {
    /// The input document type (e.g. `usage`); names the back-reference
    /// field `<type>_id` on outputs.
    pub doc_type: String,
    /// Derives the input key from payload and auth.
    pub key: KeyFn,
    /// Derives the input time.
    pub time: TimeFn,
    /// Derives the group identifiers; inputs in one group reduce serially.
    pub groups: GroupsFn,
    /// Enables the in-memory duplicate filter.
    pub dedupe: bool,
}

/// Output-side wiring: how to key and time reduced outputs.
#[derive(Clone)]
pub struct OutputConfig {
    /// The output document type.
    pub doc_type: String,
    /// Derives the output keys, one per slot.
    pub keys: KeysFn,
    /// Derives the output times, one per slot.
    pub times: TimesFn,
}

/// Sink wiring: where finalized outputs are POSTed.
#[derive(Clone)]
pub struct SinkConfig {
    /// Sink host URL; `None` disables sink fan-out.
    pub host: Option<String>,
    /// POST paths, aligned with output slots.
    pub posts: Vec<String>,
    /// Routing keys for sink partitioning; defaults to the output keys.
    pub keys: Option<KeysFn>,
    /// Routing times for sink partitioning; defaults to the output times.
    pub times: Option<TimesFn>,
    /// Supplies the `Authorization` header for posts.
    pub authentication: Option<Arc<dyn AuthProvider>>,
}

impl SinkConfig {
    /// A disabled sink.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            host: None,
            posts: Vec::new(),
            keys: None,
            times: None,
            authentication: None,
        }
    }
}

/// Error-store wiring.
#[derive(Clone, Default)]
pub struct ErrorConfig {
    /// Derives the error key; defaults to the input key function.
    pub key: Option<KeyFn>,
    /// Derives the error time; defaults to the input time function.
    pub time: Option<TimeFn>,
}

/// The application wiring for one pipeline.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Input wiring.
    pub input: InputConfig,
    /// Output wiring.
    pub output: OutputConfig,
    /// Sink wiring.
    pub sink: SinkConfig,
    /// Error wiring.
    pub error: ErrorConfig,
    /// The user reducer.
    pub reducer: ReducerFn,
}

impl PipelineConfig {
    /// Sets the sink host.
    #[must_use]
    pub fn with_sink_host(mut self, host: impl Into<String>) -> Self {
        self.sink.host = Some(host.into());
        self
    }

    /// Sets the sink auth provider.
    #[must_use]
    pub fn with_authentication(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.sink.authentication = Some(auth);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var readers are exercised against the process environment, so
    // keep each test on its own variable names.

    #[test]
    fn missing_db_uri_fails_construction() {
        std::env::remove_var("DB_URI");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("Missing DB configuration"));
    }

    #[test]
    fn store_name_disables_on_false_or_empty() {
        std::env::set_var("TEST_STORE_A", "false");
        assert_eq!(store_name("TEST_STORE_A", "inputs"), None);

        std::env::set_var("TEST_STORE_B", "");
        assert_eq!(store_name("TEST_STORE_B", "inputs"), None);

        std::env::set_var("TEST_STORE_C", "usage-inputs");
        assert_eq!(
            store_name("TEST_STORE_C", "inputs"),
            Some("usage-inputs".into())
        );

        assert_eq!(
            store_name("TEST_STORE_UNSET", "inputs"),
            Some("inputs".into())
        );
    }

    #[test]
    fn numeric_vars_parse_strictly() {
        std::env::set_var("TEST_NUM_A", "42");
        assert_eq!(env_u32("TEST_NUM_A").unwrap(), Some(42));

        std::env::set_var("TEST_NUM_B", "many");
        assert!(env_u32("TEST_NUM_B").is_err());
    }

    #[test]
    fn defaults_match_the_contract() {
        let config = Config::with_db_uri("http://store:5984");
        assert_eq!(config.db_partitions, 1);
        assert_eq!(config.sink_apps, 1);
        assert_eq!(config.sink_retries, 5);
        assert_eq!(config.page_size, 200);
        assert_eq!(config.replay_window_ms, 0);
    }
}
