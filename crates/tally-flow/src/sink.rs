//! Sink routing and fan-out.
//!
//! Finalized output documents are POSTed to a downstream sink service. The
//! sink deployment may itself be partitioned into `P` instances; the router
//! derives one deterministic target per output identifier by forwarding the
//! id's `(key, time)` over `P` shards and rewriting the host:
//!
//! - explicit port: `port := port + p`
//! - otherwise: leftmost hostname label gets a `-p` suffix
//!
//! The poster attaches an `Authorization` header when an [`AuthProvider`]
//! is configured, posts a call's outputs in parallel, retries transport
//! failures and 5xx responses up to the configured count, and classifies
//! responses:
//!
//! - `201` — success
//! - `409` with `body.error == "slack"` — failure: the sink rejected the
//!   duplicate outside its dedupe window, so the effect may be lost
//! - `409` without a duplicate filter in this engine — failure
//! - `409` otherwise — success (benign duplicate)
//! - anything else — failure, recorded as `{id, status, ...body}`
//!
//! Transports follow the backend-agnostic pattern: [`HttpSink`] for
//! production, [`MemorySink`] for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use tally_core::id::{key_of, time_of};
use tally_core::partition::{Op, Partitioner};

use crate::doc::Doc;
use crate::error::{Error, Result};

/// Supplies the `Authorization` header value for sink posts.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns the full header value (e.g. `Bearer <token>`).
    async fn authorization(&self) -> Result<String>;
}

/// An auth provider with a fixed header value.
pub struct StaticToken(String);

impl StaticToken {
    /// Creates a provider that always returns the given header value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

#[async_trait]
impl AuthProvider for StaticToken {
    async fn authorization(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// A sink response: HTTP status plus the parsed JSON body, when any.
#[derive(Debug, Clone)]
pub struct SinkResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body, when the sink returned one.
    pub body: Option<Value>,
}

impl SinkResponse {
    /// A bare status with no body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self { status, body: None }
    }

    /// A status with a JSON body.
    #[must_use]
    pub fn with_body(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }
}

/// Transport for delivering output documents to the sink.
#[async_trait]
pub trait SinkTransport: Send + Sync {
    /// POSTs a JSON body, returning the sink's response.
    async fn post(
        &self,
        url: &str,
        body: &Value,
        authorization: Option<&str>,
    ) -> Result<SinkResponse>;
}

/// HTTP transport over reqwest.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    /// Creates the transport with a 30 second request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] when the client cannot be constructed.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http {
                message: format!("building sink client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SinkTransport for HttpSink {
    async fn post(
        &self,
        url: &str,
        body: &Value,
        authorization: Option<&str>,
    ) -> Result<SinkResponse> {
        let mut request = self.client.post(url).json(body);
        if let Some(value) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, value);
        }
        let response = request.send().await.map_err(|e| Error::Http {
            message: format!("posting to {url}: {e}"),
        })?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.ok();
        Ok(SinkResponse { status, body })
    }
}

/// In-memory transport for tests: records posts, plays scripted responses.
#[derive(Default)]
pub struct MemorySink {
    posts: Mutex<Vec<(String, Value)>>,
    responses: Mutex<VecDeque<SinkResponse>>,
}

impl MemorySink {
    /// Creates a transport that answers `201` until scripted otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response to play for the next post.
    pub fn respond_with(&self, response: SinkResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Returns all recorded posts as `(url, body)` pairs.
    #[must_use]
    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SinkTransport for MemorySink {
    async fn post(
        &self,
        url: &str,
        body: &Value,
        _authorization: Option<&str>,
    ) -> Result<SinkResponse> {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_string(), body.clone()));
        let scripted = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(scripted.unwrap_or_else(|| SinkResponse::status(201)))
    }
}

/// Computes the sink target URL for an output identifier.
///
/// With `apps <= 1` the host is returned unchanged.
///
/// # Errors
///
/// Returns an error when the host does not parse as a URL or the id has no
/// key/time components.
pub fn route_sink(id: &str, host: &str, apps: u32) -> Result<String> {
    if apps <= 1 {
        return Ok(host.to_string());
    }

    let key = key_of(id)?;
    let time = time_of(id)?;
    let p = Partitioner::forward(apps)
        .route(&key, time, Op::Write)?
        .partition;

    let mut url = Url::parse(host)
        .map_err(|e| Error::InvalidInput(format!("sink host '{host}': {e}")))?;

    if let Some(port) = url.port() {
        let shifted = port
            .checked_add(u16::try_from(p).unwrap_or(u16::MAX))
            .ok_or_else(|| Error::InvalidInput(format!("sink port {port}+{p} overflows")))?;
        url.set_port(Some(shifted))
            .map_err(|()| Error::InvalidInput(format!("sink host '{host}' rejects a port")))?;
    } else {
        let hostname = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("sink host '{host}' has no hostname")))?;
        let rewritten = match hostname.split_once('.') {
            Some((label, rest)) => format!("{label}-{p}.{rest}"),
            None => format!("{hostname}-{p}"),
        };
        url.set_host(Some(&rewritten))
            .map_err(|e| Error::InvalidInput(format!("sink host '{rewritten}': {e}")))?;
    }

    Ok(url.to_string().trim_end_matches('/').to_string())
}

/// How a single post turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Effect is durable at the sink.
    Success,
    /// Terminal failure; retrying will not help.
    Fail,
    /// Transient failure worth retrying.
    Retry,
}

/// Classifies a sink response.
fn classify(status: u16, body: Option<&Value>, dedupe_enabled: bool) -> Disposition {
    match status {
        201 => Disposition::Success,
        409 => {
            let slack = body
                .and_then(|b| b.get("error"))
                .and_then(Value::as_str)
                .is_some_and(|e| e == "slack");
            if slack || !dedupe_enabled {
                Disposition::Fail
            } else {
                Disposition::Success
            }
        }
        500..=599 => Disposition::Retry,
        _ => Disposition::Fail,
    }
}

/// Builds the `{id, status, ...body}` failure record for one post.
fn failure_reason(id: &str, status: u16, body: Option<&Value>) -> Value {
    let mut reason = match body {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("body".into(), other.clone());
            map
        }
        None => Map::new(),
    };
    reason.insert("id".into(), Value::String(id.to_string()));
    reason.insert("status".into(), Value::from(status));
    Value::Object(reason)
}

/// Posts finalized outputs to the sink.
pub struct SinkPoster {
    transport: Arc<dyn SinkTransport>,
    host: String,
    apps: u32,
    posts: Vec<String>,
    retries: u32,
    auth: Option<Arc<dyn AuthProvider>>,
    dedupe_enabled: bool,
}

impl SinkPoster {
    /// Creates a poster for a sink deployment.
    #[must_use]
    pub fn new(
        transport: Arc<dyn SinkTransport>,
        host: impl Into<String>,
        apps: u32,
        posts: Vec<String>,
        retries: u32,
        auth: Option<Arc<dyn AuthProvider>>,
        dedupe_enabled: bool,
    ) -> Self {
        Self {
            transport,
            host: host.into(),
            apps,
            posts,
            retries: retries.max(1),
            auth,
            dedupe_enabled,
        }
    }

    /// Posts one call's outputs in parallel.
    ///
    /// `route_ids` carries the per-slot routing identity (the sink key and
    /// time encoded as an output id).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sink`] with the collected failure reasons when any
    /// post fails.
    pub async fn post_outputs(&self, odocs: &[Doc], route_ids: &[String]) -> Result<()> {
        let posts = odocs.iter().enumerate().map(|(slot, odoc)| {
            let route_id = route_ids
                .get(slot)
                .map_or_else(|| odoc.id().unwrap_or_default().to_string(), Clone::clone);
            self.post_one(slot, odoc, route_id)
        });

        let reasons: Vec<Value> = join_all(posts)
            .await
            .into_iter()
            .filter_map(std::result::Result::err)
            .collect();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Error::Sink { reasons })
        }
    }

    /// Posts a single output, retrying transient failures. Returns the
    /// failure reason on terminal failure.
    async fn post_one(
        &self,
        slot: usize,
        odoc: &Doc,
        route_id: String,
    ) -> std::result::Result<(), Value> {
        let id = odoc.id().unwrap_or_default().to_string();
        let path = self
            .posts
            .get(slot)
            .or_else(|| self.posts.last())
            .map(String::as_str)
            .unwrap_or_default();

        let target = match route_sink(&route_id, &self.host, self.apps) {
            Ok(host) => format!("{}{path}", host.trim_end_matches('/')),
            Err(e) => return Err(failure_reason(&id, 0, Some(&Value::String(e.to_string())))),
        };
        let body = odoc.without_rev().into_value();

        let mut last_reason = None;
        for attempt in 1..=self.retries {
            let authorization = match &self.auth {
                Some(provider) => match provider.authorization().await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        return Err(failure_reason(
                            &id,
                            401,
                            Some(&Value::String(e.to_string())),
                        ));
                    }
                },
                None => None,
            };

            match self
                .transport
                .post(&target, &body, authorization.as_deref())
                .await
            {
                Ok(response) => {
                    match classify(response.status, response.body.as_ref(), self.dedupe_enabled) {
                        Disposition::Success => {
                            debug!(id = %id, target = %target, status = response.status, "sink accepted output");
                            return Ok(());
                        }
                        Disposition::Fail => {
                            return Err(failure_reason(
                                &id,
                                response.status,
                                response.body.as_ref(),
                            ));
                        }
                        Disposition::Retry => {
                            warn!(id = %id, target = %target, status = response.status, attempt, "sink post failed");
                            last_reason = Some(failure_reason(
                                &id,
                                response.status,
                                response.body.as_ref(),
                            ));
                        }
                    }
                }
                Err(e) => {
                    warn!(id = %id, target = %target, attempt, error = %e, "sink post errored");
                    last_reason =
                        Some(failure_reason(&id, 502, Some(&Value::String(e.to_string()))));
                }
            }
        }
        Err(last_reason.unwrap_or_else(|| failure_reason(&id, 502, None)))
    }
}
