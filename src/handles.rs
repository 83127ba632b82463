//! Lifetime-guarded handles exposed into script scope.
//!
//! Every object a script can hold a reference to wraps stream-owned data
//! behind a validity token issued by a [`HandleRegistry`]. When the owning
//! stream is destroyed the registry bumps its generation once; every
//! outstanding token goes stale together and all subsequent script access
//! fails with a descriptive error instead of reaching freed stream state.

use crate::coroutine::{HostPort, HostRequest, ResumeValue};
use crate::error::ScriptError;
use crate::upstream::{CallRequest, CallResult};
use bytes::Bytes;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Position};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Header/trailer table as exposed to scripts. Pseudo-headers such as
/// `:path` and `:status` are plain keys.
pub type HeaderTable = HashMap<String, String>;

/// A header table shared between the proxy, the driver, and script handles.
pub type SharedHeaders = Arc<Mutex<HeaderTable>>;

/// Wrap a header table for use in the filter pipeline
pub fn shared_headers(table: HeaderTable) -> SharedHeaders {
    Arc::new(Mutex::new(table))
}

/// Pseudo-headers an upstream call request must carry
const REQUIRED_CALL_HEADERS: [&str; 3] = [":method", ":path", ":authority"];

/// Centralized invalidation point for every handle a stream exposes.
///
/// `mark_dead` is a single constant-time generation bump; all guards issued
/// before it fail their next access check.
#[derive(Debug, Clone)]
pub struct HandleRegistry {
    current: Arc<AtomicU64>,
}

impl HandleRegistry {
    /// Create a live registry
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Issue a validity token tied to the current generation
    pub fn guard(&self) -> LifetimeGuard {
        LifetimeGuard {
            current: Arc::clone(&self.current),
            issued: self.current.load(Ordering::Acquire),
        }
    }

    /// Invalidate every outstanding guard in constant time
    pub fn mark_dead(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validity token carried by each script-facing handle
#[derive(Debug, Clone)]
pub struct LifetimeGuard {
    current: Arc<AtomicU64>,
    issued: u64,
}

impl LifetimeGuard {
    /// Whether the owning stream is still alive
    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.issued
    }

    /// Fail with a stale-handle error if the owning stream is gone
    pub fn ensure_live(&self, what: &'static str) -> Result<(), ScriptError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ScriptError::StaleHandle { what })
        }
    }

    /// Re-attach this guard to the registry's current generation.
    ///
    /// Used by the handle owner when it re-exposes a handle it still holds;
    /// stale copies already in script scope stay dead.
    pub fn refresh(&mut self) {
        self.issued = self.current.load(Ordering::Acquire);
    }
}

fn rhai_err(message: impl ToString) -> Box<EvalAltResult> {
    message.to_string().into()
}

/// Guard-checked view over a shared header or trailer table
#[derive(Debug, Clone)]
pub struct HeaderMapHandle {
    guard: LifetimeGuard,
    table: SharedHeaders,
    what: &'static str,
}

impl HeaderMapHandle {
    pub(crate) fn new(guard: LifetimeGuard, table: SharedHeaders, what: &'static str) -> Self {
        Self { guard, table, what }
    }

    fn with_table<R>(
        &self,
        f: impl FnOnce(&mut HeaderTable) -> R,
    ) -> Result<R, Box<EvalAltResult>> {
        self.guard.ensure_live(self.what).map_err(rhai_err)?;
        let mut table = self
            .table
            .lock()
            .map_err(|_| rhai_err(format!("{} table lock poisoned", self.what)))?;
        Ok(f(&mut table))
    }

    /// Get a header value; `()` when absent
    pub fn get(&mut self, name: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        self.with_table(|t| match t.get(name) {
            Some(value) => Dynamic::from(value.clone()),
            None => Dynamic::UNIT,
        })
    }

    /// Set a header value
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), Box<EvalAltResult>> {
        let name = name.to_string();
        let value = value.to_string();
        self.with_table(|t| {
            t.insert(name, value);
        })
    }

    /// Remove a header
    pub fn remove(&mut self, name: &str) -> Result<(), Box<EvalAltResult>> {
        self.with_table(|t| {
            t.remove(name);
        })
    }

    /// Whether a header is present
    pub fn contains(&mut self, name: &str) -> Result<bool, Box<EvalAltResult>> {
        self.with_table(|t| t.contains_key(name))
    }

    /// Snapshot the table as a script map
    pub fn to_map(&mut self) -> Result<Map, Box<EvalAltResult>> {
        self.with_table(|t| table_to_map(t))
    }
}

/// Guard-checked view over a fully buffered body
#[derive(Debug, Clone)]
pub struct BodyHandle {
    guard: LifetimeGuard,
    bytes: Bytes,
}

impl BodyHandle {
    pub(crate) fn new(guard: LifetimeGuard, bytes: Bytes) -> Self {
        Self { guard, bytes }
    }

    fn check(&self) -> Result<(), Box<EvalAltResult>> {
        self.guard.ensure_live("body").map_err(rhai_err)
    }

    /// Body length in bytes
    pub fn len(&mut self) -> Result<i64, Box<EvalAltResult>> {
        self.check()?;
        Ok(self.bytes.len() as i64)
    }

    /// Body as a (lossy) UTF-8 string
    pub fn text(&mut self) -> Result<String, Box<EvalAltResult>> {
        self.check()?;
        Ok(String::from_utf8_lossy(&self.bytes).into_owned())
    }

    /// Body as raw bytes
    pub fn bytes(&mut self) -> Result<rhai::Blob, Box<EvalAltResult>> {
        self.check()?;
        Ok(self.bytes.to_vec())
    }
}

/// Chunk-by-chunk body iterator; yields between chunks and never buffers
#[derive(Debug, Clone)]
pub struct BodyChunkStream {
    port: HostPort,
    done: bool,
}

impl Iterator for BodyChunkStream {
    type Item = Result<Dynamic, Box<EvalAltResult>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.port.call(HostRequest::NextBodyChunk) {
            Ok(ResumeValue::Chunk(Some(chunk))) => Some(Ok(Dynamic::from_blob(chunk))),
            Ok(ResumeValue::Chunk(None)) => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.done = true;
                Some(Err(rhai_err("unexpected resume value for body chunk")))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// The root object passed to a script entry function. The script interacts
/// with the stream entirely through this handle.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    port: HostPort,
    headers: HeaderMapHandle,
}

impl StreamHandle {
    pub(crate) fn new(port: HostPort, headers: HeaderMapHandle) -> Self {
        Self { port, headers }
    }

    /// Handle to the stream's headers
    pub fn headers(&mut self) -> HeaderMapHandle {
        self.headers.clone()
    }

    /// Full body, yielding until the stream ends; `()` when there is none.
    ///
    /// Requests that the host buffer the entire body.
    pub fn body(&mut self) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.port.call(HostRequest::GetBody)? {
            ResumeValue::Body(Some(handle)) => Ok(Dynamic::from(handle)),
            ResumeValue::Body(None) => Ok(Dynamic::UNIT),
            _ => Err(rhai_err("unexpected resume value for body")),
        }
    }

    /// Iterate body chunks in delivery order without buffering
    pub fn body_chunks(&mut self) -> BodyChunkStream {
        BodyChunkStream {
            port: self.port.clone(),
            done: false,
        }
    }

    /// Trailers, yielding until the host knows whether any will arrive;
    /// `()` when the stream ends without trailers
    pub fn trailers(&mut self) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.port.call(HostRequest::GetTrailers)? {
            ResumeValue::Trailers(Some(handle)) => Ok(Dynamic::from(handle)),
            ResumeValue::Trailers(None) => Ok(Dynamic::UNIT),
            _ => Err(rhai_err("unexpected resume value for trailers")),
        }
    }

    /// Log a message through the host logger.
    /// Levels: 0 trace, 1 debug, 2 info, 3 warn, 4+ error.
    pub fn log(&mut self, level: i64, message: &str) {
        match level {
            0 => trace!(script_log = message),
            1 => debug!(script_log = message),
            2 => info!(script_log = message),
            3 => warn!(script_log = message),
            _ => error!(script_log = message),
        }
    }

    /// Issue a side-channel HTTP call to a configured cluster.
    ///
    /// `headers` must define `:method`, `:path` and `:authority`. Returns a
    /// map with `headers`, `body` and `error` keys; on failure `error`
    /// carries the reason and `headers` is empty.
    pub fn http_call(
        &mut self,
        cluster: &str,
        headers: Map,
        body: Dynamic,
        timeout_ms: i64,
    ) -> Result<Map, Box<EvalAltResult>> {
        let headers = map_to_table(&headers)?;
        for required in REQUIRED_CALL_HEADERS {
            if !headers.contains_key(required) {
                return Err(rhai_err(format!(
                    "http_call headers must define {required}"
                )));
            }
        }
        if timeout_ms < 0 {
            return Err(rhai_err("http_call timeout must not be negative"));
        }
        let request = CallRequest {
            cluster: cluster.to_string(),
            headers,
            body: dynamic_to_body(body)?,
            timeout: Duration::from_millis(timeout_ms as u64),
        };

        match self.port.call(HostRequest::HttpCall(request))? {
            ResumeValue::Call(CallResult::Success { headers, body }) => {
                let mut result = Map::new();
                result.insert("headers".into(), Dynamic::from_map(table_to_map(&headers)));
                result.insert(
                    "body".into(),
                    match body {
                        Some(bytes) => {
                            Dynamic::from(String::from_utf8_lossy(&bytes).into_owned())
                        }
                        None => Dynamic::UNIT,
                    },
                );
                result.insert("error".into(), Dynamic::UNIT);
                Ok(result)
            }
            ResumeValue::Call(CallResult::Failure { reason }) => {
                let mut result = Map::new();
                result.insert("headers".into(), Dynamic::from_map(Map::new()));
                result.insert("body".into(), Dynamic::UNIT);
                result.insert("error".into(), Dynamic::from(reason));
                Ok(result)
            }
            _ => Err(rhai_err("unexpected resume value for http_call")),
        }
    }

    /// Send an immediate response and stop the script. `headers` must
    /// define `:status`. No script code runs after this call.
    pub fn respond(&mut self, headers: Map, body: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let headers = map_to_table(&headers)?;
        let status = headers
            .get(":status")
            .ok_or_else(|| rhai_err("respond() headers must define :status"))?;
        if status.parse::<u16>().is_err() {
            return Err(rhai_err(format!("respond() :status is not valid: {status}")));
        }
        let body = dynamic_to_body(body)?.map(Bytes::from);

        match self.port.call(HostRequest::Respond { headers, body })? {
            // Terminate cleanly: the host has taken over the response.
            ResumeValue::Responded => Err(Box::new(EvalAltResult::ErrorTerminated(
                Dynamic::UNIT,
                Position::NONE,
            ))),
            _ => Err(rhai_err("unexpected resume value for respond")),
        }
    }
}

/// Convert a script map into a header table; values must be strings
pub(crate) fn map_to_table(map: &Map) -> Result<HeaderTable, Box<EvalAltResult>> {
    let mut table = HeaderTable::with_capacity(map.len());
    for (key, value) in map {
        let value = value.clone().into_immutable_string().map_err(|actual| {
            rhai_err(format!(
                "malformed header table: value for '{key}' must be a string, got {actual}"
            ))
        })?;
        table.insert(key.to_string(), value.into());
    }
    Ok(table)
}

/// Convert a header table into a script map
pub(crate) fn table_to_map(table: &HeaderTable) -> Map {
    table
        .iter()
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect()
}

fn dynamic_to_body(value: Dynamic) -> Result<Option<Vec<u8>>, Box<EvalAltResult>> {
    if value.is_unit() {
        return Ok(None);
    }
    match value.clone().into_immutable_string() {
        Ok(s) => Ok(Some(s.as_bytes().to_vec())),
        Err(_) => value
            .into_blob()
            .map(Some)
            .map_err(|actual| rhai_err(format!("body must be a string, blob, or (): got {actual}"))),
    }
}

/// Register the stream handle types and their methods on an engine
pub(crate) fn register_stream_types(engine: &mut Engine) {
    engine
        .register_type_with_name::<StreamHandle>("StreamHandle")
        .register_fn("headers", StreamHandle::headers)
        .register_fn("body", StreamHandle::body)
        .register_fn("body_chunks", StreamHandle::body_chunks)
        .register_fn("trailers", StreamHandle::trailers)
        .register_fn("log", StreamHandle::log)
        .register_fn("http_call", StreamHandle::http_call)
        .register_fn(
            "http_call",
            |h: &mut StreamHandle, cluster: &str, headers: Map, timeout_ms: i64| {
                h.http_call(cluster, headers, Dynamic::UNIT, timeout_ms)
            },
        )
        .register_fn("respond", StreamHandle::respond)
        .register_fn("respond", |h: &mut StreamHandle, headers: Map| {
            h.respond(headers, Dynamic::UNIT)
        });

    engine
        .register_type_with_name::<HeaderMapHandle>("HeaderMapHandle")
        .register_fn("get", HeaderMapHandle::get)
        .register_fn("set", HeaderMapHandle::set)
        .register_fn("remove", HeaderMapHandle::remove)
        .register_fn("contains", HeaderMapHandle::contains)
        .register_fn("to_map", HeaderMapHandle::to_map)
        .register_indexer_get(HeaderMapHandle::get)
        .register_indexer_set(HeaderMapHandle::set);

    engine
        .register_type_with_name::<BodyHandle>("BodyHandle")
        .register_fn("len", BodyHandle::len)
        .register_fn("text", BodyHandle::text)
        .register_fn("bytes", BodyHandle::bytes);

    engine
        .register_type_with_name::<BodyChunkStream>("BodyChunkStream")
        .register_iterator_result::<BodyChunkStream, Dynamic>();
}
