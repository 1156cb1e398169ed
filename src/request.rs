//! Incoming HTTP request type.
//!
//! A [`Request`] is a cheap, cloneable handle. Every handler in a chain gets
//! its own clone; they all observe the same underlying request. The resolved
//! route and its params are installed exactly once, after resolution and
//! before the route chain starts, and are read-only from then on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use tracing::Span;

use crate::router::RouteHandle;

/// Path parameters produced by route resolution.
pub type Params = HashMap<String, String>;

/// Time spent inside one handler.
#[derive(Clone, Debug)]
pub struct HandlerTiming {
    pub handler: Arc<str>,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    started: Instant,
    span: Span,
    route: OnceLock<RouteHandle>,
    params: OnceLock<Params>,
    timers: Mutex<Vec<HandlerTiming>>,
}

impl Request {
    pub(crate) fn new(id: u64, req: http::Request<Bytes>, span: Span) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            inner: Arc::new(Inner {
                id,
                method: parts.method,
                uri: parts.uri,
                version: parts.version,
                headers: parts.headers,
                body,
                started: Instant::now(),
                span,
                route: OnceLock::new(),
                params: OnceLock::new(),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Server-assigned, monotonically increasing id.
    pub fn id(&self) -> u64 { self.inner.id }
    pub fn method(&self) -> &Method { &self.inner.method }
    pub fn uri(&self) -> &Uri { &self.inner.uri }
    pub fn version(&self) -> Version { self.inner.version }
    pub fn headers(&self) -> &HeaderMap { &self.inner.headers }
    pub fn body(&self) -> &Bytes { &self.inner.body }

    /// The request path. `OPTIONS *` yields `"*"`.
    pub fn path(&self) -> &str { self.inner.uri.path() }

    pub fn query(&self) -> Option<&str> { self.inner.uri.query() }

    /// The request target exactly as received: path plus query.
    pub fn href(&self) -> &str {
        self.inner
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.inner.uri.path())
    }

    /// Case-insensitive header lookup. Non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Looks up a single query-string parameter. No percent-decoding.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query()?
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// The version the client asked for via `accept-version` or `x-api-version`.
    pub fn accept_version(&self) -> Option<&str> {
        self.header("accept-version").or_else(|| self.header("x-api-version"))
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/:id`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.inner.params.get()?.get(key).map(String::as_str)
    }

    /// All params. Empty until the request has been resolved to a route.
    pub fn params(&self) -> &Params {
        static EMPTY: OnceLock<Params> = OnceLock::new();
        self.inner.params.get().unwrap_or_else(|| EMPTY.get_or_init(Params::new))
    }

    /// The resolved route, if resolution has happened and matched.
    pub fn route(&self) -> Option<&RouteHandle> { self.inner.route.get() }

    pub fn start_time(&self) -> Instant { self.inner.started }
    pub fn elapsed(&self) -> Duration { self.inner.started.elapsed() }

    /// The per-request logging span.
    pub fn span(&self) -> &Span { &self.inner.span }

    /// Time spent in each handler that has finished so far, in run order.
    pub fn timers(&self) -> Vec<HandlerTiming> {
        self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn install(&self, route: RouteHandle, params: Params) {
        // A jump to another route keeps the first resolution.
        let _ = self.inner.route.set(route);
        let _ = self.inner.params.set(params);
    }

    pub(crate) fn record_timing(&self, handler: Arc<str>, elapsed: Duration) {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HandlerTiming { handler, elapsed });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        let req = http::Request::builder()
            .method("GET")
            .uri(uri)
            .header("Accept-Version", "2.0.0")
            .body(Bytes::new())
            .unwrap();
        Request::new(7, req, Span::none())
    }

    #[test]
    fn accessors() {
        let req = request("/users/42?callback=cb&flag");
        assert_eq!(req.id(), 7);
        assert_eq!(req.path(), "/users/42");
        assert_eq!(req.href(), "/users/42?callback=cb&flag");
        assert_eq!(req.query_param("callback"), Some("cb"));
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.accept_version(), Some("2.0.0"));
    }

    #[test]
    fn params_install_once() {
        let req = request("/users/42");
        assert!(req.params().is_empty());
        assert_eq!(req.param("id"), None);

        let mut params = Params::new();
        params.insert("id".into(), "42".into());
        req.install(RouteHandle::new("getusersid"), params);
        req.install(RouteHandle::new("other"), Params::new());

        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.route().map(RouteHandle::name), Some("getusersid"));
    }
}
