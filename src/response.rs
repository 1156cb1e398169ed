//! Outgoing HTTP response handle.
//!
//! Like [`Request`], a [`Response`] is a cloneable handle shared by every
//! handler in the chain. Handlers set a status and headers, then call one of
//! the `send*` methods exactly once. The body is serialized by the formatter
//! that wins content negotiation against the request `Accept` header.
//!
//! ```rust,ignore
//! async fn get_user(req: Request, res: Response, next: Next) {
//!     let id = req.param("id").unwrap_or("unknown");
//!     res.send(serde_json::json!({ "id": id }));
//!     next.proceed();
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use tracing::{debug, warn};

use crate::error::HttpError;
use crate::formatter::{Formatter, Formatters};
use crate::request::Request;

// ── Body ─────────────────────────────────────────────────────────────────────

/// A response payload before serialization.
#[derive(Clone, Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl From<()> for Body {
    fn from(_: ()) -> Self { Self::Empty }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Body {
    fn from(s: String) -> Self { Self::Text(s) }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self { Self::Bytes(b) }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self { Self::Bytes(b.into()) }
}

impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self { Self::Json(v) }
}

// ── Response ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Response {
    req: Request,
    formatters: Arc<Formatters>,
    state: Arc<Mutex<State>>,
}

struct State {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    sent: bool,
}

impl Response {
    pub(crate) fn new(req: Request, formatters: Arc<Formatters>) -> Self {
        Self {
            req,
            formatters,
            state: Arc::new(Mutex::new(State {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                sent: false,
            })),
        }
    }

    /// Sets the status used by the next [`send`](Self::send).
    pub fn status(&self, code: StatusCode) {
        self.state().status = code;
    }

    /// Sets a header, replacing any previous value.
    pub fn header(&self, name: &str, value: &str) -> Result<(), HttpError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HttpError::internal(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HttpError::internal(format!("invalid header value: {e}")))?;
        self.set_header(name, value);
        Ok(())
    }

    pub(crate) fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.state().headers.insert(name, value);
    }

    pub fn status_code(&self) -> StatusCode { self.state().status }
    pub fn headers(&self) -> HeaderMap { self.state().headers.clone() }
    pub fn body(&self) -> Bytes { self.state().body.clone() }
    pub fn is_sent(&self) -> bool { self.state().sent }

    /// Sends `body` with the current status.
    pub fn send(&self, body: impl Into<Body>) {
        let status = self.status_code();
        self.send_with(status, body);
    }

    /// Sends an empty response with `code`.
    pub fn send_status(&self, code: StatusCode) {
        self.send_with(code, Body::Empty);
    }

    /// Sends `body` with `code`.
    pub fn send_with(&self, code: StatusCode, body: impl Into<Body>) {
        let body = body.into();
        let (status, content_type, bytes) = match self.format(&body) {
            Ok(Some((content_type, bytes))) => (code, Some(content_type), bytes),
            Ok(None) => (code, None, Bytes::new()),
            Err(err) => {
                warn!(error = %err, "formatter failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(HeaderValue::from_static("text/plain; charset=utf-8")),
                    Bytes::from(err.message().to_owned()),
                )
            }
        };

        let mut state = self.state();
        if state.sent {
            warn!(status = %status, "response already sent; ignoring");
            return;
        }
        state.status = status;
        if let Some(content_type) = content_type {
            state.headers.insert(CONTENT_TYPE, content_type);
        }
        state.body = bytes;
        state.sent = true;
    }

    /// The error-send path: status from the error, body from
    /// [`HttpError::to_json`].
    pub fn send_error(&self, err: &HttpError) {
        debug!(status = %err.status(), code = err.code(), "sending error");
        self.send_with(err.status(), Body::Json(err.to_json()));
    }

    pub(crate) fn into_http(self) -> http::Response<Full<Bytes>> {
        let state = self.state();
        let mut res = http::Response::new(Full::new(state.body.clone()));
        *res.status_mut() = state.status;
        *res.headers_mut() = state.headers.clone();
        res
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes `body`. `None` for an empty body: no content type is set.
    fn format(&self, body: &Body) -> Result<Option<(HeaderValue, Bytes)>, HttpError> {
        if matches!(body, Body::Empty) {
            return Ok(None);
        }

        let preset = self.state().headers.get(CONTENT_TYPE).cloned();
        let Some((media_type, formatter)) = self.negotiate(preset.as_ref()) else {
            return Err(HttpError::new(
                StatusCode::NOT_ACCEPTABLE,
                "no formatter registered for this response",
            ));
        };

        let bytes = formatter(&self.req, body)?;
        let content_type = match preset {
            Some(value) => value,
            None => content_type_for(&media_type)?,
        };
        Ok(Some((content_type, bytes)))
    }

    /// Picks a media type and its formatter.
    ///
    /// A content type set by a handler wins; an unknown one keeps its header
    /// and falls back to the binary formatter. Otherwise the first acceptable
    /// type admitted by `Accept`, then the first acceptable type.
    fn negotiate(&self, preset: Option<&HeaderValue>) -> Option<(String, &Formatter)> {
        if let Some(preset) = preset.and_then(|v| v.to_str().ok()) {
            let base = media_base(preset);
            if let Some(f) = self.formatters.get(&base) {
                return Some((base, f));
            }
            if let Some(f) = self.formatters.get("application/octet-stream") {
                return Some((base, f));
            }
        }

        let acceptable = self.formatters.acceptable();
        let chosen = match self.req.header("accept") {
            Some(accept) => {
                let ranges = parse_accept(accept);
                acceptable
                    .iter()
                    .find(|t| ranges.iter().any(|r| admits(r, t)))
                    .or_else(|| acceptable.first())
            }
            None => acceptable.first(),
        }?;

        self.formatters.get(chosen).map(|f| (chosen.clone(), f))
    }
}

fn content_type_for(media_type: &str) -> Result<HeaderValue, HttpError> {
    let value = if media_type.starts_with("text/") {
        format!("{media_type}; charset=utf-8")
    } else {
        media_type.to_owned()
    };
    HeaderValue::from_str(&value).map_err(|e| HttpError::internal(e.to_string()))
}

fn media_base(value: &str) -> String {
    value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// Media ranges from an `Accept` header, minus those with `q=0`.
fn parse_accept(accept: &str) -> Vec<String> {
    accept
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';').map(str::trim);
            let range = parts.next()?.to_ascii_lowercase();
            let rejected = parts
                .filter_map(|p| p.strip_prefix("q="))
                .any(|q| q.parse::<f64>().is_ok_and(|q| q <= 0.0));
            (!range.is_empty() && !rejected).then_some(range)
        })
        .collect()
}

fn admits(range: &str, media_type: &str) -> bool {
    match range {
        "*" | "*/*" => true,
        _ => match range.strip_suffix("/*") {
            Some(prefix) => media_type.split('/').next() == Some(prefix),
            None => range == media_type,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing::Span;

    fn response(accept: Option<&str>) -> Response {
        let mut builder = http::Request::builder().method("GET").uri("/x?callback=cb");
        if let Some(accept) = accept {
            builder = builder.header("accept", accept);
        }
        let req = Request::new(1, builder.body(Bytes::new()).unwrap(), Span::none());
        Response::new(req, Arc::new(Formatters::default()))
    }

    #[test]
    fn defaults_to_json() {
        let res = response(None);
        res.send(json!({ "ok": true }));
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(res.body(), Bytes::from_static(br#"{"ok":true}"#));
    }

    #[test]
    fn honours_accept() {
        let res = response(Some("text/plain, application/json;q=0"));
        res.send("hello");
        assert_eq!(res.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(res.body(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn jsonp_wraps_in_callback() {
        let res = response(Some("application/javascript"));
        res.send(json!([1]));
        assert_eq!(res.body(), Bytes::from_static(b"cb([1]);"));
    }

    #[test]
    fn preset_content_type_wins() {
        let res = response(Some("application/json"));
        res.header("content-type", "image/png").unwrap();
        res.send(vec![0x89, 0x50]);
        assert_eq!(res.headers()[CONTENT_TYPE], "image/png");
        assert_eq!(res.body().as_ref(), [0x89, 0x50]);
    }

    #[test]
    fn second_send_is_ignored() {
        let res = response(None);
        res.send_status(StatusCode::NO_CONTENT);
        res.send_with(StatusCode::OK, "late");
        assert_eq!(res.status_code(), StatusCode::NO_CONTENT);
        assert!(res.body().is_empty());
        assert!(res.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn send_error_uses_error_status() {
        let res = response(None);
        res.send_error(&HttpError::not_found("/x does not exist"));
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&res.body()).unwrap();
        assert_eq!(body["code"], "NotFound");
    }

    #[test]
    fn accept_ranges() {
        assert!(admits("*/*", "application/json"));
        assert!(admits("text/*", "text/plain"));
        assert!(!admits("text/*", "application/json"));
        assert_eq!(parse_accept("text/html;q=0, */*;q=0.1"), ["*/*"]);
    }
}
