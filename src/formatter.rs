//! Content-type formatters and their priority order.
//!
//! A formatter turns a response [`Body`] into bytes for one media type. The
//! server starts from four defaults and merges user-supplied formatters on
//! top. The merge produces two things:
//!
//! - a table `media type → formatter`
//! - the *acceptable* list: every registered media type, most preferred first
//!
//! Both are handed to [`Response`](crate::Response), which negotiates against
//! the request `Accept` header when something is sent.
//!
//! # Keys and priorities
//!
//! A key is `type[;q=weight]`. A bare key without `/` (`"json"`) is resolved
//! through a small alias table. The priority of an entry is `weight × 10` when
//! a weight is given, otherwise its registration index offset by the number
//! of defaults, so unweighted custom formatters outrank every default. Ties
//! keep registration order.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{ConfigError, HttpError};
use crate::request::Request;
use crate::response::Body;

/// Serializes a body for one media type.
pub type Formatter = Arc<dyn Fn(&Request, &Body) -> Result<Bytes, HttpError> + Send + Sync>;

/// The merged formatter table and acceptable list.
#[derive(Clone)]
pub struct Formatters {
    table: HashMap<String, Formatter>,
    acceptable: Vec<String>,
}

struct Entry {
    media_type: String,
    priority: f64,
}

impl Formatters {
    /// Merges `custom` on top of the default formatters.
    pub fn merge(custom: Vec<(String, Formatter)>) -> Result<Self, ConfigError> {
        Self::merge_with(defaults(), custom)
    }

    pub(crate) fn merge_with(
        defaults: Vec<(String, Formatter)>,
        custom: Vec<(String, Formatter)>,
    ) -> Result<Self, ConfigError> {
        let offset = defaults.len();
        let mut table = HashMap::new();
        let mut entries: Vec<Entry> = Vec::new();

        for (index, (key, formatter)) in defaults.into_iter().chain(custom).enumerate() {
            let (media_type, weight) = parse_key(&key)?;
            let priority = weight.map_or((index + offset) as f64, |w| w * 10.0);

            // Re-registering a media type replaces both the function and its slot.
            entries.retain(|e| e.media_type != media_type);
            entries.push(Entry { media_type: media_type.clone(), priority });
            table.insert(media_type, formatter);
        }

        // `sort_by` is stable: equal priorities keep registration order.
        entries.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        Ok(Self {
            table,
            acceptable: entries.into_iter().map(|e| e.media_type).collect(),
        })
    }

    /// Registered media types, most preferred first.
    pub fn acceptable(&self) -> &[String] { &self.acceptable }

    pub fn get(&self, media_type: &str) -> Option<&Formatter> { self.table.get(media_type) }
}

impl Default for Formatters {
    fn default() -> Self {
        Self::merge_with(defaults(), Vec::new()).unwrap_or_else(|_| Self {
            table: HashMap::new(),
            acceptable: Vec::new(),
        })
    }
}

/// Splits `type[;q=weight]` and resolves bare aliases.
fn parse_key(key: &str) -> Result<(String, Option<f64>), ConfigError> {
    let mut parts = key.split(';').map(str::trim);
    let raw = parts.next().unwrap_or_default();

    let mut weight = None;
    for param in parts {
        if let Some(q) = param.strip_prefix("q=") {
            let q: f64 = q.trim().parse().map_err(|_| ConfigError::InvalidWeight(key.to_owned()))?;
            if !(0.0..=1.0).contains(&q) {
                return Err(ConfigError::InvalidWeight(key.to_owned()));
            }
            weight = Some(q);
        }
    }

    let media_type = if raw.contains('/') {
        raw.to_ascii_lowercase()
    } else {
        lookup_alias(raw)
            .ok_or_else(|| ConfigError::UnknownMediaType(raw.to_owned()))?
            .to_owned()
    };

    Ok((media_type, weight))
}

pub(crate) fn lookup_alias(alias: &str) -> Option<&'static str> {
    let mime = match alias.to_ascii_lowercase().as_str() {
        "json" => "application/json",
        "text" | "txt" => "text/plain",
        "html" => "text/html",
        "xml" => "application/xml",
        "js" | "javascript" | "jsonp" => "application/javascript",
        "csv" => "text/csv",
        "bin" | "binary" | "octet" => "application/octet-stream",
        "form" => "application/x-www-form-urlencoded",
        "msgpack" => "application/msgpack",
        "pdf" => "application/pdf",
        "event-stream" | "sse" => "text/event-stream",
        _ => return None,
    };
    Some(mime)
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn defaults() -> Vec<(String, Formatter)> {
    vec![
        ("application/javascript; q=0.1".to_owned(), Arc::new(format_jsonp) as Formatter),
        ("application/json; q=0.4".to_owned(), Arc::new(format_json) as Formatter),
        ("text/plain; q=0.3".to_owned(), Arc::new(format_text) as Formatter),
        ("application/octet-stream; q=0.2".to_owned(), Arc::new(format_binary) as Formatter),
    ]
}

fn format_json(_req: &Request, body: &Body) -> Result<Bytes, HttpError> {
    match body {
        Body::Empty => Ok(Bytes::new()),
        Body::Bytes(b) => Ok(b.clone()),
        Body::Text(s) => Ok(serde_json::to_vec(s)?.into()),
        Body::Json(v) => Ok(serde_json::to_vec(v)?.into()),
    }
}

/// JSON, wrapped in the `callback` (or `jsonp`) query parameter when present.
fn format_jsonp(req: &Request, body: &Body) -> Result<Bytes, HttpError> {
    let json = format_json(req, body)?;
    let callback = req.query_param("callback").or_else(|| req.query_param("jsonp"));

    match callback {
        Some(cb) if !cb.is_empty() => {
            let mut out = Vec::with_capacity(cb.len() + json.len() + 3);
            out.extend_from_slice(cb.as_bytes());
            out.push(b'(');
            out.extend_from_slice(&json);
            out.extend_from_slice(b");");
            Ok(out.into())
        }
        _ => Ok(json),
    }
}

fn format_text(_req: &Request, body: &Body) -> Result<Bytes, HttpError> {
    match body {
        Body::Empty => Ok(Bytes::new()),
        Body::Bytes(b) => Ok(b.clone()),
        Body::Text(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        Body::Json(serde_json::Value::String(s)) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        Body::Json(v) => Ok(v.to_string().into()),
    }
}

fn format_binary(_req: &Request, body: &Body) -> Result<Bytes, HttpError> {
    match body {
        Body::Empty => Ok(Bytes::new()),
        Body::Bytes(b) => Ok(b.clone()),
        Body::Text(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        Body::Json(v) => Ok(serde_json::to_vec(v)?.into()),
    }
}
