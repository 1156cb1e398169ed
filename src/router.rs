//! Route resolution.
//!
//! The dispatch core does not match paths itself. It talks to a [`Router`]:
//! mount a rule, unmount it, resolve a request to a [`RouteHandle`]. The
//! default implementation, [`TreeRouter`], keeps one radix tree per HTTP
//! method. O(path-length) lookup.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::header::{ALLOW, CONTENT_TYPE, HeaderValue};
use http::Method;
use matchit::Router as MatchitRouter;

use crate::error::HttpError;
use crate::request::{Params, Request};
use crate::response::Response;

// ── Handles and specs ────────────────────────────────────────────────────────

/// Opaque identifier of one mounted method + path (+ versions) rule.
///
/// Cheap to clone; compares by name.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RouteHandle(Arc<str>);

impl RouteHandle {
    pub fn new(name: &str) -> Self { Self(Arc::from(name)) }
    pub fn name(&self) -> &str { &self.0 }
}

impl fmt::Display for RouteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller asks to mount. Validated and normalized into a
/// [`RouteDef`] before the router sees it.
#[derive(Clone, Debug)]
pub struct RouteSpec {
    pub method: String,
    pub path: String,
    pub name: Option<String>,
    pub versions: Vec<String>,
    pub content_types: Vec<String>,
}

impl RouteSpec {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_owned(),
            path: path.to_owned(),
            name: None,
            versions: Vec::new(),
            content_types: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.versions.push(version.to_owned());
        self
    }

    /// Restricts accepted request bodies. Accepts aliases such as `"json"`.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_types.push(content_type.to_owned());
        self
    }
}

/// A validated route as handed to [`Router::mount`].
#[derive(Clone, Debug)]
pub struct RouteDef {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub versions: Vec<String>,
    pub content_types: Vec<String>,
}

/// Successful resolution.
#[derive(Debug)]
pub enum Resolution {
    /// A route matched; run its chain with these params.
    Matched { route: RouteHandle, params: Params },
    /// The router already answered (e.g. an OPTIONS preflight). Respond 200.
    Satisfied,
}

/// The router collaborator.
///
/// `find` errors must use [`ErrorKind`](crate::ErrorKind) `NotFound`,
/// `MethodNotAllowed`, `InvalidVersion` or `UnsupportedMediaType` so the
/// dispatcher can map them to their [`Outcome`](crate::Outcome); any other
/// kind is treated as generic.
pub trait Router: Send + Sync + 'static {
    /// Registers `route`. `Err` carries the rejection reason (conflict).
    fn mount(&mut self, route: &RouteDef) -> Result<RouteHandle, String>;

    /// Removes a route. `None` if it was not mounted.
    fn unmount(&mut self, route: &RouteHandle) -> Option<RouteHandle>;

    fn find(&self, req: &Request, res: &Response) -> Result<Resolution, HttpError>;

    /// Every registered version string, most specific last.
    fn versions(&self) -> Vec<String>;
}

// ── TreeRouter ───────────────────────────────────────────────────────────────

/// One route sharing a method + path pattern with its other versions.
struct Entry {
    handle: RouteHandle,
    versions: Vec<String>,
    content_types: Vec<String>,
}

/// Radix-tree router. One tree per method; a tree leaf names the pattern,
/// the pattern owns every versioned entry mounted on it.
#[derive(Default)]
pub struct TreeRouter {
    trees: HashMap<Method, MatchitRouter<String>>,
    entries: HashMap<(Method, String), Vec<Entry>>,
    by_name: HashMap<RouteHandle, (Method, String)>,
}

impl TreeRouter {
    pub fn new() -> Self { Self::default() }

    fn allowed_methods(&self, path: &str) -> Vec<&Method> {
        let mut allowed: Vec<&Method> = self
            .trees
            .iter()
            .filter(|(_, tree)| tree.at(path).is_ok())
            .map(|(method, _)| method)
            .collect();
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allowed
    }

    fn select<'a>(&self, entries: &'a [Entry], req: &Request) -> Result<&'a Entry, HttpError> {
        let entry = match req.accept_version() {
            None | Some("*") => entries.first(),
            Some(wanted) => entries
                .iter()
                .find(|e| e.versions.is_empty() || e.versions.iter().any(|v| v == wanted)),
        }
        .ok_or_else(|| {
            HttpError::invalid_version(format!(
                "{} {} supports versions: {}",
                req.method(),
                req.path(),
                entries.iter().flat_map(|e| e.versions.iter().map(String::as_str)).collect::<Vec<_>>().join(", ")
            ))
        })?;

        if !entry.content_types.is_empty() && !req.body().is_empty() {
            let sent = req
                .header(CONTENT_TYPE.as_str())
                .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
                .unwrap_or_default();
            if !entry.content_types.iter().any(|t| *t == sent) {
                return Err(HttpError::unsupported_media_type(format!(
                    "{sent} is not supported by {}",
                    entry.handle
                )));
            }
        }

        Ok(entry)
    }
}

impl Router for TreeRouter {
    fn mount(&mut self, route: &RouteDef) -> Result<RouteHandle, String> {
        let handle = RouteHandle::new(&route.name);
        if self.by_name.contains_key(&handle) {
            return Err(format!("a route named `{}` already exists", route.name));
        }

        let pattern = to_pattern(&route.path);
        let key = (route.method.clone(), pattern.clone());

        match self.entries.get(&key) {
            Some(existing) => {
                let clash = existing.iter().any(|e| {
                    (e.versions.is_empty() && route.versions.is_empty())
                        || e.versions.iter().any(|v| route.versions.contains(v))
                });
                if clash {
                    return Err(format!("{} {} is already mounted for this version", route.method, route.path));
                }
            }
            None => {
                self.trees
                    .entry(route.method.clone())
                    .or_default()
                    .insert(pattern.clone(), pattern.clone())
                    .map_err(|e| e.to_string())?;
            }
        }

        self.entries.entry(key.clone()).or_default().push(Entry {
            handle: handle.clone(),
            versions: route.versions.clone(),
            content_types: route.content_types.clone(),
        });
        self.by_name.insert(handle.clone(), key);
        Ok(handle)
    }

    fn unmount(&mut self, route: &RouteHandle) -> Option<RouteHandle> {
        let key = self.by_name.remove(route)?;
        let entries = self.entries.get_mut(&key)?;
        entries.retain(|e| e.handle != *route);

        if entries.is_empty() {
            self.entries.remove(&key);
            let (method, pattern) = key;
            if let Some(tree) = self.trees.get_mut(&method) {
                tree.remove(pattern);
            }
        }
        Some(route.clone())
    }

    fn find(&self, req: &Request, res: &Response) -> Result<Resolution, HttpError> {
        let path = req.path();

        let matched = self.trees.get(req.method()).and_then(|tree| tree.at(path).ok());
        if let Some(matched) = matched {
            let key = (req.method().clone(), matched.value.clone());
            if let Some(entries) = self.entries.get(&key) {
                let entry = self.select(entries, req)?;
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect();
                return Ok(Resolution::Matched { route: entry.handle.clone(), params });
            }
        }

        let allowed = self.allowed_methods(path);
        if allowed.is_empty() {
            return Err(HttpError::not_found(format!("{path} does not exist")));
        }

        let allow = allowed.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
        if let Ok(value) = HeaderValue::from_str(&allow) {
            res.set_header(ALLOW, value);
        }

        if req.method() == Method::OPTIONS {
            return Ok(Resolution::Satisfied);
        }
        Err(HttpError::method_not_allowed(format!("{} is not allowed", req.method())))
    }

    fn versions(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .entries
            .values()
            .flatten()
            .flat_map(|e| e.versions.iter().cloned())
            .collect();
        all.sort_by(|a, b| compare_versions(a, b));
        all.dedup();
        all
    }
}

/// Rewrites `:name` segments into matchit's `{name}` syntax.
fn to_pattern(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => format!("{{{name}}}"),
            _ => segment.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Numeric-aware ordering: `1.2.0 < 1.10.0`.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |s: &str| -> Vec<u64> {
        s.trim_start_matches(['v', '~', '^'])
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    parts(a).cmp(&parts(b)).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::Formatters;
    use bytes::Bytes;
    use tracing::Span;

    fn def(name: &str, method: Method, path: &str, versions: &[&str]) -> RouteDef {
        RouteDef {
            name: name.to_owned(),
            method,
            path: path.to_owned(),
            versions: versions.iter().map(|v| (*v).to_owned()).collect(),
            content_types: Vec::new(),
        }
    }

    fn exchange(method: &str, uri: &str, version: Option<&str>) -> (Request, Response) {
        let mut b = http::Request::builder().method(method).uri(uri);
        if let Some(v) = version {
            b = b.header("accept-version", v);
        }
        let req = Request::new(1, b.body(Bytes::new()).unwrap(), Span::none());
        let res = Response::new(req.clone(), Arc::new(Formatters::default()));
        (req, res)
    }

    #[test]
    fn rewrites_colon_params() {
        assert_eq!(to_pattern("/users/:id/posts/:post"), "/users/{id}/posts/{post}");
        assert_eq!(to_pattern("/plain"), "/plain");
    }

    #[test]
    fn resolves_params() {
        let mut router = TreeRouter::new();
        router.mount(&def("getuser", Method::GET, "/users/:id", &[])).unwrap();

        let (req, res) = exchange("GET", "/users/42", None);
        match router.find(&req, &res).unwrap() {
            Resolution::Matched { route, params } => {
                assert_eq!(route.name(), "getuser");
                assert_eq!(params["id"], "42");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_failures() {
        let mut router = TreeRouter::new();
        router.mount(&def("getx", Method::GET, "/x", &[])).unwrap();
        router.mount(&def("putx", Method::PUT, "/x", &[])).unwrap();

        let (req, res) = exchange("GET", "/nope", None);
        assert_eq!(router.find(&req, &res).unwrap_err().kind(), crate::ErrorKind::NotFound);

        let (req, res) = exchange("POST", "/x", None);
        assert_eq!(
            router.find(&req, &res).unwrap_err().kind(),
            crate::ErrorKind::MethodNotAllowed
        );
        assert_eq!(res.headers()[ALLOW], "GET, PUT");

        let (req, res) = exchange("OPTIONS", "/x", None);
        assert!(matches!(router.find(&req, &res), Ok(Resolution::Satisfied)));
    }

    #[test]
    fn selects_by_version() {
        let mut router = TreeRouter::new();
        router.mount(&def("v1", Method::GET, "/x", &["1.0.0"])).unwrap();
        router.mount(&def("v2", Method::GET, "/x", &["2.0.0"])).unwrap();

        let name = |version| {
            let (req, res) = exchange("GET", "/x", version);
            router.find(&req, &res).map(|r| match r {
                Resolution::Matched { route, .. } => route.name().to_owned(),
                Resolution::Satisfied => String::new(),
            })
        };
        assert_eq!(name(Some("2.0.0")).unwrap(), "v2");
        assert_eq!(name(None).unwrap(), "v1");
        assert_eq!(name(Some("3.0.0")).unwrap_err().kind(), crate::ErrorKind::InvalidVersion);
    }

    #[test]
    fn rejects_conflicts() {
        let mut router = TreeRouter::new();
        router.mount(&def("a", Method::GET, "/x", &["1.0.0"])).unwrap();
        assert!(router.mount(&def("b", Method::GET, "/x", &["1.0.0"])).is_err());
        assert!(router.mount(&def("a", Method::POST, "/y", &[])).is_err());
        router.mount(&def("c", Method::GET, "/users/:id", &[])).unwrap();
        assert!(router.mount(&def("d", Method::GET, "/users/:name", &[])).is_err());
    }

    #[test]
    fn unmount_frees_the_pattern() {
        let mut router = TreeRouter::new();
        let h = router.mount(&def("a", Method::GET, "/x", &[])).unwrap();
        assert_eq!(router.unmount(&h), Some(h.clone()));
        assert_eq!(router.unmount(&h), None);

        let (req, res) = exchange("GET", "/x", None);
        assert!(router.find(&req, &res).is_err());
        assert!(router.mount(&def("a", Method::GET, "/x", &[])).is_ok());
    }

    #[test]
    fn versions_most_specific_last() {
        let mut router = TreeRouter::new();
        router.mount(&def("a", Method::GET, "/a", &["1.10.0"])).unwrap();
        router.mount(&def("b", Method::GET, "/b", &["1.2.0", "1.10.0"])).unwrap();
        assert_eq!(router.versions(), ["1.2.0", "1.10.0"]);
    }
}
