//! Which handlers run for which route.
//!
//! Three lists, built once while the server is assembled:
//!
//! - the **pre-chain**, run for every request before resolution
//! - the **global chain**, copied into a route's chain *when it is mounted*
//! - one **route chain** per mounted route
//!
//! The global chain is snapshotted, not referenced. A route mounted before a
//! `middleware()` call never sees that handler:
//!
//! ```text
//! mount R1        R1 = [r1]
//! middleware(H)   global = [H]
//! mount R2        R2 = [H, r2]
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::error::ConfigError;
use crate::events::Mounted;
use crate::formatter::lookup_alias;
use crate::handler::{BoxedHandler, Chain, Handler, Named, named};
use crate::method;
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;
use crate::router::{RouteDef, RouteHandle, RouteSpec, Router};

pub(crate) struct Registry {
    router: Box<dyn Router>,
    default_versions: Vec<String>,
    pre: Vec<BoxedHandler>,
    global: Vec<BoxedHandler>,
    routes: HashMap<RouteHandle, Chain>,
}

impl Registry {
    pub(crate) fn new(router: Box<dyn Router>, default_versions: Vec<String>) -> Self {
        Self {
            router,
            default_versions,
            pre: Vec::new(),
            global: Vec::new(),
            routes: HashMap::new(),
        }
    }

    /// Validates `spec`, registers it with the router and stores
    /// `global ++ handlers` under the returned handle. Nothing is stored when
    /// any step fails.
    pub(crate) fn mount(
        &mut self,
        spec: RouteSpec,
        handlers: Vec<BoxedHandler>,
    ) -> Result<Mounted, ConfigError> {
        let def = self.define(spec)?;
        if handlers.is_empty() {
            return Err(ConfigError::EmptyChain(def.name));
        }

        let route = self
            .router
            .mount(&def)
            .map_err(|reason| ConfigError::RouteConflict { name: def.name.clone(), reason })?;

        let chain: Chain = self.global.iter().cloned().chain(handlers).collect();
        debug!(route = %route, method = %def.method, path = %def.path, handlers = chain.len(), "mounted");
        self.routes.insert(route.clone(), chain);

        Ok(Mounted { route, method: def.method, path: def.path, versions: def.versions })
    }

    pub(crate) fn unmount(&mut self, route: &RouteHandle) -> bool {
        match self.router.unmount(route) {
            Some(removed) => {
                self.routes.remove(&removed);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_global(&mut self, handler: BoxedHandler) {
        self.global.push(handler);
    }

    pub(crate) fn push_pre(&mut self, handler: BoxedHandler) {
        self.pre.push(handler);
    }

    pub(crate) fn pre_chain(&self) -> Chain { self.pre.iter().cloned().collect() }

    pub(crate) fn chain(&self, route: &RouteHandle) -> Option<Chain> {
        self.routes.get(route).cloned()
    }

    pub(crate) fn router(&self) -> &dyn Router { self.router.as_ref() }

    fn define(&self, spec: RouteSpec) -> Result<RouteDef, ConfigError> {
        if !spec.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(spec.path));
        }
        let method = method::normalize(&spec.method)?;

        let versions = if spec.versions.is_empty() {
            self.default_versions.clone()
        } else {
            spec.versions
        };

        let content_types = spec
            .content_types
            .iter()
            .map(|t| {
                if t.contains('/') {
                    Ok(t.trim().to_ascii_lowercase())
                } else {
                    lookup_alias(t)
                        .map(str::to_owned)
                        .ok_or_else(|| ConfigError::UnknownMediaType(t.clone()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let explicit = spec.name.as_deref().map(sanitize).filter(|n| !n.is_empty());
        let name = match explicit {
            Some(name) => name,
            None => self.unclaimed(sanitize(&format!("{}{}{}", method, spec.path, versions.concat()))),
        };

        Ok(RouteDef { name, method, path: spec.path, versions, content_types })
    }

    /// Sanitizing is lossy (`/users/:id` and `/usersid` agree), so a derived
    /// name already in use gets the first free `_2`, `_3`, … suffix.
    fn unclaimed(&self, base: String) -> String {
        let mut candidate = base.clone();
        let mut n = 1;
        while self.routes.contains_key(&RouteHandle::new(&candidate)) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        candidate
    }
}

/// Keeps identifier-safe characters: `GET /users/:id` becomes `getusersid`.
fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// The handler behind [`Server::param`](crate::Server::param): calls `f` with
/// the value of the named param when the resolved route has one, otherwise
/// just advances.
pub(crate) fn param_handler<F, Fut>(name: &str, f: F) -> Named<impl Handler>
where
    F: Fn(Request, Response, Next, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let label = format!("param_{}", sanitize(name));
    let name: Arc<str> = Arc::from(name);

    let handler = move |req: Request, res: Response, next: Next| {
        let pending = req
            .param(&name)
            .map(str::to_owned)
            .map(|value| f(req.clone(), res.clone(), next.clone(), value, name.to_string()));
        async move {
            match pending {
                Some(fut) => fut.await,
                None => next.proceed(),
            }
        }
    };
    named(&label, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::TreeRouter;

    async fn r1(_req: Request, _res: Response, next: Next) { next.proceed() }
    async fn r2(_req: Request, _res: Response, next: Next) { next.proceed() }
    async fn h(_req: Request, _res: Response, next: Next) { next.proceed() }

    fn registry() -> Registry {
        Registry::new(Box::new(TreeRouter::new()), Vec::new())
    }

    fn names(chain: &Chain) -> Vec<&str> {
        chain.iter().map(|h| h.name().unwrap_or("?")).collect()
    }

    #[test]
    fn global_chain_is_snapshotted_at_mount() {
        let mut reg = registry();
        let first = reg.mount(RouteSpec::new("GET", "/one"), vec![r1.into_boxed_handler()]).unwrap();
        reg.push_global(h.into_boxed_handler());
        let second = reg.mount(RouteSpec::new("GET", "/two"), vec![r2.into_boxed_handler()]).unwrap();

        assert_eq!(names(&reg.chain(&first.route).unwrap()), ["r1"]);
        assert_eq!(names(&reg.chain(&second.route).unwrap()), ["h", "r2"]);
    }

    #[test]
    fn derives_and_sanitizes_names() {
        let mut reg = registry();
        let derived = reg
            .mount(RouteSpec::new("del", "/users/:id").version("1.0.0"), vec![h.into_boxed_handler()])
            .unwrap();
        assert_eq!(derived.route.name(), "deleteusersid100");
        assert_eq!(derived.method, http::Method::DELETE);

        let explicit = reg
            .mount(RouteSpec::new("GET", "/x").name("Get-X!"), vec![h.into_boxed_handler()])
            .unwrap();
        assert_eq!(explicit.route.name(), "getx");
    }

    #[test]
    fn colliding_derived_names_are_suffixed() {
        let mut reg = registry();
        let first = reg.mount(RouteSpec::new("GET", "/users/:id"), vec![h.into_boxed_handler()]).unwrap();
        let second = reg.mount(RouteSpec::new("GET", "/usersid"), vec![h.into_boxed_handler()]).unwrap();
        let third = reg.mount(RouteSpec::new("GET", "/users-id"), vec![h.into_boxed_handler()]).unwrap();

        assert_eq!(first.route.name(), "getusersid");
        assert_eq!(second.route.name(), "getusersid_2");
        assert_eq!(third.route.name(), "getusersid_3");
        assert!(reg.chain(&second.route).is_some());

        let clash = reg.mount(RouteSpec::new("GET", "/x").name("getusersid"), vec![h.into_boxed_handler()]);
        assert!(matches!(clash, Err(ConfigError::RouteConflict { .. })));
    }

    #[test]
    fn default_versions_apply_when_unset() {
        let mut reg = Registry::new(Box::new(TreeRouter::new()), vec!["2.0.0".into()]);
        let m = reg.mount(RouteSpec::new("GET", "/x"), vec![h.into_boxed_handler()]).unwrap();
        assert_eq!(m.versions, ["2.0.0"]);
        assert_eq!(reg.router().versions(), ["2.0.0"]);
    }

    #[test]
    fn failed_mount_leaves_no_state() {
        let mut reg = registry();
        reg.mount(RouteSpec::new("GET", "/x"), vec![h.into_boxed_handler()]).unwrap();

        let dup = reg.mount(RouteSpec::new("GET", "/x").name("other"), vec![h.into_boxed_handler()]);
        assert!(matches!(dup, Err(ConfigError::RouteConflict { .. })));
        assert!(reg.chain(&RouteHandle::new("other")).is_none());

        assert!(matches!(
            reg.mount(RouteSpec::new("FETCH", "/y"), vec![h.into_boxed_handler()]),
            Err(ConfigError::InvalidMethod(_))
        ));
        assert!(matches!(
            reg.mount(RouteSpec::new("GET", "y"), vec![h.into_boxed_handler()]),
            Err(ConfigError::InvalidPath(_))
        ));
        assert!(matches!(
            reg.mount(RouteSpec::new("GET", "/y"), Vec::new()),
            Err(ConfigError::EmptyChain(_))
        ));
        assert!(matches!(
            reg.mount(RouteSpec::new("POST", "/y").content_type("nope"), vec![h.into_boxed_handler()]),
            Err(ConfigError::UnknownMediaType(_))
        ));
    }

    #[test]
    fn unmount_removes_chain() {
        let mut reg = registry();
        let m = reg.mount(RouteSpec::new("GET", "/x"), vec![h.into_boxed_handler()]).unwrap();
        assert!(reg.unmount(&m.route));
        assert!(reg.chain(&m.route).is_none());
        assert!(!reg.unmount(&m.route));
    }
}
