//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! A chain holds handlers of *different* types in one slice. Rust
//! collections can only hold one concrete type, so every handler is hidden
//! behind a trait object (`dyn ErasedHandler`) and stored uniformly.
//!
//! ```text
//! async fn auth(req: Request, res: Response, next: Next) { … }   ← user writes this
//!        ↓ server.middleware(auth)
//! auth.into_boxed_handler()                                      ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler { f: auth, name: Some("auth") })            ← name from the fn item
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(req, res, next)  at request time                  ← one vtable dispatch
//! ```
//!
//! A chain is an `Arc<[BoxedHandler]>`: mounting copies handler *pointers*,
//! never the handlers themselves.

use std::any::type_name;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::next::Next;
use crate::request::Request;
use crate::response::Response;

/// A heap-allocated, type-erased handler future.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request, res: Response, next: Next) -> BoxFuture;

    /// Declared name, if the handler has one. Used by probes and timings.
    fn name(&self) -> Option<&str>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// An ordered, immutable list of handlers.
pub(crate) type Chain = Arc<[BoxedHandler]>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid handler.
///
/// Satisfied automatically by any function with the signature:
///
/// ```text
/// async fn name(req: Request, res: Response, next: Next)
/// ```
///
/// and by [`named`] wrappers. The trait is sealed.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler { f: self, name: declared_name::<F>() })
    }
}

/// A handler with an explicit name.
pub struct Named<H> {
    name: String,
    handler: H,
}

/// Gives `handler` a name for probes and timings. Closures have none otherwise.
pub fn named<H: Handler>(name: &str, handler: H) -> Named<H> {
    Named { name: name.to_owned(), handler }
}

impl<H: Handler> private::Sealed for Named<H> {}

impl<H: Handler> Handler for Named<H> {
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(NamedHandler { name: self.name, inner: self.handler.into_boxed_handler() })
    }
}

/// Boxes a list of handlers for [`Server::mount`](crate::Server::mount).
///
/// ```rust,ignore
/// server.mount(RouteSpec::new("GET", "/x"), chain![load_user, render])?;
/// ```
#[macro_export]
macro_rules! chain {
    ($($handler:expr),+ $(,)?) => {
        vec![$($crate::Handler::into_boxed_handler($handler)),+]
    };
}

// ── Concrete wrappers ─────────────────────────────────────────────────────────

struct FnHandler<F> {
    f: F,
    name: Option<&'static str>,
}

impl<F, Fut> ErasedHandler for FnHandler<F>
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: Request, res: Response, next: Next) -> BoxFuture {
        Box::pin((self.f)(req, res, next))
    }

    fn name(&self) -> Option<&str> { self.name }
}

struct NamedHandler {
    name: String,
    inner: BoxedHandler,
}

impl ErasedHandler for NamedHandler {
    fn call(&self, req: Request, res: Response, next: Next) -> BoxFuture {
        self.inner.call(req, res, next)
    }

    fn name(&self) -> Option<&str> { Some(&self.name) }
}

/// `my_app::auth::check` → `check`. Closures have no usable name.
fn declared_name<F>() -> Option<&'static str> {
    let full = type_name::<F>();
    if full.contains("{{closure}}") {
        return None;
    }
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn load_user(_req: Request, _res: Response, next: Next) {
        next.proceed();
    }

    #[test]
    fn fn_items_keep_their_name() {
        assert_eq!(load_user.into_boxed_handler().name(), Some("load_user"));
    }

    #[test]
    fn closures_are_anonymous_until_named() {
        let anon = |_: Request, _: Response, next: Next| async move { next.proceed() };
        assert_eq!(anon.into_boxed_handler().name(), None);

        let anon = |_: Request, _: Response, next: Next| async move { next.proceed() };
        assert_eq!(named("audit", anon).into_boxed_handler().name(), Some("audit"));
    }
}
