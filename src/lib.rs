//! # relay
//!
//! The request-dispatch core of an HTTP service: ordered handler chains,
//! route resolution, per-request fault isolation, lifecycle events.
//!
//! ## The model
//!
//! Every request walks the same path:
//!
//! ```text
//! pre-chain ─▶ router ─▶ route chain ─▶ after
//! ```
//!
//! A handler is an `async fn(Request, Response, Next)`. It does its work and
//! calls exactly one of `next.proceed()`, `next.stop()` or `next.fail(err)`.
//! The next handler does not start until it does.
//!
//! - Chains run strictly in order, one handler at a time per request.
//! - `middleware()` handlers are copied into a route's chain when the route
//!   is mounted. Later `middleware()` calls do not reach earlier routes.
//! - A handler that panics fails its own request and nothing else.
//! - Every request fires `after` exactly once, however it ended.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use relay::{HttpError, Next, Request, Response, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::bind("0.0.0.0:3000")
//!         .pre(log_request)
//!         .middleware(require_token)
//!         .get("/users/:id", get_user)
//!         .serve()
//!         .await
//!         .unwrap();
//! }
//!
//! async fn log_request(req: Request, _res: Response, next: Next) {
//!     tracing::info!(method = %req.method(), path = req.path(), "incoming");
//!     next.proceed();
//! }
//!
//! async fn require_token(req: Request, _res: Response, next: Next) {
//!     match req.header("authorization") {
//!         Some(_) => next.proceed(),
//!         None => next.fail(HttpError::new(http::StatusCode::UNAUTHORIZED, "missing token")),
//!     }
//! }
//!
//! async fn get_user(req: Request, res: Response, next: Next) {
//!     let id = req.param("id").unwrap_or("unknown");
//!     res.send(serde_json::json!({ "id": id }));
//!     next.proceed();
//! }
//! ```

mod chain;
mod config;
mod dispatch;
mod error;
mod events;
mod formatter;
mod handler;
mod method;
mod next;
mod probe;
mod registry;
mod request;
mod response;
mod router;
mod server;

pub use chain::RouteContext;
pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use error::{ConfigError, Error, ErrorKind, HttpError};
pub use events::{Completion, Events, Fault, Mounted, Outcome, Uncaught};
pub use formatter::{Formatter, Formatters};
pub use handler::{BoxedHandler, ErasedHandler, Handler, Named, named};
pub use next::Next;
pub use probe::{Probe, ProbeSink};
pub use request::{HandlerTiming, Params, Request};
pub use response::{Body, Response};
pub use router::{Resolution, RouteDef, RouteHandle, RouteSpec, Router, TreeRouter};
pub use server::Server;
