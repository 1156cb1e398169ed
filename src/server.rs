//! Server assembly, HTTP serving and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`; no new connections are made.
//! 2. Letting every in-flight connection task run to completion.
//! 3. Returning from [`Server::serve`], which lets `main` exit cleanly.

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Error};
use crate::events::{Events, Fault};
use crate::formatter::{Formatter, Formatters};
use crate::handler::{BoxedHandler, Handler};
use crate::next::Next;
use crate::probe::{ProbeSink, Probes};
use crate::registry::{Registry, param_handler};
use crate::request::Request;
use crate::response::{Body, Response};
use crate::router::{RouteHandle, RouteSpec, Router, TreeRouter};

/// Assembles routes, chains, formatters and listeners, then serves them.
///
/// Registration order matters: [`middleware`](Server::middleware) only reaches
/// routes mounted after it.
///
/// ```rust,no_run
/// use relay::{Next, Request, Response, Server};
///
/// #[tokio::main]
/// async fn main() {
///     Server::bind("0.0.0.0:3000")
///         .middleware(audit)
///         .get("/users/:id", get_user)
///         .serve()
///         .await
///         .unwrap();
/// }
///
/// async fn audit(_req: Request, _res: Response, next: Next) { next.proceed() }
///
/// async fn get_user(req: Request, res: Response, next: Next) {
///     res.send(req.param("id").unwrap_or("unknown").to_owned());
///     next.proceed();
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    events: Events,
    formatters: Vec<(String, Formatter)>,
    sink: Option<Arc<dyn ProbeSink>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_router(config, TreeRouter::new())
    }

    /// Uses a custom [`Router`] in place of the radix-tree default.
    pub fn with_router(config: ServerConfig, router: impl Router) -> Self {
        let registry = Registry::new(Box::new(router), config.versions.clone());
        Self {
            config,
            registry,
            events: Events::default(),
            formatters: Vec::new(),
            sink: None,
        }
    }

    /// A default-configured server listening on `addr`.
    ///
    /// ```rust,no_run
    /// use relay::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        Self::new(ServerConfig { addr: addr.to_owned(), ..ServerConfig::default() })
    }

    pub fn config(&self) -> &ServerConfig { &self.config }

    /// The event registration table.
    pub fn events(&mut self) -> &mut Events { &mut self.events }

    // ── Chains ───────────────────────────────────────────────────────────────

    /// Appends to the pre-chain, run for every request before resolution.
    pub fn pre(mut self, handler: impl Handler) -> Self {
        self.registry.push_pre(handler.into_boxed_handler());
        self
    }

    /// Appends to the global chain. Only routes mounted afterwards get it.
    pub fn middleware(mut self, handler: impl Handler) -> Self {
        self.registry.push_global(handler.into_boxed_handler());
        self
    }

    /// Calls `f(req, res, next, value, name)` for routes that resolve a param
    /// called `name`; other routes pass straight through. Registered as
    /// [`middleware`](Server::middleware), with the same mount-order rule.
    pub fn param<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(Request, Response, Next, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.middleware(param_handler(name, f))
    }

    /// Mounts `handlers` for `spec`. See [`chain!`](crate::chain).
    ///
    /// Fails without changing anything when the spec is invalid or the
    /// router rejects it.
    pub fn mount(
        &mut self,
        spec: RouteSpec,
        handlers: Vec<BoxedHandler>,
    ) -> Result<RouteHandle, ConfigError> {
        let mounted = self.registry.mount(spec, handlers)?;
        self.events.emit_mount(&mounted);
        Ok(mounted.route)
    }

    /// Removes a mounted route and its chain. `false` if it was not mounted.
    pub fn unmount(&mut self, route: &RouteHandle) -> bool {
        self.registry.unmount(route)
    }

    /// Registers a single-handler route. Returns `self` for chaining.
    ///
    /// # Panics
    ///
    /// Panics if the method or path is invalid or the route conflicts with
    /// one already mounted. Use [`mount`](Server::mount) to handle that.
    pub fn on(mut self, method: &str, path: &str, handler: impl Handler) -> Self {
        self.mount(RouteSpec::new(method, path), vec![handler.into_boxed_handler()])
            .unwrap_or_else(|e| panic!("invalid route `{method} {path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self { self.on("GET", path, handler) }
    pub fn post(self, path: &str, handler: impl Handler) -> Self { self.on("POST", path, handler) }
    pub fn put(self, path: &str, handler: impl Handler) -> Self { self.on("PUT", path, handler) }
    pub fn patch(self, path: &str, handler: impl Handler) -> Self { self.on("PATCH", path, handler) }
    pub fn delete(self, path: &str, handler: impl Handler) -> Self { self.on("DELETE", path, handler) }
    pub fn head(self, path: &str, handler: impl Handler) -> Self { self.on("HEAD", path, handler) }
    pub fn options(self, path: &str, handler: impl Handler) -> Self { self.on("OPTIONS", path, handler) }

    // ── Formatters and probes ────────────────────────────────────────────────

    /// Registers a formatter under `key` (`type[;q=weight]` or an alias such
    /// as `"csv"`). Validated when the server is built.
    pub fn formatter<F>(mut self, key: &str, f: F) -> Self
    where
        F: Fn(&Request, &Body) -> Result<Bytes, crate::HttpError> + Send + Sync + 'static,
    {
        let f: Formatter = Arc::new(f);
        self.formatters.push((key.to_owned(), f));
        self
    }

    pub fn probes(mut self, sink: impl ProbeSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    // ── Running ──────────────────────────────────────────────────────────────

    /// Freezes the configuration into a [`Dispatcher`].
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        let formatters = Formatters::merge(self.formatters)?;
        let probes = Probes::new(Arc::from(self.config.name.as_str()), self.sink);
        Ok(Dispatcher::new(self.registry, self.events, formatters, probes))
    }

    /// Starts accepting connections and dispatching them.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self) -> Result<(), Error> {
        let addr = self.config.socket_addr()?;
        let dispatcher = Arc::new(self.build()?);
        let listener = TcpListener::bind(addr).await?;

        info!(addr = %addr, name = dispatcher.name(), "relay listening");

        // JoinSet tracks every spawned connection task so we can wait for
        // them all to finish during graceful shutdown.
        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM immediately stops
                // accepting, even if more connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let dispatcher = Arc::clone(&dispatcher);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let dispatcher = Arc::clone(&dispatcher);
                            async move { serve_request(dispatcher, req).await }
                        });

                        // HTTP/1.1 and HTTP/2, whatever the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("relay stopped");
        Ok(())
    }
}

// ── Request adapter ──────────────────────────────────────────────────────────

/// Collects the body, dispatches, converts back. Never fails towards hyper:
/// a panic escaping the pipeline becomes a 500 for this request only.
async fn serve_request(
    dispatcher: Arc<Dispatcher>,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {e}");
            return Ok(bare(StatusCode::BAD_REQUEST));
        }
    };

    let req = http::Request::from_parts(parts, body);
    match AssertUnwindSafe(dispatcher.dispatch(req)).catch_unwind().await {
        Ok(res) => Ok(res.into_http()),
        Err(payload) => {
            error!(fault = %Fault::from_panic(payload), "request pipeline panicked");
            Ok(bare(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn bare(status: StatusCode) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
