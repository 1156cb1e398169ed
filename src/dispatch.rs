//! Per-request dispatch pipeline.
//!
//! ```text
//! START ─▶ PRE ─▶ RESOLVE ─▶ ROUTE ─▶ DONE
//!           │        │                  ▲
//!           └────────┴──────────────────┘   (stop, error, resolution failure)
//! ```
//!
//! - **START** assigns the request id, opens its span, attaches the
//!   formatter table to the response.
//! - **PRE** runs the pre-chain, if any. A stop or an error ends the request.
//! - **RESOLVE** asks the router. Failures become an [`Outcome`]; a listener
//!   registered for it takes over, otherwise the error is sent as is.
//! - **ROUTE** installs the params and runs the route chain.
//! - **DONE** fires `after`, exactly once, whichever way the request got here.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use http::{Method, StatusCode};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::chain::{ChainRun, RouteContext, RunOutcome};
use crate::error::{ErrorKind, HttpError};
use crate::events::{Completion, Events, Fault, Outcome};
use crate::formatter::Formatters;
use crate::handler::Chain;
use crate::next::{Next, Signal};
use crate::probe::Probes;
use crate::registry::Registry;
use crate::request::Request;
use crate::response::Response;
use crate::router::{Resolution, RouteHandle};

/// The assembled, immutable server configuration, ready to take requests.
///
/// Built by [`Server::build`](crate::Server::build). Transport-agnostic:
/// hand it an `http::Request` with a collected body, get a [`Response`] back.
pub struct Dispatcher {
    registry: Registry,
    pre: Chain,
    events: Events,
    formatters: Arc<Formatters>,
    probes: Probes,
    ids: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Registry,
        events: Events,
        formatters: Formatters,
        probes: Probes,
    ) -> Self {
        Self {
            pre: registry.pre_chain(),
            registry,
            events,
            formatters: Arc::new(formatters),
            probes,
            ids: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str { self.probes.server() }

    pub fn formatters(&self) -> &Formatters { &self.formatters }

    /// Every version the router knows, most specific last.
    pub fn versions(&self) -> Vec<String> { self.registry.router().versions() }

    /// Runs one request through the pipeline.
    pub async fn dispatch(&self, req: http::Request<Bytes>) -> Response {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("request", id, method = %req.method(), path = %req.uri().path());
        let req = Request::new(id, req, span.clone());
        let res = Response::new(req.clone(), Arc::clone(&self.formatters));

        async {
            let (route, error) = self.handle(&req, &res).await;
            debug!(
                status = %res.status_code(),
                elapsed_ms = req.elapsed().as_millis() as u64,
                error = error.as_ref().map(tracing::field::display),
                "request complete"
            );
            self.events.emit_after(&Completion {
                request: req.clone(),
                response: res.clone(),
                route,
                error,
            });
        }
        .instrument(span)
        .await;

        res
    }

    async fn handle(&self, req: &Request, res: &Response) -> (Option<RouteHandle>, Option<HttpError>) {
        if !self.pre.is_empty() {
            let outcome = self.run(RouteContext::Pre, Arc::clone(&self.pre), req, res).await;
            let error = match &outcome {
                RunOutcome::Failed(err) => Some(err.clone()),
                RunOutcome::Completed | RunOutcome::Stopped => None,
            };
            self.events.emit_pre_done(&Completion {
                request: req.clone(),
                response: res.clone(),
                route: None,
                error: error.clone(),
            });
            if !matches!(outcome, RunOutcome::Completed) {
                return (None, error);
            }
        }

        match self.registry.router().find(req, res) {
            Err(err) if is_wildcard_options(req, &err) => {
                res.send_status(StatusCode::OK);
                (None, None)
            }
            Err(err) => {
                self.resolution_failure(req, res, &err).await;
                (None, Some(err))
            }
            Ok(Resolution::Satisfied) => {
                res.send_status(StatusCode::OK);
                (None, None)
            }
            Ok(Resolution::Matched { route, params }) => {
                let Some(chain) = self.registry.chain(&route) else {
                    warn!(route = %route, "router matched a route with no chain");
                    let err = HttpError::not_found(format!("{} does not exist", req.path()));
                    self.resolution_failure(req, res, &err).await;
                    return (None, Some(err));
                };

                req.install(route.clone(), params);
                let error = self
                    .run(RouteContext::Route(route.clone()), chain, req, res)
                    .await
                    .into_error();

                self.events.emit_done(&Completion {
                    request: req.clone(),
                    response: res.clone(),
                    route: Some(route.clone()),
                    error: error.clone(),
                });
                (Some(route), error)
            }
        }
    }

    async fn run(&self, context: RouteContext, chain: Chain, req: &Request, res: &Response) -> RunOutcome {
        ChainRun::new(
            context,
            chain,
            req.clone(),
            res.clone(),
            &self.probes,
            &self.events,
            &self.registry,
        )
        .run()
        .await
    }

    /// Hands a resolution failure to its listener, or sends it.
    async fn resolution_failure(&self, req: &Request, res: &Response, err: &HttpError) {
        let outcome = Outcome::classify(err);
        let Some(handler) = self.events.outcome_handler(outcome) else {
            res.send_error(err);
            return;
        };

        debug!(%outcome, "resolution failure handed to listener");
        let (next, pending) = Next::channel(Arc::from(outcome.to_string()));

        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            handler(req.clone(), res.clone(), err.clone(), next.clone())
        }));
        let result = match call {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        if let Err(payload) = result {
            let fault = Fault::from_panic(payload);
            error!(%outcome, fault = %fault, "outcome listener panicked");
            let _ = next.try_deliver(Signal::Fail(fault.to_error()));
        }
        drop(next);

        match pending.await {
            Ok(Signal::Fail(e)) if !res.is_sent() => res.send_error(&e),
            Ok(_) => {}
            Err(_) => {
                warn!(%outcome, "listener dropped its continuation");
                if !res.is_sent() {
                    res.send_error(err);
                }
            }
        }
    }
}

/// `OPTIONS *` with no route: answered with a bare 200.
fn is_wildcard_options(req: &Request, err: &HttpError) -> bool {
    err.kind() == ErrorKind::NotFound && req.method() == Method::OPTIONS && req.path() == "*"
}
