//! The chain executor.
//!
//! Runs an ordered handler list for one request. Each handler receives a
//! fresh [`Next`]; the executor waits for that continuation before it moves
//! the cursor, so handler `k + 1` never starts before handler `k` has said so.
//!
//! # Fault boundary
//!
//! Every handler call and every poll of its future is wrapped in
//! `catch_unwind`. A panic is handed to the continuation that was in flight,
//! exactly as if the handler had called `next.fail(..)`. A panic inside a
//! task that owns a clone of the continuation fails it the same way, when the
//! clone is dropped during unwinding. If the continuation was already used,
//! there is nobody left to take the fault: it is reported through
//! `uncaught_exception`. A listener decides what happens next; without one
//! the request gets a 500 and the run fails. Either way the panic stops at
//! this request.
//!
//! A continuation dropped without being invoked stops the run when a
//! response was already sent, and fails it with a 500 otherwise.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::error::HttpError;
use crate::events::{Events, Fault, Uncaught};
use crate::handler::{BoxedHandler, Chain};
use crate::next::{Next, Signal};
use crate::probe::{Probe, Probes};
use crate::registry::Registry;
use crate::request::Request;
use crate::response::Response;
use crate::router::RouteHandle;

/// Which chain a run belongs to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteContext {
    Pre,
    Route(RouteHandle),
}

impl RouteContext {
    pub fn name(&self) -> &str {
        match self {
            Self::Pre => "pre",
            Self::Route(route) => route.name(),
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// Every handler advanced.
    Completed,
    /// A handler called `stop()`, or dropped its continuation.
    Stopped,
    /// A handler failed, or panicked while its continuation was in flight.
    Failed(HttpError),
}

impl RunOutcome {
    pub(crate) fn into_error(self) -> Option<HttpError> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Completed | Self::Stopped => None,
        }
    }
}

/// State of one chain run: the chain, its cursor, and the request it serves.
pub(crate) struct ChainRun<'a> {
    context: RouteContext,
    chain: Chain,
    cursor: Option<usize>,
    req: Request,
    res: Response,
    probes: &'a Probes,
    events: &'a Events,
    registry: &'a Registry,
}

impl<'a> ChainRun<'a> {
    pub(crate) fn new(
        context: RouteContext,
        chain: Chain,
        req: Request,
        res: Response,
        probes: &'a Probes,
        events: &'a Events,
        registry: &'a Registry,
    ) -> Self {
        Self { context, chain, cursor: None, req, res, probes, events, registry }
    }

    pub(crate) async fn run(mut self) -> RunOutcome {
        self.probes.fire(|server, emit| {
            emit(&Probe::RouteStart {
                server,
                route: self.context.name(),
                request_id: self.req.id(),
                method: self.req.method(),
                target: self.req.href(),
                headers: self.req.headers(),
            })
        });

        let mut signal = Signal::Continue;
        let outcome = loop {
            match signal {
                Signal::Continue => {}
                Signal::Stop => break RunOutcome::Stopped,
                Signal::Fail(err) => {
                    debug!(route = self.context.name(), error = %err, "chain failed");
                    if !self.res.is_sent() {
                        self.res.send_error(&err);
                    }
                    break RunOutcome::Failed(err);
                }
                Signal::Jump(name) => {
                    let route = RouteHandle::new(&name);
                    match self.registry.chain(&route) {
                        Some(chain) => {
                            debug!(from = self.context.name(), to = %route, "jumping to route");
                            self.context = RouteContext::Route(route);
                            self.chain = chain;
                            self.cursor = None;
                        }
                        None => {
                            let err = HttpError::internal(format!("no route named `{name}`"));
                            self.res.send_error(&err);
                            break RunOutcome::Failed(err);
                        }
                    }
                }
            }

            let index = self.cursor.map_or(0, |i| i + 1);
            let Some(handler) = self.chain.get(index).cloned() else {
                break RunOutcome::Completed;
            };
            self.cursor = Some(index);
            signal = self.step(index, handler).await;
        };

        let status = self.res.status_code();
        let headers = self.res.headers();
        self.probes.fire(|server, emit| {
            emit(&Probe::RouteDone {
                server,
                route: self.context.name(),
                request_id: self.req.id(),
                status,
                headers: &headers,
            })
        });

        outcome
    }

    /// Runs one handler and waits for its continuation.
    async fn step(&self, index: usize, handler: BoxedHandler) -> Signal {
        let name: Arc<str> = match handler.name() {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("handler-{index}")),
        };
        let route = self.context.name();
        let request_id = self.req.id();

        self.probes.fire(|server, emit| {
            emit(&Probe::HandlerStart { server, route, handler: &name, request_id })
        });
        trace!(route, handler = %name, "running");

        let started = Instant::now();
        let (next, pending) = Next::channel(Arc::clone(&name));

        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.call(self.req.clone(), self.res.clone(), next.clone())
        }));
        let result = match call {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };

        let mut escalated = None;
        if let Err(payload) = result {
            let fault = Fault::from_panic(payload);
            let delivered =
                next.try_deliver(Signal::Fail(fault.to_error())).is_ok() || next.is_faulted();
            if delivered {
                error!(route, handler = %name, fault = %fault, "handler panicked");
            } else {
                escalated = self.uncaught(fault);
            }
        }
        drop(next);

        let signal = match (pending.await, escalated) {
            (Ok(_), Some(err)) => Signal::Fail(err),
            (Ok(signal), None) => signal,
            (Err(_), _) if self.res.is_sent() => {
                warn!(route, handler = %name, "continuation dropped without being invoked; stopping chain");
                Signal::Stop
            }
            (Err(_), _) => {
                error!(route, handler = %name, "continuation dropped without being invoked or a response; failing chain");
                Signal::Fail(HttpError::internal("handler ended without responding"))
            }
        };

        self.req.record_timing(Arc::clone(&name), started.elapsed());
        self.probes.fire(|server, emit| {
            emit(&Probe::HandlerDone { server, route, handler: &name, request_id })
        });

        signal
    }

    /// Reports a fault no continuation can take. Without a listener the
    /// request gets a 500 and the returned error ends the run.
    fn uncaught(&self, fault: Fault) -> Option<HttpError> {
        error!(route = self.context.name(), fault = %fault, "uncaught fault after continuation was used");
        let event = Uncaught {
            request: self.req.clone(),
            response: self.res.clone(),
            route: self.context.clone(),
            fault,
        };
        if self.events.emit_uncaught(&event) {
            return None;
        }
        let err = event.fault.to_error();
        if !self.res.is_sent() {
            self.res.send_error(&err);
        }
        Some(err)
    }
}
