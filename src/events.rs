//! Lifecycle events and overridable resolution outcomes.
//!
//! Observers register on [`Events`] while the server is assembled:
//!
//! | event | fired |
//! |---|---|
//! | `mount` | a route was mounted |
//! | `pre_done` | the pre-chain finished, whatever its result |
//! | `done` | a route chain finished |
//! | `after` | once per request, on every path |
//! | `uncaught_exception` | a handler panicked and no continuation could take the fault |
//!
//! Resolution failures are not plain observers: a handler registered for an
//! [`Outcome`] *replaces* the default response for it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use http::Method;

use crate::chain::RouteContext;
use crate::error::{ErrorKind, HttpError};
use crate::handler::BoxFuture;
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;
use crate::router::RouteHandle;

/// The closed set of resolution failures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Outcome {
    NotFound,
    MethodNotAllowed,
    VersionNotAllowed,
    UnsupportedMediaType,
    /// Any other error the router reports.
    Generic,
}

impl Outcome {
    pub fn classify(err: &HttpError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::MethodNotAllowed => Self::MethodNotAllowed,
            ErrorKind::InvalidVersion => Self::VersionNotAllowed,
            ErrorKind::UnsupportedMediaType => Self::UnsupportedMediaType,
            ErrorKind::Internal | ErrorKind::Other => Self::Generic,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Event payloads ───────────────────────────────────────────────────────────

/// Payload of `pre_done`, `done` and `after`.
pub struct Completion {
    pub request: Request,
    pub response: Response,
    pub route: Option<RouteHandle>,
    pub error: Option<HttpError>,
}

/// Payload of `mount`.
#[derive(Clone, Debug)]
pub struct Mounted {
    pub route: RouteHandle,
    pub method: Method,
    pub path: String,
    pub versions: Vec<String>,
}

/// A panic caught inside a request's fault boundary.
#[derive(Clone, Debug)]
pub struct Fault {
    message: String,
}

impl Fault {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self { message }
    }

    pub fn message(&self) -> &str { &self.message }

    /// The error a continuation receives in place of this fault. Carries no
    /// part of the panic message; that only goes to the log.
    pub fn to_error(&self) -> HttpError {
        HttpError::fault()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Payload of `uncaught_exception`.
pub struct Uncaught {
    pub request: Request,
    pub response: Response,
    pub route: RouteContext,
    pub fault: Fault,
}

// ── Registration table ───────────────────────────────────────────────────────

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub(crate) type OutcomeHandler = Arc<dyn Fn(Request, Response, HttpError, Next) -> BoxFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct Events {
    mount: Vec<Listener<Mounted>>,
    pre_done: Vec<Listener<Completion>>,
    done: Vec<Listener<Completion>>,
    after: Vec<Listener<Completion>>,
    uncaught: Vec<Listener<Uncaught>>,
    outcomes: HashMap<Outcome, OutcomeHandler>,
}

impl Events {
    pub fn on_mount(&mut self, f: impl Fn(&Mounted) + Send + Sync + 'static) {
        self.mount.push(Arc::new(f));
    }

    pub fn on_pre_done(&mut self, f: impl Fn(&Completion) + Send + Sync + 'static) {
        self.pre_done.push(Arc::new(f));
    }

    pub fn on_done(&mut self, f: impl Fn(&Completion) + Send + Sync + 'static) {
        self.done.push(Arc::new(f));
    }

    pub fn on_after(&mut self, f: impl Fn(&Completion) + Send + Sync + 'static) {
        self.after.push(Arc::new(f));
    }

    pub fn on_uncaught_exception(&mut self, f: impl Fn(&Uncaught) + Send + Sync + 'static) {
        self.uncaught.push(Arc::new(f));
    }

    /// Replaces the default response for `outcome`. The handler must invoke
    /// its continuation for the request to finish; a later registration for
    /// the same outcome replaces an earlier one.
    pub fn on_outcome<F, Fut>(&mut self, outcome: Outcome, f: F)
    where
        F: Fn(Request, Response, HttpError, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: OutcomeHandler =
            Arc::new(move |req: Request, res: Response, err: HttpError, next: Next| -> BoxFuture {
                Box::pin(f(req, res, err, next))
            });
        self.outcomes.insert(outcome, handler);
    }

    pub(crate) fn outcome_handler(&self, outcome: Outcome) -> Option<&OutcomeHandler> {
        self.outcomes.get(&outcome)
    }

    pub(crate) fn emit_mount(&self, event: &Mounted) {
        self.mount.iter().for_each(|f| f(event));
    }

    pub(crate) fn emit_pre_done(&self, event: &Completion) {
        self.pre_done.iter().for_each(|f| f(event));
    }

    pub(crate) fn emit_done(&self, event: &Completion) {
        self.done.iter().for_each(|f| f(event));
    }

    pub(crate) fn emit_after(&self, event: &Completion) {
        self.after.iter().for_each(|f| f(event));
    }

    /// `false` when nobody listens; the caller applies the default.
    pub(crate) fn emit_uncaught(&self, event: &Uncaught) -> bool {
        self.uncaught.iter().for_each(|f| f(event));
        !self.uncaught.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_router_errors() {
        assert_eq!(Outcome::classify(&HttpError::not_found("")), Outcome::NotFound);
        assert_eq!(Outcome::classify(&HttpError::method_not_allowed("")), Outcome::MethodNotAllowed);
        assert_eq!(Outcome::classify(&HttpError::invalid_version("")), Outcome::VersionNotAllowed);
        assert_eq!(
            Outcome::classify(&HttpError::unsupported_media_type("")),
            Outcome::UnsupportedMediaType
        );
        assert_eq!(
            Outcome::classify(&HttpError::new(http::StatusCode::CONFLICT, "")),
            Outcome::Generic
        );
    }

    #[test]
    fn fault_messages_from_payloads() {
        assert_eq!(Fault::from_panic(Box::new("static")).message(), "static");
        assert_eq!(Fault::from_panic(Box::new(String::from("owned"))).message(), "owned");
        assert_eq!(Fault::from_panic(Box::new(7_u8)).message(), "non-string panic payload");
    }

    #[test]
    fn fault_error_does_not_leak_the_payload() {
        let err = Fault::from_panic(Box::new("password=hunter2")).to_error();
        assert_eq!(err.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "internal error");
    }

    #[test]
    fn outcome_registration_replaces() {
        let mut events = Events::default();
        assert!(events.outcome_handler(Outcome::NotFound).is_none());
        events.on_outcome(Outcome::NotFound, |_, _, _, next: Next| async move { next.stop() });
        events.on_outcome(Outcome::NotFound, |_, _, _, next: Next| async move { next.proceed() });
        assert!(events.outcome_handler(Outcome::NotFound).is_some());
        assert!(events.outcome_handler(Outcome::Generic).is_none());
    }
}
