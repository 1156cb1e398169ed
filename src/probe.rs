//! Instrumentation probes.
//!
//! Four probes bracket every chain run:
//!
//! ```text
//! route-start
//!   handler-start(h0) … handler-done(h0)
//!   handler-start(h1) … handler-done(h1)
//! route-done
//! ```
//!
//! A probe is only built when someone is listening: either a [`ProbeSink`] is
//! installed on the server, or the `relay::probe` target is enabled at
//! `TRACE`. Otherwise firing one is a branch and nothing else.

use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};
use tracing::{Level, trace};

#[derive(Debug)]
pub enum Probe<'a> {
    RouteStart {
        server: &'a str,
        route: &'a str,
        request_id: u64,
        method: &'a Method,
        target: &'a str,
        headers: &'a HeaderMap,
    },
    HandlerStart {
        server: &'a str,
        route: &'a str,
        handler: &'a str,
        request_id: u64,
    },
    HandlerDone {
        server: &'a str,
        route: &'a str,
        handler: &'a str,
        request_id: u64,
    },
    RouteDone {
        server: &'a str,
        route: &'a str,
        request_id: u64,
        status: StatusCode,
        headers: &'a HeaderMap,
    },
}

/// Receives every probe fired by the server.
pub trait ProbeSink: Send + Sync + 'static {
    fn fire(&self, probe: &Probe<'_>);
}

#[derive(Clone)]
pub(crate) struct Probes {
    server: Arc<str>,
    sink: Option<Arc<dyn ProbeSink>>,
}

impl Probes {
    pub(crate) fn new(server: Arc<str>, sink: Option<Arc<dyn ProbeSink>>) -> Self {
        Self { server, sink }
    }

    pub(crate) fn server(&self) -> &str { &self.server }

    pub(crate) fn enabled(&self) -> bool {
        self.sink.is_some() || tracing::enabled!(target: "relay::probe", Level::TRACE)
    }

    /// Builds the probe with `build` and fires it, if anyone is listening.
    pub(crate) fn fire<F>(&self, build: F)
    where
        F: FnOnce(&str, &mut dyn FnMut(&Probe<'_>)),
    {
        if !self.enabled() {
            return;
        }
        build(&self.server, &mut |probe: &Probe<'_>| {
            trace!(target: "relay::probe", ?probe);
            if let Some(sink) = &self.sink {
                sink.fire(probe);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Count(Mutex<usize>);

    impl ProbeSink for Count {
        fn fire(&self, _probe: &Probe<'_>) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn disabled_probes_never_build() {
        let probes = Probes::new(Arc::from("svc"), None);
        let mut built = false;
        probes.fire(|_, _| built = true);
        // Only true when a global subscriber enabled the trace target.
        assert_eq!(built, tracing::enabled!(target: "relay::probe", Level::TRACE));
    }

    #[test]
    fn sink_receives_probes() {
        let sink = Arc::new(Count::default());
        let probes = Probes::new(Arc::from("svc"), Some(sink.clone()));
        probes.fire(|server, emit| {
            emit(&Probe::HandlerStart { server, route: "pre", handler: "h", request_id: 1 })
        });
        assert_eq!(*sink.0.lock().unwrap(), 1);
    }
}
