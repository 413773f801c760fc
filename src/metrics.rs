//! Pluggable metrics reporting.
//!
//! The metrics sink is an external collaborator per the framework's
//! contract; this module defines the call sites (RPC timing, per-lane
//! processing delay) and a recording reference implementation used by
//! tests.

use std::time::Duration;

/// Receives timing/outcome observations from the RPC client and the
/// dispatch lanes.
///
/// Implementations are shared across every lane and the RPC client, so must
/// be cheap and non-blocking.
pub trait MetricsReporter: Send + Sync {
    /// Records the duration and outcome of an outbound RPC to a peer.
    fn record_rpc(&self, route: &str, duration: Duration, success: bool);

    /// Records the duration a message spent in local (non-RPC) handler
    /// processing.
    fn record_local_process(&self, route: &str, duration: Duration, success: bool);
}

/// A no-op [`MetricsReporter`], the default when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsReporter for NoopMetrics {
    fn record_rpc(&self, _route: &str, _duration: Duration, _success: bool) {}

    fn record_local_process(&self, _route: &str, _duration: Duration, _success: bool) {}
}

/// A set of reporters, invoked in order; lets a binary attach both a
/// real sink and, in tests, a recording sink.
#[derive(Default)]
pub struct MetricsFanout {
    reporters: Vec<Box<dyn MetricsReporter>>,
}

impl MetricsFanout {
    /// Builds an empty fanout.
    #[must_use]
    pub fn new() -> Self { Self { reporters: Vec::new() } }

    /// Adds a reporter.
    #[must_use]
    pub fn with(mut self, reporter: impl MetricsReporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl MetricsReporter for MetricsFanout {
    fn record_rpc(&self, route: &str, duration: Duration, success: bool) {
        for reporter in &self.reporters {
            reporter.record_rpc(route, duration, success);
        }
    }

    fn record_local_process(&self, route: &str, duration: Duration, success: bool) {
        for reporter in &self.reporters {
            reporter.record_local_process(route, duration, success);
        }
    }
}
