//! Per-invocation propagation context threaded through the pipeline and
//! into every handler call.

use std::{collections::HashMap, time::Instant};

use crate::session::SharedSession;

/// Carries the propagation keys a handler invocation needs: start time,
/// route, request id, and the owning session.
#[derive(Clone)]
pub struct Context {
    /// Short route string the invocation resolved to.
    pub route: String,
    /// Request id, meaningful only for `Request`/`Response` message kinds.
    pub request_id: u32,
    /// When this invocation began, used for request-timeout and metrics.
    pub start: Instant,
    /// The session this invocation is running on behalf of.
    pub session: SharedSession,
    /// True when this invocation arrived through a peer Sys RPC rather than
    /// directly from a client connection.
    pub from_remote: bool,
    /// Free-form metadata middleware can read or annotate.
    pub metadata: HashMap<String, String>,
}

impl Context {
    /// Builds a new context for an invocation on `session`.
    #[must_use]
    pub fn new(route: impl Into<String>, request_id: u32, session: SharedSession) -> Self {
        Self {
            route: route.into(),
            request_id,
            start: Instant::now(),
            session,
            from_remote: false,
            metadata: HashMap::new(),
        }
    }

    /// Marks this context as originating from a peer Sys RPC.
    #[must_use]
    pub const fn remote(mut self) -> Self {
        self.from_remote = true;
        self
    }

    /// Elapsed time since [`Self::start`].
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration { self.start.elapsed() }
}
