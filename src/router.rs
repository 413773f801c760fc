//! Selects which peer should serve a remote call when the caller did not
//! pin an explicit target.

use async_trait::async_trait;

use crate::{discovery::Server, message::Message, route::Route, rpc::envelope::RpcType};

/// Picks a target server for a remote invocation.
///
/// Implementations may inspect the message's metadata, e.g. for uid-based
/// affinity, but must choose from `candidates`.
#[async_trait]
pub trait Router: Send + Sync {
    /// Chooses one of `candidates` to serve `message` on `route`.
    ///
    /// Returns `None` when no candidate is suitable.
    async fn pick<'a>(
        &self,
        rpc_type: RpcType,
        route: &Route,
        message: &Message,
        candidates: &'a [Server],
    ) -> Option<&'a Server>;
}

/// Deterministic round-robin [`Router`] used by tests and as a sane default.
#[derive(Default)]
pub struct RoundRobinRouter {
    next: std::sync::atomic::AtomicUsize,
}

impl RoundRobinRouter {
    /// Builds a new round-robin router starting at index 0.
    #[must_use]
    pub const fn new() -> Self { Self { next: std::sync::atomic::AtomicUsize::new(0) } }
}

#[async_trait]
impl Router for RoundRobinRouter {
    async fn pick<'a>(
        &self,
        _rpc_type: RpcType,
        _route: &Route,
        _message: &Message,
        candidates: &'a [Server],
    ) -> Option<&'a Server> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % candidates.len();
        candidates.get(idx)
    }
}
