//! Uid-to-frontend binding lookup used to route pushes, kicks, and bind
//! broadcasts.
//!
//! Persistent binding storage is an external collaborator; this module
//! defines the trait plus a minimal in-memory reference implementation for
//! tests and single-process demos.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

/// Resolves which frontend currently owns a uid's session.
#[async_trait]
pub trait BindingStorage: Send + Sync {
    /// Returns the frontend id bound to `uid`, if any.
    async fn frontend_for(&self, uid: &str) -> Option<String>;

    /// Records that `uid` is now owned by `frontend_id`.
    async fn bind(&self, uid: &str, frontend_id: &str);
}

/// An in-memory [`BindingStorage`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryBindingStorage {
    bindings: DashMap<String, String>,
}

impl InMemoryBindingStorage {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self { Self { bindings: DashMap::new() } }
}

#[async_trait]
impl BindingStorage for InMemoryBindingStorage {
    async fn frontend_for(&self, uid: &str) -> Option<String> {
        self.bindings.get(uid).map(|v| v.clone())
    }

    async fn bind(&self, uid: &str, frontend_id: &str) {
        self.bindings.insert(uid.to_owned(), frontend_id.to_owned());
    }
}

/// Notified when a peer reports binding a uid to one of its own frontend
/// ids, via `sys.sessionBindRemote`.
pub trait RemoteBindingListener: Send + Sync {
    /// Called with the bound `uid` and the frontend id (`fid`) that now owns
    /// its session.
    fn on_user_bind(&self, uid: &str, fid: &str);
}

/// An ordered collection of [`RemoteBindingListener`]s, built during startup
/// and fanned out to on every `sys.sessionBindRemote` notification.
#[derive(Default)]
pub struct RemoteBindingListeners {
    listeners: Vec<Arc<dyn RemoteBindingListener>>,
}

impl RemoteBindingListeners {
    /// Builds an empty collection.
    #[must_use]
    pub fn new() -> Self { Self { listeners: Vec::new() } }

    /// Registers `listener`, to be notified after any already-registered one.
    pub fn add(&mut self, listener: Arc<dyn RemoteBindingListener>) { self.listeners.push(listener); }

    /// Notifies every registered listener, in registration order.
    pub fn notify_all(&self, uid: &str, fid: &str) {
        for listener in &self.listeners {
            listener.on_user_bind(uid, fid);
        }
    }
}
