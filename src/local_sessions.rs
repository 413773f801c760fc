//! Local uid-to-agent index, used to serve inbound push/kick/bind RPCs
//! against this node's own live client connections.

use std::sync::Arc;

use dashmap::DashMap;

use crate::agent::Agent;

/// Maps a bound uid to the live [`Agent`] serving it on this node.
#[derive(Default)]
pub struct LocalSessions {
    by_uid: DashMap<String, Arc<Agent>>,
}

impl LocalSessions {
    /// Builds an empty index.
    #[must_use]
    pub fn new() -> Self { Self { by_uid: DashMap::new() } }

    /// Records that `uid` is now served locally by `agent`.
    pub fn bind(&self, uid: impl Into<String>, agent: Arc<Agent>) { self.by_uid.insert(uid.into(), agent); }

    /// Removes `uid`'s local binding, e.g. on disconnect.
    pub fn unbind(&self, uid: &str) { self.by_uid.remove(uid); }

    /// Looks up the agent currently serving `uid` locally.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<Arc<Agent>> { self.by_uid.get(uid).map(|e| Arc::clone(&e)) }
}
