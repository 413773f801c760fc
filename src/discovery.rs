//! Service discovery contract: server descriptors and add/remove events.
//!
//! The discovery backend itself is an external collaborator; this module
//! only defines the shapes it must produce.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Metadata key carrying the server's region.
pub const META_REGION: &str = "region";
/// Metadata key carrying the internal dial host.
pub const META_HOST: &str = "grpc-host";
/// Metadata key carrying the internal dial port.
pub const META_PORT: &str = "grpc-port";
/// Metadata key carrying the externally reachable host, if any.
pub const META_EXTERNAL_HOST: &str = "grpc-external-host";
/// Metadata key carrying the externally reachable port, if any.
pub const META_EXTERNAL_PORT: &str = "grpc-external-port";

/// Identity and addressing metadata for one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Unique server id.
    pub id: String,
    /// Role/server type, e.g. `room`, `connector`.
    pub server_type: String,
    /// Whether this server terminates client connections.
    pub frontend: bool,
    /// Free-form metadata; see the `META_*` keys for the ones this crate
    /// understands.
    pub metadata: HashMap<String, String>,
}

impl Server {
    /// Reads [`META_REGION`].
    #[must_use]
    pub fn region(&self) -> Option<&str> { self.metadata.get(META_REGION).map(String::as_str) }

    /// Reads [`META_HOST`] and [`META_PORT`] as a `host:port` pair.
    #[must_use]
    pub fn internal_addr(&self) -> Option<(String, String)> {
        let host = self.metadata.get(META_HOST)?.clone();
        let port = self.metadata.get(META_PORT)?.clone();
        Some((host, port))
    }

    /// Reads [`META_EXTERNAL_HOST`] and [`META_EXTERNAL_PORT`] as a
    /// `host:port` pair, when both are present.
    #[must_use]
    pub fn external_addr(&self) -> Option<(String, String)> {
        let host = self.metadata.get(META_EXTERNAL_HOST)?.clone();
        let port = self.metadata.get(META_EXTERNAL_PORT)?.clone();
        Some((host, port))
    }
}

/// An add/remove notification from the discovery backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A server joined the cluster, or its metadata changed.
    Added(Server),
    /// A server left the cluster.
    Removed(Server),
}

/// Abstraction over the discovery backend.
///
/// Implementations push [`DiscoveryEvent`]s onto an internal channel and
/// hand the subscriber half back through [`Discovery::subscribe`].
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Subscribes to discovery events; the returned receiver yields every
    /// add/remove notification for the lifetime of the subscription.
    async fn subscribe(&self) -> mpsc::Receiver<DiscoveryEvent>;
}

/// A static, in-memory [`Discovery`] used for tests and single-process
/// demos: the full member list is known up front and never changes.
pub struct StaticDiscovery {
    servers: Vec<Server>,
}

impl StaticDiscovery {
    /// Builds a discovery source that immediately reports `servers` as added
    /// and then never emits further events.
    #[must_use]
    pub const fn new(servers: Vec<Server>) -> Self { Self { servers } }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn subscribe(&self) -> mpsc::Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel(self.servers.len().max(1));
        for server in self.servers.clone() {
            if tx.send(DiscoveryEvent::Added(server)).await.is_err() {
                break;
            }
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(region: Option<&str>, external: bool) -> Server {
        let mut metadata = HashMap::from([
            (META_HOST.to_owned(), "10.0.0.1".to_owned()),
            (META_PORT.to_owned(), "9000".to_owned()),
        ]);
        if let Some(region) = region {
            metadata.insert(META_REGION.to_owned(), region.to_owned());
        }
        if external {
            metadata.insert(META_EXTERNAL_HOST.to_owned(), "1.2.3.4".to_owned());
            metadata.insert(META_EXTERNAL_PORT.to_owned(), "9001".to_owned());
        }
        Server {
            id: "r1".to_owned(),
            server_type: "room".to_owned(),
            frontend: false,
            metadata,
        }
    }

    #[test]
    fn reads_internal_and_external_addrs() {
        let server = server(Some("us"), true);
        assert_eq!(
            server.internal_addr(),
            Some(("10.0.0.1".to_owned(), "9000".to_owned()))
        );
        assert_eq!(
            server.external_addr(),
            Some(("1.2.3.4".to_owned(), "9001".to_owned()))
        );
        assert_eq!(server.region(), Some("us"));
    }

    #[tokio::test]
    async fn static_discovery_replays_initial_members() {
        let discovery = StaticDiscovery::new(vec![server(None, false)]);
        let mut rx = discovery.subscribe().await;
        let event = rx.recv().await.expect("an added event");
        assert!(matches!(event, DiscoveryEvent::Added(_)));
    }
}
