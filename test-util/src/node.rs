//! Boots one in-process node using exactly the wiring `meshgated` uses,
//! minus the `Module` lifecycle ceremony that integration tests don't need:
//! both listeners are bound and serving before [`TestNode::start`] returns.

use std::{net::SocketAddr, sync::Arc};

use meshgate::{
    agent::Agent,
    binding::{InMemoryBindingStorage, RemoteBindingListeners},
    config::AppConfig,
    discovery::{Server, StaticDiscovery},
    dispatch::DispatchEngine,
    handler_service::HandlerService,
    local_sessions::LocalSessions,
    metrics::NoopMetrics,
    pipeline::Pipeline,
    registry::{Descriptor, Registry},
    remote::RemoteService,
    router::RoundRobinRouter,
    rpc::{
        client::RpcClient,
        server::{RpcServer, register_builtin_sys_handlers},
    },
    session::{Session, SessionIdGenerator},
};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::AnyError;

/// A running node: its two bound addresses and the tasks serving them.
///
/// Dropping a `TestNode` aborts both accept loops; it does not wait for
/// in-flight connections to finish.
pub struct TestNode {
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
    client_task: JoinHandle<()>,
    peer_task: JoinHandle<()>,
}

impl TestNode {
    /// The address to dial for client (`Agent`) connections.
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr { self.client_addr }

    /// The address peers should dial for `Sys`/`User` RPCs.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr { self.peer_addr }

    /// Starts a node from `config` (its `bind`/`peer_bind` are overridden to
    /// ephemeral loopback ports regardless of what `config` carries).
    ///
    /// `local_routes` is registered against the node's own dispatch engine,
    /// serving connections accepted on [`Self::client_addr`]. `remote_routes`
    /// is registered alongside the built-in `sys.*` handlers against the
    /// peer RPC server, serving Sys RPCs forwarded from other nodes' dispatch
    /// engines — mirroring `meshgated`'s split between a node's local
    /// registry and its peer-facing one. `peers` seeds this node's discovery
    /// source so its own dispatch engine can forward non-local routes.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener fails to bind, `config` fails
    /// validation, or a route in `local_routes`/`remote_routes` is
    /// registered twice.
    pub async fn start(
        mut config: AppConfig,
        local_routes: Vec<(&str, Descriptor)>,
        remote_routes: Vec<(&str, Descriptor)>,
        peers: Vec<Server>,
    ) -> Result<Self, AnyError> {
        config.bind = "127.0.0.1:0".to_owned();
        config.peer_bind = "127.0.0.1:0".to_owned();
        config.validate()?;

        let client_listener = TcpListener::bind(&config.bind).await?;
        let client_addr = client_listener.local_addr()?;
        let peer_listener = TcpListener::bind(&config.peer_bind).await?;
        let peer_addr = peer_listener.local_addr()?;

        let metrics = Arc::new(NoopMetrics);
        let sessions = Arc::new(LocalSessions::new());
        let ids = Arc::new(SessionIdGenerator::new());

        let mut registry = Registry::new();
        for (route, descriptor) in local_routes {
            registry.register(route, descriptor)?;
        }
        let mut sys_registry = Registry::new();
        register_builtin_sys_handlers(&mut sys_registry, Arc::clone(&sessions), Arc::new(RemoteBindingListeners::new()))?;
        for (route, descriptor) in remote_routes {
            sys_registry.register(route, descriptor)?;
        }

        let rpc_client = Arc::new(RpcClient::new(
            config.server_id.clone(),
            config.server_region.clone(),
            config.rpc_client_config(),
            Some(Arc::new(InMemoryBindingStorage::new())),
            Arc::clone(&metrics),
        ));
        let discovery = Arc::new(StaticDiscovery::new(peers));
        let remote = Arc::new(RemoteService::new(
            Arc::clone(&rpc_client),
            Arc::new(RoundRobinRouter::new()),
            discovery,
            config.server_type.clone(),
        ));

        let dispatch_engine = Arc::new(DispatchEngine::start(
            config.dispatch_config(),
            Arc::new(registry),
            Arc::new(Pipeline::new()),
            Arc::clone(&remote),
            config.server_type.clone(),
            Arc::clone(&metrics),
        ));
        let handler_service = Arc::new(HandlerService::new(
            dispatch_engine,
            config.heartbeat_timeout(),
            Arc::clone(&sessions),
        ));

        let client_task = tokio::spawn(async move {
            loop {
                match client_listener.accept().await {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&handler_service);
                        let agent = Arc::new(Agent::new(stream, Session::new(ids.next_id())));
                        tokio::spawn(async move { handler.serve(agent).await });
                    }
                    Err(_) => break,
                }
            }
        });

        let rpc_server = Arc::new(RpcServer::new(
            Arc::new(sys_registry),
            Arc::new(Pipeline::new()),
            Arc::new(Registry::new()),
        ));
        let peer_task = tokio::spawn(async move { rpc_server.serve(peer_listener).await });

        Ok(Self { client_addr, peer_addr, client_task, peer_task })
    }

    /// Builds a discovery [`Server`] entry pointing at this node's peer
    /// listener, suitable for handing to another node's `peers` list.
    #[must_use]
    pub fn as_discovery_server(&self, id: &str, server_type: &str) -> Server {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("grpc-host".to_owned(), self.peer_addr.ip().to_string());
        metadata.insert("grpc-port".to_owned(), self.peer_addr.port().to_string());
        Server { id: id.to_owned(), server_type: server_type.to_owned(), frontend: false, metadata }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.client_task.abort();
        self.peer_task.abort();
    }
}
