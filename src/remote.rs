//! Local-to-remote routing: resolves a non-local route to a peer via
//! [`Router`]/[`Discovery`] and forwards it over the RPC client.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::{
    discovery::{Discovery, DiscoveryEvent, Server},
    error::Error,
    message::{MessageKind, UnhandledMessage},
    router::Router,
    rpc::{
        client::RpcClient,
        envelope::{RpcType, SessionSnapshot},
    },
};

/// Forwards messages whose route targets a non-local server type to the
/// right peer, and keeps a live server-type index fed by discovery events.
pub struct RemoteService {
    client: Arc<RpcClient>,
    router: Arc<dyn Router>,
    local_sv_type: String,
    servers_by_type: Arc<DashMap<String, Vec<Server>>>,
}

impl RemoteService {
    /// Builds the service and spawns a background task that applies
    /// `discovery`'s events to both the RPC client's peer table and this
    /// service's server-type index.
    #[must_use]
    pub fn new(
        client: Arc<RpcClient>,
        router: Arc<dyn Router>,
        discovery: Arc<dyn Discovery>,
        local_sv_type: String,
    ) -> Self {
        let servers_by_type: Arc<DashMap<String, Vec<Server>>> = Arc::new(DashMap::new());
        let client_for_task = Arc::clone(&client);
        let servers_for_task = Arc::clone(&servers_by_type);
        tokio::spawn(async move {
            let mut rx = discovery.subscribe().await;
            while let Some(event) = rx.recv().await {
                match event {
                    DiscoveryEvent::Added(server) => {
                        client_for_task.add_server(&server).await;
                        servers_for_task.entry(server.server_type.clone()).or_default().push(server);
                    }
                    DiscoveryEvent::Removed(server) => {
                        client_for_task.remove_server(&server.id);
                        if let Some(mut list) = servers_for_task.get_mut(&server.server_type) {
                            list.retain(|s| s.id != server.id);
                        }
                    }
                }
            }
        });
        Self { client, router, local_sv_type, servers_by_type }
    }

    /// Resolves `item`'s route to a peer and forwards it as a `Sys` RPC,
    /// replying to the originating agent when the message was a `Request`.
    ///
    /// # Errors
    ///
    /// Returns an error only when no candidate server could be resolved at
    /// all; call failures against a resolved peer are reported to the
    /// originating agent directly and this returns `Ok(())`.
    pub async fn remote_process(&self, item: &UnhandledMessage) -> Result<(), Error> {
        let sv_type = item.route.resolved_sv_type(&self.local_sv_type).to_owned();
        let candidates = self.servers_by_type.get(&sv_type).map(|v| v.clone()).unwrap_or_default();
        let Some(server) = self.router.pick(RpcType::Sys, &item.route, &item.message, &candidates).await else {
            return Err(Error::not_found(format!("no server available for type {sv_type}")));
        };
        let server_id = server.id.clone();

        let session = SessionSnapshot {
            id: item.agent.session().id(),
            uid: item.agent.session().uid(),
            data: item.agent.session().handshake(),
        };

        let result = self
            .client
            .call(
                RpcType::Sys,
                &item.route.short(),
                self.client.local_id(),
                session,
                item.message.kind,
                item.message.id,
                item.message.data.clone(),
                &server_id,
            )
            .await;

        match (item.message.kind, result) {
            (MessageKind::Request, Ok(Ok(bytes))) => item.agent.answer(item.message.id, bytes),
            (MessageKind::Request, Ok(Err(err))) => item.agent.answer_with_error(item.message.id, err),
            (MessageKind::Request, Err(err)) => item.agent.answer_with_error(item.message.id, err.into()),
            (_, Ok(Err(err))) => warn!(route = %item.route.format(), %err, "remote notify failed"),
            (_, Err(err)) => warn!(route = %item.route.format(), %err, "remote notify transport failure"),
            (_, Ok(Ok(_))) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::{
        agent::Agent,
        binding::InMemoryBindingStorage,
        discovery::StaticDiscovery,
        message::Message,
        metrics::NoopMetrics,
        route::Route,
        rpc::{
            client::ClientConfig,
            envelope::{Response, read_request, write_response},
        },
        router::RoundRobinRouter,
        session::Session,
    };

    fn server(id: &str, port: u16) -> Server {
        let mut metadata = HashMap::new();
        metadata.insert("grpc-host".to_owned(), "127.0.0.1".to_owned());
        metadata.insert("grpc-port".to_owned(), port.to_string());
        Server { id: id.to_owned(), server_type: "room".to_owned(), frontend: false, metadata }
    }

    async fn agent_pair() -> (Arc<Agent>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        (Arc::new(Agent::new(stream, Session::new(1))), client)
    }

    #[tokio::test]
    async fn forwards_a_request_and_relays_the_peer_reply() {
        let peer_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let peer_addr = peer_listener.local_addr().expect("addr");
        let peer_task = tokio::spawn(async move {
            let (mut stream, _) = peer_listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await.expect("read request");
            assert_eq!(request.route, "room.join");
            write_response(&mut stream, &Response::Data(b"welcome".to_vec())).await.expect("write response");
        });

        let rpc_client = Arc::new(RpcClient::new(
            "f1",
            "us",
            ClientConfig::default(),
            Some(Arc::new(InMemoryBindingStorage::new())),
            Arc::new(NoopMetrics),
        ));
        let discovery = Arc::new(StaticDiscovery::new(vec![server("r1", peer_addr.port())]));
        let remote = RemoteService::new(
            rpc_client,
            Arc::new(RoundRobinRouter::new()),
            discovery,
            "connector".to_owned(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (agent, mut client_stream) = agent_pair().await;
        let item = UnhandledMessage {
            agent,
            route: Route::parse("room.room.join").expect("route"),
            message: Message { kind: MessageKind::Request, id: 9, route: "room.room.join".to_owned(), data: Vec::new() },
            from_remote: false,
        };
        remote.remote_process(&item).await.expect("remote process should succeed");
        peer_task.await.expect("peer task should not panic");

        use futures_util::StreamExt;
        use tokio_util::codec::Framed;
        let mut framed = Framed::new(&mut client_stream, crate::codec::PacketCodec::new());
        let Some(Ok(crate::codec::Packet::Data(bytes))) = framed.next().await else {
            panic!("expected a data packet");
        };
        let (message, _): (Message, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).expect("decode");
        assert_eq!(message.id, 9);
        assert_eq!(message.data, b"welcome");
    }

    #[tokio::test]
    async fn no_candidate_server_is_reported_as_an_error() {
        let rpc_client = Arc::new(RpcClient::new(
            "f1",
            "us",
            ClientConfig::default(),
            None,
            Arc::new(NoopMetrics),
        ));
        let remote = RemoteService::new(
            rpc_client,
            Arc::new(RoundRobinRouter::new()),
            Arc::new(StaticDiscovery::new(Vec::new())),
            "connector".to_owned(),
        );
        let (agent, _client) = agent_pair().await;
        let item = UnhandledMessage {
            agent,
            route: Route::parse("room.room.join").expect("route"),
            message: Message { kind: MessageKind::Request, id: 1, route: "room.room.join".to_owned(), data: Vec::new() },
            from_remote: false,
        };
        assert!(remote.remote_process(&item).await.is_err());
    }
}
