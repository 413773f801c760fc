//! Handler service: drives one agent's packet loop, enforces the connection
//! status machine and heartbeat idle timeout, and submits decoded `Data`
//! packets to the dispatch engine.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    agent::Agent,
    codec::Packet,
    dispatch::{self, DispatchEngine},
    local_sessions::LocalSessions,
    message::UnhandledMessage,
    session::Status,
};

#[derive(Serialize)]
struct HandshakeAck {
    code: u32,
    heartbeat_secs: u64,
}

fn handshake_reply(heartbeat_timeout: Duration) -> Vec<u8> {
    let ack = HandshakeAck { code: 0, heartbeat_secs: heartbeat_timeout.as_secs() };
    serde_json::to_vec(&ack).unwrap_or_else(|_| Vec::new())
}

/// Owns the N fixed dispatch lanes and drives agents' packet loops against
/// them, keeping the shared local uid→agent index in sync as sessions bind.
pub struct HandlerService {
    engine: Arc<DispatchEngine>,
    heartbeat_timeout: Duration,
    sessions: Arc<LocalSessions>,
}

impl HandlerService {
    /// Builds a handler service over an already-started `engine`, sharing
    /// `sessions` with whatever serves inbound `sys.pushToUser`/
    /// `sys.kickUser` RPCs for this node.
    #[must_use]
    pub const fn new(engine: Arc<DispatchEngine>, heartbeat_timeout: Duration, sessions: Arc<LocalSessions>) -> Self {
        Self { engine, heartbeat_timeout, sessions }
    }

    /// Runs `agent`'s packet loop until the connection closes, a protocol
    /// violation occurs, or no packet (including a heartbeat) arrives
    /// within the configured idle timeout. Unbinds the session's uid from
    /// the local index, if any, once the loop exits.
    pub async fn serve(&self, agent: Arc<Agent>) {
        loop {
            let next = tokio::time::timeout(self.heartbeat_timeout, agent.next_packet()).await;
            let packet = match next {
                Ok(Some(Ok(packet))) => packet,
                Ok(Some(Err(err))) => {
                    warn!(%err, "packet decode failed, closing connection");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(session_id = agent.session().id(), "heartbeat timeout, closing connection");
                    break;
                }
            };
            if !self.handle_packet(&agent, packet).await {
                break;
            }
        }
        if let Some(uid) = agent.session().uid() {
            self.sessions.unbind(&uid);
        }
    }

    async fn handle_packet(&self, agent: &Arc<Agent>, packet: Packet) -> bool {
        match packet {
            Packet::Handshake(blob) => {
                agent.session().set_handshake(blob);
                if agent.session().transition_to(Status::Handshake).is_err() {
                    return false;
                }
                agent.reply_handshake(handshake_reply(self.heartbeat_timeout));
                true
            }
            Packet::HandshakeAck => agent.session().transition_to(Status::Working).is_ok(),
            Packet::Data(body) => self.handle_data(agent, body).await,
            Packet::Heartbeat => true,
        }
    }

    async fn handle_data(&self, agent: &Arc<Agent>, body: Vec<u8>) -> bool {
        if agent.session().status() != Status::Working {
            warn!(session_id = agent.session().id(), "data packet received before handshake completed");
            return false;
        }
        let message = match dispatch::decode_message(&body) {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = agent.session().id(), %err, "malformed message, closing connection");
                return false;
            }
        };
        let route = match message.parsed_route() {
            Ok(route) => route,
            Err(err) => {
                warn!(session_id = agent.session().id(), %err, "malformed route, closing connection");
                return false;
            }
        };
        let item = UnhandledMessage { agent: Arc::clone(agent), route, message, from_remote: false };
        if self.engine.submit(item).await.is_err() {
            warn!(session_id = agent.session().id(), "dispatch engine lane closed, closing connection");
            return false;
        }
        if let Some(uid) = agent.session().uid() {
            self.sessions.bind(uid, Arc::clone(agent));
        }
        true
    }
}
