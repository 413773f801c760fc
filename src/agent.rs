//! Binds one client connection to one session: read/write tasks and the
//! outbound (response/push/kick) channel.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::{SinkExt, StreamExt, stream::SplitStream};
use tokio::{net::TcpStream, sync::Mutex as AsyncMutex, sync::mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    codec::{CodecError, Packet, PacketCodec},
    error::Error,
    message::{Message, MessageKind},
    session::{Session, SharedSession},
};

/// Outbound work item handed to the write task.
#[derive(Debug)]
enum Outbound {
    Response { id: u32, result: Result<Vec<u8>, Error> },
    Push(Vec<u8>),
    Kick { reason: Option<String> },
    HandshakeReply(Vec<u8>),
}

fn encode_message(message: &Message) -> Vec<u8> {
    bincode::serde::encode_to_vec(message, bincode::config::standard())
        .unwrap_or_else(|_| Vec::new())
}

/// Owns one accepted connection: its session, a handle to send frames out,
/// and last-activity bookkeeping for heartbeat enforcement.
#[derive(Debug)]
pub struct Agent {
    session: SharedSession,
    reader: AsyncMutex<SplitStream<Framed<TcpStream, PacketCodec>>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    last_activity_millis: AtomicI64,
}

impl Agent {
    /// Splits `stream` into read/write halves, spawns the write task, and
    /// returns the agent bound to `session`.
    #[must_use]
    pub fn new(stream: TcpStream, session: Session) -> Self {
        let framed = Framed::new(stream, PacketCodec::new());
        let (sink, stream) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_write_task(sink, outbound_rx));
        Self {
            session: std::sync::Arc::new(session),
            reader: AsyncMutex::new(stream),
            outbound_tx,
            last_activity_millis: AtomicI64::new(now_millis()),
        }
    }

    /// The bound session.
    #[must_use]
    pub fn session(&self) -> &Session { &self.session }

    /// A cheaply-cloned handle to the bound session, for contexts that must
    /// outlive the agent reference (e.g. a dispatch lane's [`crate::context::Context`]).
    #[must_use]
    pub fn session_arc(&self) -> SharedSession { std::sync::Arc::clone(&self.session) }

    /// Pulls the next inbound packet, bumping last-activity on success.
    ///
    /// Driven externally by the handler service's packet loop; only one
    /// caller should poll a given agent at a time, which the internal lock
    /// enforces defensively.
    pub async fn next_packet(&self) -> Option<Result<Packet, CodecError>> {
        let mut reader = self.reader.lock().await;
        let item = reader.next().await;
        if matches!(item, Some(Ok(_))) {
            self.touch();
        }
        item
    }

    /// Updates the last-activity timestamp to now.
    pub fn touch(&self) { self.last_activity_millis.store(now_millis(), Ordering::Relaxed); }

    /// Answers a pending request with a success payload.
    pub fn answer(&self, id: u32, data: Vec<u8>) {
        self.send_outbound(Outbound::Response { id, result: Ok(data) });
    }

    /// Answers a pending request with a structured error.
    pub fn answer_with_error(&self, id: u32, err: Error) {
        self.send_outbound(Outbound::Response { id, result: Err(err) });
    }

    /// Pushes a server-initiated message to the client.
    pub fn push(&self, data: Vec<u8>) { self.send_outbound(Outbound::Push(data)); }

    /// Closes the connection, optionally carrying a reason to the client
    /// before the socket is torn down.
    pub fn kick(&self, reason: Option<String>) { self.send_outbound(Outbound::Kick { reason }); }

    /// Sends the server's handshake reply blob.
    pub fn reply_handshake(&self, data: Vec<u8>) { self.send_outbound(Outbound::HandshakeReply(data)); }

    fn send_outbound(&self, item: Outbound) {
        if self.outbound_tx.send(item).is_err() {
            debug!(session_id = self.session.id(), "write task already gone");
        }
    }
}

async fn run_write_task(
    mut sink: futures_util::stream::SplitSink<Framed<TcpStream, PacketCodec>, Packet>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound_rx.recv().await {
        let (packet, should_close) = match item {
            Outbound::Response { id, result } => {
                let message = response_message(id, result);
                (Packet::Data(encode_message(&message)), false)
            }
            Outbound::Push(data) => {
                let message = Message {
                    kind: MessageKind::Push,
                    id: 0,
                    route: String::new(),
                    data,
                };
                (Packet::Data(encode_message(&message)), false)
            }
            Outbound::Kick { reason } => {
                let message = Message {
                    kind: MessageKind::Notify,
                    id: 0,
                    route: String::new(),
                    data: reason.unwrap_or_default().into_bytes(),
                };
                (Packet::Data(encode_message(&message)), true)
            }
            Outbound::HandshakeReply(data) => (Packet::Handshake(data), false),
        };
        if let Err(err) = sink.send(packet).await {
            warn!(%err, "failed to write outbound frame, closing connection");
            break;
        }
        if should_close {
            break;
        }
    }
    let _ = sink.close().await;
}

fn response_message(id: u32, result: Result<Vec<u8>, Error>) -> Message {
    match result {
        Ok(data) => Message {
            kind: MessageKind::Response,
            id,
            route: String::new(),
            data,
        },
        Err(err) => {
            let payload = serde_json::to_vec(&err).unwrap_or_else(|_| Vec::new());
            Message {
                kind: MessageKind::Response,
                id,
                route: String::new(),
                data: payload,
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::message::MessageKind;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");
        let client = TcpStream::connect(addr).await.expect("client should connect");
        let (server, _) = listener.accept().await.expect("server should accept");
        (server, client)
    }

    #[tokio::test]
    async fn answer_round_trips_through_the_codec() {
        let (server_stream, client_stream) = connected_pair().await;
        let agent = Agent::new(server_stream, Session::new(1));
        agent.answer(7, b"hi".to_vec());

        let mut client = Framed::new(client_stream, PacketCodec::new());
        let Some(Ok(Packet::Data(bytes))) = client.next().await else {
            panic!("expected a data packet");
        };
        let (message, _): (Message, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .expect("message should decode");
        assert_eq!(message.kind, MessageKind::Response);
        assert_eq!(message.id, 7);
        assert_eq!(message.data, b"hi");
    }

    #[tokio::test]
    async fn handshake_reply_round_trips_as_a_handshake_packet() {
        let (server_stream, client_stream) = connected_pair().await;
        let agent = Agent::new(server_stream, Session::new(1));
        agent.reply_handshake(b"ok".to_vec());

        let mut client = Framed::new(client_stream, PacketCodec::new());
        let Some(Ok(Packet::Handshake(bytes))) = client.next().await else {
            panic!("expected a handshake packet");
        };
        assert_eq!(bytes, b"ok");
    }

    #[tokio::test]
    async fn kick_closes_the_write_side() {
        let (server_stream, client_stream) = connected_pair().await;
        let agent = Agent::new(server_stream, Session::new(1));
        agent.kick(Some("bye".to_owned()));

        let mut client = Framed::new(client_stream, PacketCodec::new());
        assert!(client.next().await.is_some());
        assert!(client.next().await.is_none());
    }
}
