//! Client-side wire helpers for integration tests: drive the handshake and
//! send/receive application messages over a real framed connection.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use meshgate::{
    codec::{Packet, PacketCodec},
    message::{Message, MessageKind},
};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::AnyError;

/// Connects to `addr` and completes the handshake (client hello, server
/// reply, client ack), returning the framed connection ready to exchange
/// `Data` packets.
///
/// # Errors
///
/// Returns an error if the connection fails, the server closes before
/// replying, or a non-handshake packet arrives where a reply is expected.
pub async fn handshake(addr: SocketAddr) -> Result<Framed<TcpStream, PacketCodec>, AnyError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, PacketCodec::new());
    framed.send(Packet::Handshake(b"client-hello".to_vec())).await?;
    match framed.next().await {
        Some(Ok(Packet::Handshake(_))) => Ok(()),
        Some(Ok(other)) => Err(format!("expected a handshake reply, got {other:?}")),
        Some(Err(err)) => Err(err.to_string()),
        None => Err("connection closed before a handshake reply arrived".to_owned()),
    }?;
    framed.send(Packet::HandshakeAck).await?;
    Ok(framed)
}

/// Sends `message` as a `Data` packet.
///
/// # Errors
///
/// Returns an error if encoding or the underlying send fails.
pub async fn send_message(framed: &mut Framed<TcpStream, PacketCodec>, message: &Message) -> Result<(), AnyError> {
    let body = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    framed.send(Packet::Data(body)).await?;
    Ok(())
}

/// Sends a `Request`-kind message over `route` carrying `data`.
///
/// # Errors
///
/// Returns an error if encoding or the underlying send fails.
pub async fn send_request(
    framed: &mut Framed<TcpStream, PacketCodec>,
    id: u32,
    route: &str,
    data: Vec<u8>,
) -> Result<(), AnyError> {
    send_message(framed, &Message { kind: MessageKind::Request, id, route: route.to_owned(), data }).await
}

/// Reads the next packet and decodes it as a [`Message`], failing if it is
/// not a `Data` packet.
///
/// # Errors
///
/// Returns an error if the connection closed, decoding fails, or a
/// non-`Data` packet arrived.
pub async fn recv_message(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<Message, AnyError> {
    match framed.next().await {
        Some(Ok(Packet::Data(bytes))) => {
            let (message, _): (Message, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            Ok(message)
        }
        Some(Ok(other)) => Err(format!("expected a data packet, got {other:?}").into()),
        Some(Err(err)) => Err(err.to_string().into()),
        None => Err("connection closed before a reply arrived".into()),
    }
}
