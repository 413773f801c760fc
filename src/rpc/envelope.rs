//! Peer wire protocol: request/response envelope and its length-prefixed
//! framing over a persistent `TcpStream`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Error as RpcError;

/// Maximum accepted envelope body.
const MAX_ENVELOPE_LEN: u32 = 64 * 1024 * 1024;

/// Failure reading or writing an envelope frame.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The declared frame length exceeded [`MAX_ENVELOPE_LEN`].
    #[error("envelope of {0} bytes exceeds the maximum of {MAX_ENVELOPE_LEN}")]
    FrameTooLarge(u32),
    /// The frame body failed to decode into the expected type.
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

/// Whether an RPC carries the full local handler pipeline (`Sys`) or
/// invokes a typed remote method directly (`User`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcType {
    /// Routed through `processHandlerMessage` via a synthetic agent.
    Sys,
    /// Routed through the remotes registry as a typed method call.
    User,
}

/// A snapshot of the fields of a [`crate::session::Session`] needed by a
/// peer to process a Sys RPC without sharing the session object itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Originating session id.
    pub id: i64,
    /// Bound uid, if any.
    pub uid: Option<String>,
    /// Raw handshake payload.
    pub data: Vec<u8>,
}

/// The unary request carried by every peer RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// `Sys` or `User`.
    pub rpc_type: RpcType,
    /// Id of the frontend that owns the originating session.
    pub frontend_id: String,
    /// Snapshot of the originating session.
    pub session: SessionSnapshot,
    /// Message kind, encoded as its discriminant via
    /// [`crate::message::MessageKind`]'s `Serialize` impl.
    pub kind: crate::message::MessageKind,
    /// Request id, meaningful for `Request`/`Response` kinds.
    pub id: u32,
    /// Short route string.
    pub route: String,
    /// Opaque payload.
    pub data: Vec<u8>,
}

/// The unary response to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Successful payload.
    Data(Vec<u8>),
    /// Structured failure.
    Error(RpcError),
}

pub(crate) async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<(), EnvelopeError>
where
    S: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| EnvelopeError::Decode(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| EnvelopeError::FrameTooLarge(u32::MAX))?;
    if len > MAX_ENVELOPE_LEN {
        return Err(EnvelopeError::FrameTooLarge(len));
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<S, T>(stream: &mut S) -> Result<T, EnvelopeError>
where
    S: tokio::io::AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0_u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_ENVELOPE_LEN {
        return Err(EnvelopeError::FrameTooLarge(len));
    }
    let mut body = vec![0_u8; len as usize];
    stream.read_exact(&mut body).await?;
    let (value, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())
        .map_err(|e| EnvelopeError::Decode(e.to_string()))?;
    Ok(value)
}

/// Writes `request` to `stream`, then reads and returns the matching
/// [`Response`].
///
/// # Errors
///
/// Returns [`EnvelopeError`] on any I/O or (de)serialization failure.
pub async fn call<S>(stream: &mut S, request: &Request) -> Result<Response, EnvelopeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    write_frame(stream, request).await?;
    read_frame(stream).await
}

/// Reads the next [`Request`] from `stream`, the server-side counterpart of
/// [`call`].
///
/// # Errors
///
/// Returns [`EnvelopeError`] on any I/O or (de)serialization failure.
pub async fn read_request<S>(stream: &mut S) -> Result<Request, EnvelopeError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    read_frame(stream).await
}

/// Writes a [`Response`] to `stream`, the server-side counterpart of
/// [`call`].
///
/// # Errors
///
/// Returns [`EnvelopeError`] on any I/O failure.
pub async fn write_response<S>(stream: &mut S, response: &Response) -> Result<(), EnvelopeError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    write_frame(stream, response).await
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    fn sample_request() -> Request {
        Request {
            rpc_type: RpcType::Sys,
            frontend_id: "f1".to_owned(),
            session: SessionSnapshot { id: 1, uid: None, data: Vec::new() },
            kind: crate::message::MessageKind::Request,
            id: 7,
            route: "room.join".to_owned(),
            data: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn round_trips_a_request_response_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await.expect("read request");
            assert_eq!(request.route, "room.join");
            write_response(&mut stream, &Response::Data(b"ok".to_vec()))
                .await
                .expect("write response");
        });

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let response = call(&mut client, &sample_request()).await.expect("call");
        server.await.expect("server task should not panic");
        assert!(matches!(response, Response::Data(data) if data == b"ok"));
    }
}
