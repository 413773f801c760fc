//! Message envelope carried inside a `Data` packet, and the queue item a
//! dispatch lane actually consumes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{agent::Agent, route::Route};

/// Sentinel reply used to close out a remote `Notify` request/response loop
/// (see `processHandlerMessage` step 6).
pub const ACK: &[u8] = b"ack";

/// Kind of a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Expects a `Response` carrying the same id.
    Request,
    /// Fire-and-forget; no reply is sent to the original caller.
    Notify,
    /// Reply to a `Request`.
    Response,
    /// Server-initiated push to a session.
    Push,
}

/// A decoded application-level message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Present (and meaningful) only for `Request`/`Response`.
    pub id: u32,
    /// Short route string, e.g. `room.join`.
    pub route: String,
    /// Opaque payload, serializer-encoded unless the handler takes raw bytes.
    pub data: Vec<u8>,
}

impl Message {
    /// Parses [`Self::route`] into a structured [`Route`].
    ///
    /// # Errors
    ///
    /// Propagates [`crate::route::RouteError`] from [`Route::parse`].
    pub fn parsed_route(&self) -> Result<Route, crate::route::RouteError> {
        Route::parse(&self.route)
    }
}

/// An inbound message that has been assigned to a dispatch lane, but not yet
/// processed.
///
/// Immutable once enqueued; produced by the agent's packet loop, consumed by
/// exactly one lane worker.
#[derive(Debug, Clone)]
pub struct UnhandledMessage {
    /// The agent that produced this message, used to answer the client.
    pub agent: Arc<Agent>,
    /// The parsed route.
    pub route: Route,
    /// The decoded message.
    pub message: Message,
    /// True when this message arrived from a peer's Sys RPC rather than a
    /// client connection; forwarded into `processHandlerMessage`'s "remote"
    /// flag.
    pub from_remote: bool,
}
