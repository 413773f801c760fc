//! Fixed-lane dispatch engine: assigns each session to exactly one lane by
//! `session.id mod N`, so messages for a given session are always processed
//! in FIFO order while different sessions proceed concurrently.

use std::{sync::Arc, time::Instant};

use tokio::sync::mpsc;
use tracing::{Instrument, info_span, warn};

use crate::{
    context::Context,
    error::Error,
    message::{ACK, Message, MessageKind, UnhandledMessage},
    metrics::MetricsReporter,
    pipeline::{Outcome, Pipeline},
    registry::{Descriptor, Registry},
    remote::RemoteService,
    route::Route,
    session::SharedSession,
};

/// Tunables for the dispatch engine.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Number of fixed lanes; `session.id mod lanes` selects one.
    pub lanes: usize,
    /// Bounded queue depth per lane.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self { Self { lanes: 8, queue_capacity: 256 } }
}

/// An enqueue attempt that could not be delivered because the owning lane
/// has shut down; hands the item back so the caller can decide how to fail
/// the originating request.
#[derive(Debug)]
pub struct SubmitError(pub UnhandledMessage);

/// Routes inbound messages to one of a fixed set of worker lanes and runs
/// the local handler pipeline, forwarding non-local routes to the remote
/// service.
pub struct DispatchEngine {
    lanes: Vec<mpsc::Sender<UnhandledMessage>>,
}

impl DispatchEngine {
    /// Spawns `config.lanes` worker tasks, each draining its own bounded,
    /// FIFO queue.
    #[must_use]
    pub fn start(
        config: DispatchConfig,
        registry: Arc<Registry>,
        pipeline: Arc<Pipeline>,
        remote: Arc<RemoteService>,
        local_sv_type: String,
        metrics: Arc<dyn MetricsReporter>,
    ) -> Self {
        let lane_count = config.lanes.max(1);
        let mut lanes = Vec::with_capacity(lane_count);
        for lane_id in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            tokio::spawn(run_lane(
                lane_id,
                rx,
                Arc::clone(&registry),
                Arc::clone(&pipeline),
                Arc::clone(&remote),
                local_sv_type.clone(),
                Arc::clone(&metrics),
            ));
            lanes.push(tx);
        }
        Self { lanes }
    }

    /// Number of lanes this engine was started with.
    #[must_use]
    pub fn lane_count(&self) -> usize { self.lanes.len() }

    /// Enqueues `item` onto the lane owning its session.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] when that lane's worker has already exited.
    pub async fn submit(&self, item: UnhandledMessage) -> Result<(), SubmitError> {
        let idx = self.lane_for(item.agent.session().id());
        let Some(lane) = self.lanes.get(idx) else {
            return Err(SubmitError(item));
        };
        lane.send(item).await.map_err(|e| SubmitError(e.0))
    }

    fn lane_for(&self, session_id: i64) -> usize {
        let lanes = self.lanes.len() as i64;
        usize::try_from(session_id.rem_euclid(lanes)).unwrap_or(0)
    }
}

async fn run_lane(
    lane_id: usize,
    mut rx: mpsc::Receiver<UnhandledMessage>,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    remote: Arc<RemoteService>,
    local_sv_type: String,
    metrics: Arc<dyn MetricsReporter>,
) {
    while let Some(item) = rx.recv().await {
        if item.route.is_local(&local_sv_type) {
            process_local(&item, &registry, &pipeline, &metrics).await;
        } else if let Err(err) = remote.remote_process(&item).await {
            warn!(lane_id, route = %item.route.format(), %err, "remote dispatch failed");
            if item.message.kind == MessageKind::Request {
                item.agent.answer_with_error(item.message.id, err);
            }
        }
    }
}

async fn process_local(
    item: &UnhandledMessage,
    registry: &Registry,
    pipeline: &Pipeline,
    metrics: &Arc<dyn MetricsReporter>,
) {
    let route_short = item.route.short();
    let start = Instant::now();
    let span = info_span!("dispatch.local", route = %route_short, session_id = item.agent.session().id());
    let outcome = invoke(
        registry,
        pipeline,
        &item.route,
        &item.message,
        item.agent.session_arc(),
        item.from_remote,
    )
    .instrument(span)
    .await;
    metrics.record_local_process(&route_short, start.elapsed(), matches!(outcome, Outcome::Success(_)));
    reply(item, outcome);
}

/// Runs the eight-step local handler pipeline: resolve, validate kind,
/// decode (inside the handler itself, per its raw/typed registration),
/// Before, safe-call, force-ack for remote Notify, After, encode/fallback.
///
/// Shared by the packet-loop dispatch path (a live client `Agent` backs
/// `session`) and the peer RPC server (`session` is reconstructed from a
/// [`crate::rpc::envelope::SessionSnapshot`]).
pub async fn invoke(
    registry: &Registry,
    pipeline: &Pipeline,
    route: &Route,
    message: &Message,
    session: SharedSession,
    from_remote: bool,
) -> Outcome {
    let route_short = route.short();
    let Some(descriptor) = registry.get(&route_short) else {
        return Outcome::Failure(Error::not_found(format!("no handler registered for {route_short}")));
    };
    if !descriptor.accepts(message.kind) {
        return Outcome::Failure(Error::bad_request(format!(
            "route {route_short} does not accept {:?} messages",
            message.kind
        )));
    }

    let mut ctx = Context::new(route_short, message.id, session);
    if from_remote {
        ctx = ctx.remote();
    }
    let before_result = pipeline.run_before(&mut ctx, message.data.clone()).await;
    let outcome = match before_result {
        Err(err) => Outcome::Failure(err),
        Ok(input) => safe_call(descriptor, &ctx, input).await,
    };

    let outcome = if from_remote && message.kind == MessageKind::Notify {
        match outcome {
            Outcome::Failure(err) => Outcome::Failure(err),
            Outcome::Success(_) => Outcome::Success(ACK.to_vec()),
        }
    } else {
        outcome
    };

    pipeline.run_after(&ctx, outcome).await
}

/// Invokes the handler on a spawned task so a panic surfaces as an
/// `Err(JoinError)` rather than tearing down the lane worker.
async fn safe_call(descriptor: &Descriptor, ctx: &Context, input: Vec<u8>) -> Outcome {
    let handler = Arc::clone(&descriptor.handler);
    let ctx = ctx.clone();
    let task = tokio::spawn(async move { handler.call(&ctx, input).await });
    match task.await {
        Ok(Ok(bytes)) => Outcome::Success(bytes),
        Ok(Err(err)) => Outcome::Failure(err),
        Err(join_err) => Outcome::Failure(Error::internal(format!("handler panicked: {join_err}"))),
    }
}

fn reply(item: &UnhandledMessage, outcome: Outcome) {
    match item.message.kind {
        MessageKind::Request => match outcome {
            Outcome::Success(bytes) => item.agent.answer(item.message.id, bytes),
            Outcome::Failure(err) => item.agent.answer_with_error(item.message.id, err),
        },
        MessageKind::Notify => {
            if let Outcome::Failure(err) = outcome {
                warn!(route = %item.route.format(), %err, "notify handler failed");
            }
        }
        MessageKind::Response | MessageKind::Push => {
            warn!(kind = ?item.message.kind, "unexpected message kind reached local dispatch");
        }
    }
}

/// Decodes a `Data` packet body into a [`Message`].
///
/// # Errors
///
/// Returns [`crate::error::Error`] when the bytes do not decode.
pub fn decode_message(body: &[u8]) -> Result<Message, Error> {
    bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map(|(message, _)| message)
        .map_err(|e| Error::bad_request(format!("malformed message: {e}")))
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::{
        agent::Agent,
        binding::InMemoryBindingStorage,
        discovery::StaticDiscovery,
        metrics::NoopMetrics,
        registry::{Descriptor, raw},
        route::Route,
        rpc::client::{ClientConfig, RpcClient},
        router::RoundRobinRouter,
        session::Session,
    };

    async fn agent_pair() -> (Arc<Agent>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        (Arc::new(Agent::new(server, Session::new(1))), client)
    }

    fn remote_service() -> Arc<RemoteService> {
        let client = RpcClient::new(
            "f1",
            "us",
            ClientConfig::default(),
            Some(Arc::new(InMemoryBindingStorage::new())),
            Arc::new(NoopMetrics),
        );
        Arc::new(RemoteService::new(
            Arc::new(client),
            Arc::new(RoundRobinRouter::new()),
            Arc::new(StaticDiscovery::new(Vec::new())),
            "room".to_owned(),
        ))
    }

    #[tokio::test]
    async fn unknown_route_answers_not_found() {
        let (agent, mut client) = agent_pair().await;
        let registry = Arc::new(Registry::new());
        let pipeline = Arc::new(Pipeline::new());
        let engine = DispatchEngine::start(
            DispatchConfig { lanes: 1, queue_capacity: 8 },
            registry,
            pipeline,
            remote_service(),
            "room".to_owned(),
            Arc::new(NoopMetrics),
        );

        let item = UnhandledMessage {
            agent: Arc::clone(&agent),
            route: Route::parse("room.missing").expect("route"),
            message: Message { kind: MessageKind::Request, id: 1, route: "room.missing".to_owned(), data: Vec::new() },
            from_remote: false,
        };
        engine.submit(item).await.expect("lane accepts item");

        use futures_util::StreamExt;
        use tokio_util::codec::Framed;
        let mut framed = Framed::new(&mut client, crate::codec::PacketCodec::new());
        let Some(Ok(crate::codec::Packet::Data(bytes))) = framed.next().await else {
            panic!("expected a data packet");
        };
        let (message, _): (Message, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).expect("decode");
        let err: Error = serde_json::from_slice(&message.data).expect("decode error payload");
        assert_eq!(err.code, crate::error::CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn known_route_answers_success() {
        let (agent, mut client) = agent_pair().await;
        let mut registry = Registry::new();
        registry
            .register(
                "room.echo",
                Descriptor {
                    raw_bytes: true,
                    allowed_kinds: Vec::new(),
                    handler: raw(|_ctx, bytes| async move { Ok(bytes) }),
                },
            )
            .expect("register echo");
        let engine = DispatchEngine::start(
            DispatchConfig { lanes: 1, queue_capacity: 8 },
            Arc::new(registry),
            Arc::new(Pipeline::new()),
            remote_service(),
            "room".to_owned(),
            Arc::new(NoopMetrics),
        );

        let item = UnhandledMessage {
            agent: Arc::clone(&agent),
            route: Route::parse("room.echo").expect("route"),
            message: Message { kind: MessageKind::Request, id: 2, route: "room.echo".to_owned(), data: b"hi".to_vec() },
            from_remote: false,
        };
        engine.submit(item).await.expect("lane accepts item");

        use futures_util::StreamExt;
        use tokio_util::codec::Framed;
        let mut framed = Framed::new(&mut client, crate::codec::PacketCodec::new());
        let Some(Ok(crate::codec::Packet::Data(bytes))) = framed.next().await else {
            panic!("expected a data packet");
        };
        let (message, _): (Message, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).expect("decode");
        assert_eq!(message.id, 2);
        assert_eq!(message.data, b"hi");
    }

    #[tokio::test]
    async fn remote_notify_reply_is_forced_to_ack() {
        let (agent, _client) = agent_pair().await;
        let mut registry = Registry::new();
        registry
            .register(
                "room.silent",
                Descriptor {
                    raw_bytes: true,
                    allowed_kinds: Vec::new(),
                    handler: raw(|_ctx, _bytes| async move { Ok(Vec::new()) }),
                },
            )
            .expect("register silent");
        let pipeline = Arc::new(Pipeline::new());
        let route = Route::parse("room.silent").expect("route");
        let message = Message { kind: MessageKind::Notify, id: 0, route: "room.silent".to_owned(), data: Vec::new() };
        let outcome = invoke(&registry, &pipeline, &route, &message, agent.session_arc(), true).await;
        assert!(matches!(outcome, Outcome::Success(ref bytes) if bytes == ACK));
    }

    #[test]
    fn lane_for_is_deterministic_by_session_id() {
        let lanes: Vec<mpsc::Sender<UnhandledMessage>> = (0..4).map(|_| mpsc::channel(1).0).collect();
        let engine = DispatchEngine { lanes };
        assert_eq!(engine.lane_for(5), engine.lane_for(9));
        assert_ne!(engine.lane_for(5), engine.lane_for(6));
    }

    #[test]
    fn decode_message_rejects_garbage() {
        assert!(decode_message(b"not a message").is_err());
    }
}
