//! Peer-to-local dispatch: accepts peer connections and serves `Sys`/`User`
//! RPCs against this node's local registries.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::{
    binding::RemoteBindingListeners,
    context::Context,
    dispatch,
    error::Error,
    local_sessions::LocalSessions,
    message::Message,
    pipeline::{Outcome, Pipeline},
    registry::{AlreadyDefined, Descriptor, Registry, raw},
    route::Route,
    rpc::envelope::{self, Request, Response, RpcType, SessionSnapshot},
    session::Session,
};

/// Registers the built-in `sys.pushToUser`, `sys.kickUser`, and
/// `sys.sessionBindRemote` handlers used by [`crate::rpc::client::RpcClient`]'s
/// reverse operations.
///
/// # Errors
///
/// Returns [`AlreadyDefined`] if a caller already registered one of these
/// routes.
pub fn register_builtin_sys_handlers(
    registry: &mut Registry,
    sessions: Arc<LocalSessions>,
    bind_listeners: Arc<RemoteBindingListeners>,
) -> Result<(), AlreadyDefined> {
    let push_sessions = Arc::clone(&sessions);
    registry.register(
        "sys.pushToUser",
        Descriptor {
            raw_bytes: true,
            allowed_kinds: Vec::new(),
            handler: raw(move |ctx: Context, data: Vec<u8>| {
                let sessions = Arc::clone(&push_sessions);
                async move {
                    let Some(uid) = ctx.session.uid() else {
                        return Err(Error::not_found("session not found"));
                    };
                    let Some(agent) = sessions.get(&uid) else {
                        return Err(Error::not_found("session not found"));
                    };
                    agent.push(data);
                    Ok(Vec::new())
                }
            }),
        },
    )?;

    let kick_sessions = Arc::clone(&sessions);
    registry.register(
        "sys.kickUser",
        Descriptor {
            raw_bytes: true,
            allowed_kinds: Vec::new(),
            handler: raw(move |ctx: Context, data: Vec<u8>| {
                let sessions = Arc::clone(&kick_sessions);
                async move {
                    let Some(uid) = ctx.session.uid() else {
                        return Err(Error::not_found("session not found"));
                    };
                    let Some(agent) = sessions.get(&uid) else {
                        return Err(Error::not_found("session not found"));
                    };
                    let reason = (!data.is_empty()).then(|| String::from_utf8_lossy(&data).into_owned());
                    agent.kick(reason);
                    Ok(Vec::new())
                }
            }),
        },
    )?;

    registry.register(
        "sys.sessionBindRemote",
        Descriptor {
            raw_bytes: true,
            allowed_kinds: Vec::new(),
            handler: raw(move |ctx: Context, data: Vec<u8>| {
                let listeners = Arc::clone(&bind_listeners);
                async move {
                    if let Some(uid) = ctx.session.uid() {
                        let fid = String::from_utf8_lossy(&data).into_owned();
                        listeners.notify_all(&uid, &fid);
                    }
                    Ok(Vec::new())
                }
            }),
        },
    )?;

    Ok(())
}

fn synthetic_session(snapshot: &SessionSnapshot) -> Session {
    let session = Session::new(snapshot.id);
    if let Some(uid) = &snapshot.uid {
        session.bind(uid.clone());
    }
    session.set_handshake(snapshot.data.clone());
    session
}

/// Serves peer RPCs: `Sys` through the local handler pipeline (via a
/// synthetic session reconstructed from the envelope), `User` as a direct
/// typed-method call against the remotes registry.
pub struct RpcServer {
    sys_registry: Arc<Registry>,
    sys_pipeline: Arc<Pipeline>,
    user_registry: Arc<Registry>,
}

impl RpcServer {
    /// Builds a server dispatching `Sys` RPCs through `sys_registry`/
    /// `sys_pipeline` and `User` RPCs through `user_registry`.
    #[must_use]
    pub const fn new(sys_registry: Arc<Registry>, sys_pipeline: Arc<Pipeline>, user_registry: Arc<Registry>) -> Self {
        Self { sys_registry, sys_pipeline, user_registry }
    }

    /// Accepts connections on `listener` until it errors, spawning one task
    /// per peer connection; each connection serves requests until the peer
    /// closes it or sends a malformed frame.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_connection(stream).await {
                            warn!(%addr, %err, "peer connection ended");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "peer listener accept failed, stopping");
                    break;
                }
            }
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> Result<(), envelope::EnvelopeError> {
        info!("peer connection accepted");
        loop {
            let request = envelope::read_request(&mut stream).await?;
            let response = self.handle(request).await;
            envelope::write_response(&mut stream, &response).await?;
        }
    }

    async fn handle(&self, request: Request) -> Response {
        match request.rpc_type {
            RpcType::Sys => self.handle_sys(&request).await,
            RpcType::User => self.handle_user(&request).await,
        }
    }

    async fn handle_sys(&self, request: &Request) -> Response {
        let route = match Route::parse(&request.route) {
            Ok(route) => route,
            Err(err) => return Response::Error(Error::bad_request(err.to_string())),
        };
        let message = Message {
            kind: request.kind,
            id: request.id,
            route: request.route.clone(),
            data: request.data.clone(),
        };
        let session = Arc::new(synthetic_session(&request.session));
        let outcome =
            dispatch::invoke(&self.sys_registry, &self.sys_pipeline, &route, &message, session, true).await;
        outcome_to_response(outcome)
    }

    async fn handle_user(&self, request: &Request) -> Response {
        let route_short = match Route::parse(&request.route) {
            Ok(route) => route.short(),
            Err(err) => return Response::Error(Error::bad_request(err.to_string())),
        };
        let Some(descriptor) = self.user_registry.get(&route_short) else {
            return Response::Error(Error::not_found(format!("no remote registered for {route_short}")));
        };
        if !descriptor.accepts(request.kind) {
            return Response::Error(Error::bad_request(format!(
                "remote {route_short} does not accept {:?} messages",
                request.kind
            )));
        }
        let session = Arc::new(synthetic_session(&request.session));
        let ctx = Context::new(route_short, request.id, session).remote();
        match descriptor.handler.call(&ctx, request.data.clone()).await {
            Ok(bytes) => Response::Data(bytes),
            Err(err) => Response::Error(err),
        }
    }
}

fn outcome_to_response(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Success(bytes) => Response::Data(bytes),
        Outcome::Failure(err) => Response::Error(err),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        message::MessageKind,
        registry::typed,
        rpc::envelope::{RpcType, SessionSnapshot, call},
    };

    fn session_snapshot() -> SessionSnapshot { SessionSnapshot { id: 1, uid: Some("u1".to_owned()), data: Vec::new() } }

    async fn run_server(server: Arc<RpcServer>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(server.serve(listener));
        addr
    }

    #[tokio::test]
    async fn sys_request_dispatches_to_the_local_handler() {
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
        let server = Arc::new(RpcServer::new(
            Arc::new(registry),
            Arc::new(Pipeline::new()),
            Arc::new(Registry::new()),
        ));
        let addr = run_server(server).await;

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = Request {
            rpc_type: RpcType::Sys,
            frontend_id: "f1".to_owned(),
            session: session_snapshot(),
            kind: MessageKind::Request,
            id: 1,
            route: "room.echo".to_owned(),
            data: b"hi".to_vec(),
        };
        let response = call(&mut conn, &request).await.expect("call");
        assert!(matches!(response, Response::Data(bytes) if bytes == b"hi"));
    }

    #[tokio::test]
    async fn user_request_bypasses_the_pipeline() {
        let mut user_registry = Registry::new();
        user_registry
            .register(
                "room.greet",
                Descriptor {
                    raw_bytes: false,
                    allowed_kinds: Vec::new(),
                    handler: typed(|_ctx, name: String| async move { Ok(format!("hi {name}")) }),
                },
            )
            .expect("register greet");
        let server = Arc::new(RpcServer::new(
            Arc::new(Registry::new()),
            Arc::new(Pipeline::new()),
            Arc::new(user_registry),
        ));
        let addr = run_server(server).await;

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = Request {
            rpc_type: RpcType::User,
            frontend_id: "f1".to_owned(),
            session: session_snapshot(),
            kind: MessageKind::Request,
            id: 1,
            route: "room.greet".to_owned(),
            data: serde_json::to_vec("sam").expect("encode"),
        };
        let response = call(&mut conn, &request).await.expect("call");
        let Response::Data(bytes) = response else { panic!("expected data") };
        let decoded: String = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded, "hi sam");
    }

    #[tokio::test]
    async fn push_to_user_reaches_the_locally_bound_agent() {
        let mut registry = Registry::new();
        let sessions = Arc::new(LocalSessions::new());
        register_builtin_sys_handlers(&mut registry, Arc::clone(&sessions), Arc::new(RemoteBindingListeners::new()))
            .expect("register builtins");
        let server = Arc::new(RpcServer::new(Arc::new(registry), Arc::new(Pipeline::new()), Arc::new(Registry::new())));
        let addr = run_server(server).await;

        let client_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let client_addr = client_listener.local_addr().expect("addr");
        let client_stream = TcpStream::connect(client_addr).await.expect("connect");
        let (server_stream, _) = client_listener.accept().await.expect("accept");
        let agent = Arc::new(crate::agent::Agent::new(server_stream, Session::new(1)));
        sessions.bind("u1", Arc::clone(&agent));

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = Request {
            rpc_type: RpcType::Sys,
            frontend_id: "f1".to_owned(),
            session: session_snapshot(),
            kind: MessageKind::Notify,
            id: 0,
            route: "sys.pushToUser".to_owned(),
            data: b"hello there".to_vec(),
        };
        let response = call(&mut conn, &request).await.expect("call");
        assert!(matches!(response, Response::Data(_)));

        use futures_util::StreamExt;
        use tokio_util::codec::Framed;
        let mut framed = Framed::new(client_stream, crate::codec::PacketCodec::new());
        let Some(Ok(crate::codec::Packet::Data(bytes))) = framed.next().await else {
            panic!("expected a pushed data packet");
        };
        let (message, _): (Message, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).expect("decode");
        assert_eq!(message.data, b"hello there");
    }

    #[tokio::test]
    async fn push_to_an_unbound_user_answers_session_not_found() {
        let mut registry = Registry::new();
        let sessions = Arc::new(LocalSessions::new());
        register_builtin_sys_handlers(&mut registry, sessions, Arc::new(RemoteBindingListeners::new()))
            .expect("register builtins");
        let server = Arc::new(RpcServer::new(Arc::new(registry), Arc::new(Pipeline::new()), Arc::new(Registry::new())));
        let addr = run_server(server).await;

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = Request {
            rpc_type: RpcType::Sys,
            frontend_id: "f1".to_owned(),
            session: session_snapshot(),
            kind: MessageKind::Notify,
            id: 0,
            route: "sys.pushToUser".to_owned(),
            data: Vec::new(),
        };
        let response = call(&mut conn, &request).await.expect("call");
        let Response::Error(err) = response else { panic!("expected an error response") };
        assert_eq!(err.code, crate::error::CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn kick_an_unbound_user_answers_session_not_found() {
        let mut registry = Registry::new();
        let sessions = Arc::new(LocalSessions::new());
        register_builtin_sys_handlers(&mut registry, sessions, Arc::new(RemoteBindingListeners::new()))
            .expect("register builtins");
        let server = Arc::new(RpcServer::new(Arc::new(registry), Arc::new(Pipeline::new()), Arc::new(Registry::new())));
        let addr = run_server(server).await;

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = Request {
            rpc_type: RpcType::Sys,
            frontend_id: "f1".to_owned(),
            session: session_snapshot(),
            kind: MessageKind::Notify,
            id: 0,
            route: "sys.kickUser".to_owned(),
            data: Vec::new(),
        };
        let response = call(&mut conn, &request).await.expect("call");
        let Response::Error(err) = response else { panic!("expected an error response") };
        assert_eq!(err.code, crate::error::CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn session_bind_remote_fans_out_to_registered_listeners() {
        struct Recording(std::sync::Mutex<Vec<(String, String)>>);
        impl crate::binding::RemoteBindingListener for Recording {
            fn on_user_bind(&self, uid: &str, fid: &str) {
                self.0.lock().expect("lock").push((uid.to_owned(), fid.to_owned()));
            }
        }

        let recorder = Arc::new(Recording(std::sync::Mutex::new(Vec::new())));
        let mut bind_listeners = RemoteBindingListeners::new();
        bind_listeners.add(Arc::clone(&recorder) as Arc<dyn crate::binding::RemoteBindingListener>);

        let mut registry = Registry::new();
        register_builtin_sys_handlers(&mut registry, Arc::new(LocalSessions::new()), Arc::new(bind_listeners))
            .expect("register builtins");
        let server = Arc::new(RpcServer::new(Arc::new(registry), Arc::new(Pipeline::new()), Arc::new(Registry::new())));
        let addr = run_server(server).await;

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = Request {
            rpc_type: RpcType::Sys,
            frontend_id: "f1".to_owned(),
            session: session_snapshot(),
            kind: MessageKind::Notify,
            id: 0,
            route: "sys.sessionBindRemote".to_owned(),
            data: b"f1".to_vec(),
        };
        let response = call(&mut conn, &request).await.expect("call");
        assert!(matches!(response, Response::Data(_)));
        assert_eq!(recorder.0.lock().expect("lock").as_slice(), [("u1".to_owned(), "f1".to_owned())]);
    }
}
