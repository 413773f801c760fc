//! Cluster peer transport: peer table, pooled connections, and the reverse
//! operations (push/kick/bind broadcast).

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{Instrument, info_span, warn};

use crate::{
    binding::BindingStorage,
    discovery::Server,
    error::Error as RpcError,
    metrics::MetricsReporter,
    rpc::{
        address::select_address,
        envelope::{self, EnvelopeError, Request, Response, RpcType, SessionSnapshot},
        pool::{self, Pool, PoolConfig},
    },
};

/// Top-level configuration for the RPC client.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Whether new peers dial lazily (on first use) or eagerly (on add).
    pub lazy: bool,
    /// Deadline applied to every outbound call.
    pub request_timeout: Duration,
    /// Per-peer pool sizing/timeouts.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self { Self { lazy: true, request_timeout: Duration::from_secs(5), pool: PoolConfig::default() } }
}

struct PeerEntry {
    addr: String,
    pool_config: PoolConfig,
    pool: tokio::sync::RwLock<Option<Pool>>,
    dial_guard: tokio::sync::Mutex<()>,
}

/// Failure surfaced by an RPC client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No peer entry exists for the requested server id.
    #[error("no connection to server {0}")]
    NoConnection(String),
    /// Dialling or borrowing a pooled connection failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer's reply could not be parsed.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// The call exceeded `request_timeout`.
    #[error("request to {0} timed out")]
    Timeout(String),
    /// A reverse operation (push/kick/bind) had no binding storage and no
    /// explicit target.
    #[error("no binding storage configured")]
    NoBindingStorage,
    /// The transport does not implement this operation.
    #[error("not implemented")]
    NotImplemented,
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        match &err {
            ClientError::NoConnection(_) | ClientError::Transport(_) | ClientError::Timeout(_) => {
                Self::internal(err.to_string())
            }
            ClientError::Envelope(_) => Self::internal(err.to_string()),
            ClientError::NoBindingStorage | ClientError::NotImplemented => Self::internal(err.to_string()),
        }
    }
}

/// The cluster RPC client: one peer table, shared across every lane and the
/// remote service.
pub struct RpcClient {
    local_id: String,
    local_region: String,
    config: ClientConfig,
    peers: DashMap<String, Arc<PeerEntry>>,
    binding: Option<Arc<dyn BindingStorage>>,
    metrics: Arc<dyn MetricsReporter>,
}

impl RpcClient {
    /// Builds a new client for a node identified by `local_id` in
    /// `local_region`.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        local_region: impl Into<String>,
        config: ClientConfig,
        binding: Option<Arc<dyn BindingStorage>>,
        metrics: Arc<dyn MetricsReporter>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            local_region: local_region.into(),
            config,
            peers: DashMap::new(),
            binding,
            metrics,
        }
    }

    /// Registers `server`, eagerly dialling unless [`ClientConfig::lazy`] is
    /// set.
    pub async fn add_server(&self, server: &Server) {
        let Some((host, port)) = select_address(server, &self.local_region) else {
            warn!(server = %server.id, "server has no usable address, skipping add");
            return;
        };
        let addr = format!("{host}:{port}");
        let entry = Arc::new(PeerEntry {
            addr: addr.clone(),
            pool_config: self.config.pool,
            pool: tokio::sync::RwLock::new(None),
            dial_guard: tokio::sync::Mutex::new(()),
        });
        if !self.config.lazy {
            if let Err(err) = ensure_pool(&entry, &addr, self.config.pool, false).await {
                warn!(server = %server.id, %err, "eager dial failed");
            }
        }
        self.peers.insert(server.id.clone(), entry);
    }

    /// Removes `id` from the peer table, dropping (and thereby closing) its
    /// pool exactly once.
    pub fn remove_server(&self, id: &str) { self.peers.remove(id); }

    /// This node's own server id, used as the `frontend_id` on outbound
    /// Sys RPCs.
    #[must_use]
    pub fn local_id(&self) -> &str { &self.local_id }

    async fn pool_for(&self, server: &str) -> Result<Pool, ClientError> {
        let entry = self
            .peers
            .get(server)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| ClientError::NoConnection(server.to_owned()))?;
        ensure_pool(&entry, &entry.addr.clone(), entry.pool_config, self.config.lazy).await
    }

    /// Invokes a peer over the wrapped request/response envelope.
    ///
    /// Wraps tracing tags and enforces [`ClientConfig::request_timeout`];
    /// peer-returned errors with an empty code are canonicalized to the
    /// unknown code.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for transport failures; a peer-side
    /// structured error is returned as `Ok(Err(_))` inside the response
    /// payload semantics of the caller (see [`RpcClient::call`]'s return
    /// type).
    pub async fn call(
        &self,
        rpc_type: RpcType,
        route: &str,
        frontend_id: &str,
        session: SessionSnapshot,
        kind: crate::message::MessageKind,
        id: u32,
        data: Vec<u8>,
        server: &str,
    ) -> Result<Result<Vec<u8>, RpcError>, ClientError> {
        let span = info_span!("rpc.call", local.id = %self.local_id, peer.id = %server, route);
        let start = std::time::Instant::now();
        let result = self
            .call_inner(rpc_type, route, frontend_id, session, kind, id, data, server)
            .instrument(span)
            .await;
        let success = matches!(result, Ok(Ok(_)));
        self.metrics.record_rpc(route, start.elapsed(), success);
        result
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the wire envelope's field list 1:1")]
    async fn call_inner(
        &self,
        rpc_type: RpcType,
        route: &str,
        frontend_id: &str,
        session: SessionSnapshot,
        kind: crate::message::MessageKind,
        id: u32,
        data: Vec<u8>,
        server: &str,
    ) -> Result<Result<Vec<u8>, RpcError>, ClientError> {
        let pool = self.pool_for(server).await?;
        let request = Request {
            rpc_type,
            frontend_id: frontend_id.to_owned(),
            session,
            kind,
            id,
            route: route.to_owned(),
            data,
        };
        let mut conn = pool
            .get()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = tokio::time::timeout(
            self.config.request_timeout,
            envelope::call(&mut *conn, &request),
        )
        .await
        .map_err(|_| ClientError::Timeout(server.to_owned()))??;
        Ok(match response {
            Response::Data(bytes) => Ok(bytes),
            Response::Error(err) => Err(err.canonicalize()),
        })
    }

    /// Generic passthrough bypassing the wrapped envelope, for plain RPCs
    /// outside the framework's request/response shape.
    ///
    /// Shares pool acquisition, timeout enforcement, and metrics/tracing
    /// with [`RpcClient::call`]; unlike `call`, it does not assume the
    /// callee's wire format carries a `{code, errorCode}` pair, so no
    /// error-code canonicalization is applied.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for transport failures or timeout.
    pub async fn call2<Req, Resp>(&self, server: &str, req: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let span = info_span!("rpc.call2", local.id = %self.local_id, peer.id = %server);
        let start = std::time::Instant::now();
        let pool = self.pool_for(server).await?;
        let mut conn = pool.get().await.map_err(|e| ClientError::Transport(e.to_string()))?;
        let call = async {
            envelope::write_frame(&mut *conn, req).await?;
            envelope::read_frame::<_, Resp>(&mut *conn).await
        }
        .instrument(span);
        let result = tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| ClientError::Timeout(server.to_owned()))?
            .map_err(ClientError::from);
        self.metrics.record_rpc("call2", start.elapsed(), result.is_ok());
        result
    }

    /// Not implemented for this transport, matching the source's own
    /// `Send` stub.
    ///
    /// # Errors
    ///
    /// Always returns [`ClientError::NotImplemented`].
    pub fn send(&self, _uid: &str, _bytes: Vec<u8>) -> Result<(), ClientError> {
        Err(ClientError::NotImplemented)
    }

    /// Pushes `data` to `uid`, using `frontend` if supplied, else resolving
    /// it through binding storage.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoBindingStorage`] when neither `frontend` nor
    /// binding storage can resolve a target, or the underlying `call`
    /// error.
    pub async fn send_push(
        &self,
        uid: &str,
        frontend: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let frontend = self.resolve_frontend(uid, frontend).await?;
        self.call(
            RpcType::Sys,
            "sys.pushToUser",
            &self.local_id,
            SessionSnapshot { id: 0, uid: Some(uid.to_owned()), data: Vec::new() },
            crate::message::MessageKind::Notify,
            0,
            data,
            &frontend,
        )
        .await?
        .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Kicks `uid`, always resolving the target frontend via binding
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoBindingStorage`] when no storage is
    /// configured, or the underlying `call` error.
    pub async fn send_kick(&self, uid: &str, reason: Vec<u8>) -> Result<(), ClientError> {
        let frontend = self.resolve_frontend(uid, None).await?;
        self.call(
            RpcType::Sys,
            "sys.kickUser",
            &self.local_id,
            SessionSnapshot { id: 0, uid: Some(uid.to_owned()), data: Vec::new() },
            crate::message::MessageKind::Notify,
            0,
            reason,
            &frontend,
        )
        .await?
        .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Resolves `uid`'s frontend via binding storage and broadcasts a
    /// session-bind notification to it; a silent no-op when the binding is
    /// unknown.
    ///
    /// # Errors
    ///
    /// Returns the underlying `call` error; never errors on an unresolved
    /// binding (that case is a documented no-op).
    pub async fn broadcast_session_bind(&self, uid: &str) -> Result<(), ClientError> {
        let Some(binding) = &self.binding else { return Ok(()) };
        let Some(frontend) = binding.frontend_for(uid).await else { return Ok(()) };
        self.call(
            RpcType::Sys,
            "sys.sessionBindRemote",
            &self.local_id,
            SessionSnapshot { id: 0, uid: Some(uid.to_owned()), data: Vec::new() },
            crate::message::MessageKind::Notify,
            0,
            self.local_id.clone().into_bytes(),
            &frontend,
        )
        .await?
        .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn resolve_frontend(&self, uid: &str, frontend: Option<&str>) -> Result<String, ClientError> {
        if let Some(frontend) = frontend {
            return Ok(frontend.to_owned());
        }
        let binding = self.binding.as_ref().ok_or(ClientError::NoBindingStorage)?;
        binding.frontend_for(uid).await.ok_or(ClientError::NoBindingStorage)
    }
}

async fn ensure_pool(
    entry: &PeerEntry,
    addr: &str,
    config: PoolConfig,
    lazy: bool,
) -> Result<Pool, ClientError> {
    if let Some(pool) = entry.pool.read().await.clone() {
        return Ok(pool);
    }
    let _guard = entry.dial_guard.lock().await;
    if let Some(pool) = entry.pool.read().await.clone() {
        return Ok(pool);
    }
    let pool = pool::build_pool(addr.to_owned(), config, lazy)
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    *entry.pool.write().await = Some(pool.clone());
    Ok(pool)
}
