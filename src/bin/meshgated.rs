use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use meshgate::{
    agent::Agent,
    binding::{InMemoryBindingStorage, RemoteBindingListeners},
    config::AppConfig,
    discovery::StaticDiscovery,
    dispatch::DispatchEngine,
    handler_service::HandlerService,
    local_sessions::LocalSessions,
    metrics::NoopMetrics,
    module::{Module, ModuleRegistry},
    pipeline::Pipeline,
    registry::Registry,
    remote::RemoteService,
    router::RoundRobinRouter,
    rpc::{
        client::RpcClient,
        server::{RpcServer, register_builtin_sys_handlers},
    },
    session::{Session, SessionIdGenerator},
};
use tokio::{net::TcpListener, sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Flattens [`AppConfig`] behind a thin CLI parser; every field's CLI flag
/// and environment-variable default is already carried on the config
/// struct itself.
#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    config: AppConfig,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    }
}

/// Accepts client connections and hands each one to the handler service.
struct ClientAcceptor {
    bind: String,
    handler: Arc<HandlerService>,
    ids: Arc<SessionIdGenerator>,
    listener: AsyncMutex<Option<TcpListener>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Module for ClientAcceptor {
    fn name(&self) -> &str { "client-acceptor" }

    async fn init(&self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(&self.bind).await?;
        info!(bind = %self.bind, "client listener bound");
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn after_init(&self) -> Result<(), anyhow::Error> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("client listener was not bound during init"))?;
        let handler = Arc::clone(&self.handler);
        let ids = Arc::clone(&self.ids);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let handler = Arc::clone(&handler);
                        let agent = Arc::new(Agent::new(stream, Session::new(ids.next_id())));
                        tokio::spawn(async move { handler.serve(agent).await });
                        debug!(%addr, "client connection accepted");
                    }
                    Err(err) => {
                        error!(%err, "client listener accept failed, stopping");
                        break;
                    }
                }
            }
        });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn before_shutdown(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

/// Accepts peer connections and serves `Sys`/`User` RPCs against them.
struct PeerAcceptor {
    bind: String,
    server: Arc<RpcServer>,
    listener: AsyncMutex<Option<TcpListener>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Module for PeerAcceptor {
    fn name(&self) -> &str { "peer-acceptor" }

    async fn init(&self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(&self.bind).await?;
        info!(bind = %self.bind, "peer listener bound");
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn after_init(&self) -> Result<(), anyhow::Error> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("peer listener was not bound during init"))?;
        let server = Arc::clone(&self.server);
        let task = tokio::spawn(async move { server.serve(listener).await });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn before_shutdown(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let metrics = Arc::new(NoopMetrics);
    let sessions = Arc::new(LocalSessions::new());
    let ids = Arc::new(SessionIdGenerator::new());

    let local_registry = Registry::new();
    let mut sys_registry = Registry::new();
    register_builtin_sys_handlers(&mut sys_registry, Arc::clone(&sessions), Arc::new(RemoteBindingListeners::new()))?;

    let rpc_client = Arc::new(RpcClient::new(
        config.server_id.clone(),
        config.server_region.clone(),
        config.rpc_client_config(),
        Some(Arc::new(InMemoryBindingStorage::new())),
        Arc::clone(&metrics),
    ));
    let discovery = Arc::new(StaticDiscovery::new(Vec::new()));
    let remote = Arc::new(RemoteService::new(
        Arc::clone(&rpc_client),
        Arc::new(RoundRobinRouter::new()),
        discovery,
        config.server_type.clone(),
    ));

    let dispatch_engine = Arc::new(DispatchEngine::start(
        config.dispatch_config(),
        Arc::new(local_registry),
        Arc::new(Pipeline::new()),
        Arc::clone(&remote),
        config.server_type.clone(),
        Arc::clone(&metrics),
    ));
    let handler_service =
        Arc::new(HandlerService::new(dispatch_engine, config.heartbeat_timeout(), Arc::clone(&sessions)));

    let rpc_server = Arc::new(RpcServer::new(Arc::new(sys_registry), Arc::new(Pipeline::new()), Arc::new(Registry::new())));

    let mut modules = ModuleRegistry::new();
    modules.register_system(ClientAcceptor {
        bind: config.bind.clone(),
        handler: handler_service,
        ids,
        listener: AsyncMutex::new(None),
        task: AsyncMutex::new(None),
    });
    modules.register_system(PeerAcceptor {
        bind: config.peer_bind.clone(),
        server: rpc_server,
        listener: AsyncMutex::new(None),
        task: AsyncMutex::new(None),
    });

    modules.start_all().await?;
    info!(server_id = %config.server_id, server_type = %config.server_type, "meshgated started");

    shutdown_signal().await;
    info!("shutdown signal received");
    modules.shutdown_all().await;
    Ok(())
}
