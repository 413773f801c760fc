//! Layered startup configuration: CLI flags override environment variables
//! override the built-in defaults below, all merged through `ortho_config`.

use std::time::Duration;

use clap::Args;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{dispatch::DispatchConfig, rpc::{client::ClientConfig, pool::PoolConfig}};

/// A configuration value that fails eager startup validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `dispatch_lanes` was zero.
    #[error("dispatch_lanes must be at least 1")]
    ZeroLanes,
    /// `rpc_pool_max_cap` was smaller than `rpc_pool_init_cap`.
    #[error("rpc_pool_max_cap ({max_cap}) must be >= rpc_pool_init_cap ({init_cap})")]
    PoolCapacityInverted {
        /// Configured initial capacity.
        init_cap: u32,
        /// Configured maximum capacity.
        max_cap: u32,
    },
    /// `server_id` was empty.
    #[error("server_id must not be empty")]
    EmptyServerId,
    /// `server_type` was empty.
    #[error("server_type must not be empty")]
    EmptyServerType,
}

/// Process-wide startup configuration.
///
/// Every field has a built-in default so the process can start from
/// environment variables alone; `server_id` is the one value operators are
/// expected to always override per node.
#[derive(Args, OrthoConfig, Serialize, Deserialize, Debug, Clone)]
#[ortho_config(prefix = "MESHGATE_")]
pub struct AppConfig {
    /// Address this node accepts client connections on.
    #[ortho_config(default = "0.0.0.0:4450".to_string())]
    #[arg(long, default_value_t = String::from("0.0.0.0:4450"))]
    pub bind: String,

    /// Address this node accepts peer RPC connections on.
    #[ortho_config(default = "0.0.0.0:4451".to_string())]
    #[arg(long, default_value_t = String::from("0.0.0.0:4451"))]
    pub peer_bind: String,

    /// This node's unique server id, advertised to discovery.
    #[ortho_config(default = String::new())]
    #[arg(long, default_value_t = String::new())]
    pub server_id: String,

    /// This node's server type (role), e.g. `connector` or `room`.
    #[ortho_config(default = "room".to_string())]
    #[arg(long, default_value_t = String::from("room"))]
    pub server_type: String,

    /// This node's region, used for NAT-traversal address selection.
    #[ortho_config(default = String::new())]
    #[arg(long, default_value_t = String::new())]
    pub server_region: String,

    /// Number of fixed dispatch lanes.
    #[ortho_config(default = 8)]
    #[arg(long, default_value_t = 8)]
    pub dispatch_lanes: usize,

    /// Bounded queue depth per dispatch lane.
    #[ortho_config(default = 256)]
    #[arg(long, default_value_t = 256)]
    pub dispatch_queue_capacity: usize,

    /// Seconds of inactivity before a connection is considered dead.
    #[ortho_config(default = 60)]
    #[arg(long, default_value_t = 60)]
    pub heartbeat_timeout_secs: u64,

    /// `cluster.rpc.client.grpc.dialtimeout`: milliseconds allowed to dial
    /// a peer.
    #[ortho_config(default = 5000)]
    #[arg(long, default_value_t = 5000)]
    pub rpc_client_dial_timeout_ms: u64,

    /// `cluster.rpc.client.grpc.lazyconnection`: dial on first use instead
    /// of eagerly when a peer is added.
    #[ortho_config(default = true)]
    #[arg(long, default_value_t = true)]
    pub rpc_client_lazy_connection: bool,

    /// `cluster.rpc.client.grpc.requesttimeout`: milliseconds allowed for a
    /// single RPC.
    #[ortho_config(default = 5000)]
    #[arg(long, default_value_t = 5000)]
    pub rpc_client_request_timeout_ms: u64,

    /// `cluster.rpc.client.grpcpool.initcap`: connections opened eagerly
    /// per peer.
    #[ortho_config(default = 1)]
    #[arg(long, default_value_t = 1)]
    pub rpc_pool_init_cap: u32,

    /// `cluster.rpc.client.grpcpool.maxcap`: maximum live connections per
    /// peer.
    #[ortho_config(default = 8)]
    #[arg(long, default_value_t = 8)]
    pub rpc_pool_max_cap: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4450".to_owned(),
            peer_bind: "0.0.0.0:4451".to_owned(),
            server_id: String::new(),
            server_type: "room".to_owned(),
            server_region: String::new(),
            dispatch_lanes: 8,
            dispatch_queue_capacity: 256,
            heartbeat_timeout_secs: 60,
            rpc_client_dial_timeout_ms: 5000,
            rpc_client_lazy_connection: true,
            rpc_client_request_timeout_ms: 5000,
            rpc_pool_init_cap: 1,
            rpc_pool_max_cap: 8,
        }
    }
}

impl AppConfig {
    /// Validates cross-field invariants that a derive-level default cannot
    /// express, failing startup fast rather than at first use.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch_lanes == 0 {
            return Err(ConfigError::ZeroLanes);
        }
        if self.rpc_pool_max_cap < self.rpc_pool_init_cap {
            return Err(ConfigError::PoolCapacityInverted {
                init_cap: self.rpc_pool_init_cap,
                max_cap: self.rpc_pool_max_cap,
            });
        }
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::EmptyServerId);
        }
        if self.server_type.trim().is_empty() {
            return Err(ConfigError::EmptyServerType);
        }
        Ok(())
    }

    /// Derives the dispatch engine's tunables.
    #[must_use]
    pub const fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig { lanes: self.dispatch_lanes, queue_capacity: self.dispatch_queue_capacity }
    }

    /// Derives the RPC client's tunables.
    #[must_use]
    pub const fn rpc_client_config(&self) -> ClientConfig {
        ClientConfig {
            lazy: self.rpc_client_lazy_connection,
            request_timeout: Duration::from_millis(self.rpc_client_request_timeout_ms),
            pool: self.pool_config(),
        }
    }

    /// Derives the per-peer connection pool's tunables.
    #[must_use]
    pub const fn pool_config(&self) -> PoolConfig {
        let dial_timeout = Duration::from_millis(self.rpc_client_dial_timeout_ms);
        PoolConfig {
            init_cap: self.rpc_pool_init_cap,
            max_cap: self.rpc_pool_max_cap,
            dial_timeout,
            idle_timeout: Duration::from_secs(3600),
            read_timeout: dial_timeout,
            write_timeout: dial_timeout,
        }
    }

    /// Derives the heartbeat idle timeout.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration { Duration::from_secs(self.heartbeat_timeout_secs) }
}
