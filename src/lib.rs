//! A clustered, session-oriented game server framework: a fixed-lane
//! session dispatch engine, local-vs-remote handler routing, and a cluster
//! RPC client/server pair for forwarding calls to peers.

pub mod agent;
pub mod binding;
pub mod codec;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod handler_service;
pub mod local_sessions;
pub mod message;
pub mod metrics;
pub mod module;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod route;
pub mod router;
pub mod rpc;
pub mod serializer;
pub mod session;
