//! Per-peer connection pool: fixed init/max capacity, dial/idle timeouts,
//! and read/write deadlines, grounded on the same `bb8`-backed pooling
//! pattern used elsewhere in this codebase for pooled connections.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Tunables for one peer's connection pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Connections to open eagerly when the peer is added (ignored when
    /// `lazy` is true).
    pub init_cap: u32,
    /// Maximum live connections.
    pub max_cap: u32,
    /// Timeout for establishing a new TCP connection.
    pub dial_timeout: Duration,
    /// How long an idle connection may sit in the pool before being closed.
    pub idle_timeout: Duration,
    /// Deadline applied to each read on a checked-out connection.
    pub read_timeout: Duration,
    /// Deadline applied to each write on a checked-out connection.
    pub write_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            init_cap: 1,
            max_cap: 8,
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3600),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// A `bb8` connection manager that dials a fixed peer address.
///
/// The source hardcodes its pool timeouts rather than honouring the
/// configured dial timeout; this implementation deliberately resolves that
/// inconsistency by always dialling under [`PoolConfig::dial_timeout`] (see
/// `DESIGN.md`).
#[derive(Debug, Clone)]
pub struct PeerConnectionManager {
    addr: String,
    dial_timeout: Duration,
}

impl PeerConnectionManager {
    /// Builds a manager that dials `addr`, enforcing `dial_timeout` on each
    /// connection attempt.
    #[must_use]
    pub const fn new(addr: String, dial_timeout: Duration) -> Self { Self { addr, dial_timeout } }
}

#[async_trait]
impl bb8::ManageConnection for PeerConnectionManager {
    type Connection = TcpStream;
    type Error = std::io::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.peek(&mut [0_u8; 1]).await.map(|_| ())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool { false }
}

/// A peer's pool, built from [`PoolConfig`].
pub type Pool = bb8::Pool<PeerConnectionManager>;

/// Builds the pool for one peer, honouring `lazy` by never awaiting
/// eager-dial completion (`bb8` always dials lazily under the hood; eager
/// pre-warming is approximated by filling to `init_cap` immediately).
///
/// # Errors
///
/// Returns the connection manager's error if the pool cannot reach
/// `init_cap` eagerly (never happens when `lazy` is true).
pub async fn build_pool(
    addr: String,
    config: PoolConfig,
    lazy: bool,
) -> Result<Pool, std::io::Error> {
    let manager = PeerConnectionManager::new(addr, config.dial_timeout);
    bb8::Pool::builder()
        .min_idle(Some(if lazy { 0 } else { config.init_cap }))
        .max_size(config.max_cap)
        .idle_timeout(Some(config.idle_timeout))
        .connection_timeout(config.dial_timeout)
        .build(manager)
        .await
}
