//! Connection capability consumed from the embedding client.
//!
//! The pool knows nothing about the transport. A client plugs in three
//! pieces:
//!
//! - [`Connection`]: one physical connection that can be opened and closed.
//! - [`Connector`]: builds unopened connections for a single endpoint.
//! - [`ConnectorFactory`]: builds the connector for a new endpoint pool.
//!   The manager calls it exactly once per address.
//!
//! Connections handed out by a pool are wrapped in [`PooledConnection`],
//! which carries the last-active timestamp and the owning pool's
//! [`PoolId`]. The id is a plain identifier, never a pointer, so a stale
//! handle can be rejected instead of dereferenced.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::PoolConfig;
use crate::error::ConnectError;

/// Identifier of an endpoint pool, unique for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// A physical connection to one endpoint.
///
/// `open()` is the only blocking call the pool makes, and it is always
/// made without holding any pool lock.
pub trait Connection: Send + 'static {
    /// Establish the connection.
    fn open(&mut self) -> Result<(), ConnectError>;

    /// Tear the connection down. Called once before the pool drops it.
    fn close(&mut self) {}
}

/// Builds unopened connections for one endpoint.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn create(&self) -> Self::Conn;
}

impl<F, C> Connector for F
where
    F: Fn() -> C + Send + Sync + 'static,
    C: Connection,
{
    type Conn = C;

    fn create(&self) -> C {
        self()
    }
}

/// Builds the [`Connector`] for a newly created endpoint pool.
///
/// `config` is the configuration the pool is created with (capacity,
/// timeouts) and `slot` is the pool's creation index within its manager.
/// Connections built by the returned connector should use the timeouts in
/// `config`.
pub trait ConnectorFactory: Send + Sync + 'static {
    type Connector: Connector;

    fn create_connector(&self, address: &str, config: &PoolConfig, slot: usize) -> Self::Connector;
}

impl<F, K> ConnectorFactory for F
where
    F: Fn(&str, &PoolConfig, usize) -> K + Send + Sync + 'static,
    K: Connector,
{
    type Connector = K;

    fn create_connector(&self, address: &str, config: &PoolConfig, slot: usize) -> K {
        self(address, config, slot)
    }
}

/// A connection checked out of an endpoint pool.
///
/// Dereferences to the wrapped connection. Hand it back with
/// [`EndpointPool::checkin`](crate::EndpointPool::checkin) or
/// [`PoolManager::checkin`](crate::PoolManager::checkin); it is moved on
/// return, so the same checkout cannot be returned twice.
pub struct PooledConnection<C> {
    conn: C,
    pool: PoolId,
    address: Arc<str>,
    created_at: Instant,
    last_active: Instant,
    use_count: u64,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(conn: C, pool: PoolId, address: Arc<str>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            pool,
            address,
            created_at: now,
            last_active: now,
            use_count: 1,
        }
    }

    pub(crate) fn close(&mut self) {
        self.conn.close();
    }
}

impl<C> PooledConnection<C> {
    /// Id of the pool this connection must be returned to.
    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    /// Endpoint address this connection points at.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// When the connection was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last returned to the pool (or opened).
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Refresh the last-active timestamp.
    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    /// Number of checkouts this connection has served.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub(crate) fn reused(&mut self) {
        self.use_count += 1;
    }

    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool)
            .field("address", &self.address)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}
