//! connpool — per-endpoint connection pooling for network clients.
//!
//! A client that talks to many remote endpoints (cache nodes, database
//! replicas, HTTP backends) keeps one bounded pool of reusable connections
//! per `host:port` address:
//! - **connection**: the [`Connection`] contract plus the [`PooledConnection`] handle
//! - **pool**: [`EndpointPool`], one endpoint's idle list, capacity and lifecycle
//! - **health**: alive/dead tracking with retry backoff
//! - **manager**: [`PoolManager`], the address → pool registry
//! - **config**: runtime [`PoolConfig`] and the TOML [`ManagerSettings`]
//! - **tcp**: a ready-made TCP [`Connection`]
//!
//! # Architecture
//!
//! ```text
//! client ──checkout(addr)──▶ PoolManager ──▶ EndpointPool(addr)
//!                                │               ├─ idle (most recent first)
//!                                │               ├─ in_flight ≤ capacity
//!                                │               └─ HealthTracker
//!                                └─ ConnectorFactory (once per address)
//!                                       └─ Connector ─▶ Connection::open()
//! ```
//!
//! Connections are moved out on checkout and moved back on checkin, so a
//! handle cannot be returned twice. A pool removed from the manager while
//! connections are out keeps accepting their checkins and is destroyed when
//! the last one comes back.

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod tcp;

pub use config::{DurationSetting, EndpointSettings, ManagerSettings, PoolConfig, PoolSettings};
pub use connection::{Connection, Connector, ConnectorFactory, PoolId, PooledConnection};
pub use error::{ConnectError, PoolError, PoolResult};
pub use health::{HealthState, HealthTracker};
pub use manager::{ManagedConnection, ManagedPool, PoolManager};
pub use pool::{CheckinOutcome, EndpointPool, PoolStats};
pub use tcp::{TcpConnection, TcpConnector, TcpConnectorFactory};
