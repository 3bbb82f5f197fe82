//! Error types for the connection pool engine.

use std::time::Duration;

use thiserror::Error;

use crate::connection::PoolId;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Failure to open a physical connection.
///
/// Produced by [`Connection::open`](crate::Connection::open) implementations.
/// The pool never retries within the same call; the failure moves the
/// endpoint to the dead state and is surfaced as the cause of
/// [`PoolError::EndpointDead`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not resolve address: {0}")]
    Resolve(String),

    #[error("{0}")]
    Other(String),
}

/// Refusals and contract violations reported by pools and the manager.
///
/// Checkout has three distinguishable outcomes: a connection, an endpoint
/// that is backing off ([`EndpointDead`](Self::EndpointDead)), or an alive
/// endpoint that is saturated ([`CapacityExceeded`](Self::CapacityExceeded)).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("endpoint {address} is dead, waiting out the retry interval")]
    EndpointDead {
        address: String,
        #[source]
        cause: Option<ConnectError>,
    },

    #[error("connection pool for {address} is at capacity ({capacity})")]
    CapacityExceeded { address: String, capacity: usize },

    #[error("connection pool for {address} is draining, no new checkouts accepted")]
    Draining { address: String },

    #[error("invalid handle: connection is not owned by a live pool ({0})")]
    InvalidHandle(PoolId),

    #[error("no endpoints registered")]
    NoEndpoints,
}

impl PoolError {
    /// The endpoint address this error refers to, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            PoolError::EndpointDead { address, .. }
            | PoolError::CapacityExceeded { address, .. }
            | PoolError::Draining { address } => Some(address),
            PoolError::InvalidHandle(_) | PoolError::NoEndpoints => None,
        }
    }

    /// Whether this refusal came from a failed `open()` in the same call.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, PoolError::EndpointDead { cause: Some(_), .. })
    }
}
