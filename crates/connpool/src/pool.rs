//! Endpoint pool — bounded connection pool for a single address.
//!
//! # Architecture
//!
//! ```text
//! checkout()
//!   → draining?                        → Draining
//!   → dead and retry interval pending? → EndpointDead (no I/O)
//!   → idle connection available?       → pop most recent, in_flight += 1
//!   → idle + in_flight < capacity?     → reserve slot, open() outside lock
//!       → open failed                  → release slot, mark dead, EndpointDead
//!   → otherwise                        → CapacityExceeded
//!
//! checkin(conn, keep)
//!   → draining  → close, destroy the pool when the last one comes back
//!   → keep and alive → push to the front of the idle list
//!   → otherwise → close
//!   → maintenance interval elapsed → reap expired idle connections
//! ```
//!
//! All bookkeeping happens under one `parking_lot::Mutex`. Opening and
//! closing connections happen after the lock is released, so a slow
//! connect cannot stall checkouts that would be served from the idle list.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::PoolConfig;
use crate::connection::{Connection, Connector, PoolId, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::health::{Admission, HealthTracker};

/// What happened to a connection handed back with [`EndpointPool::checkin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// Queued on the idle list for reuse.
    Idle,
    /// Closed and dropped.
    Discarded,
    /// Closed, and it was the last outstanding connection of a draining
    /// pool. The pool is now destroyed.
    PoolDestroyed,
}

/// Point-in-time statistics for one endpoint pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub address: String,
    pub slot: usize,
    pub alive: bool,
    pub draining: bool,
    pub idle: usize,
    pub in_flight: usize,
    /// 0 = unbounded.
    pub capacity: usize,
    /// Checkouts served since the pool was created.
    pub total_used: u64,
    /// Checkouts served since the last [`EndpointPool::reset_current_used`].
    pub current_used: u64,
    /// Physical connections opened.
    pub opened: u64,
    /// Failed `open()` attempts.
    pub connect_failures: u64,
    /// Idle connections evicted by reaping.
    pub reaped: u64,
}

struct PoolState<C> {
    /// Most recently returned at the front.
    idle: VecDeque<PooledConnection<C>>,
    /// Checked out, including slots reserved for an in-progress `open()`.
    in_flight: usize,
    capacity: usize,
    health: HealthTracker,
    idle_ttl: Option<Duration>,
    check_interval: Duration,
    last_check: Instant,
    destroy_pending: bool,
    destroyed: bool,
    total_used: u64,
    current_used: u64,
    opened: u64,
    connect_failures: u64,
    reaped: u64,
}

impl<C> PoolState<C> {
    fn at_capacity(&self) -> bool {
        self.capacity > 0 && self.in_flight + self.idle.len() >= self.capacity
    }

    fn served(&mut self) {
        self.in_flight += 1;
        self.total_used += 1;
        self.current_used += 1;
    }

    fn maintenance_due(&self, now: Instant) -> bool {
        self.idle_ttl.is_some()
            && now.saturating_duration_since(self.last_check) >= self.check_interval
    }

    /// Detach idle connections unused for at least `ttl`, oldest first.
    fn take_expired(&mut self, ttl: Duration, now: Instant) -> Vec<PooledConnection<C>> {
        if ttl.is_zero() {
            return self.idle.drain(..).collect();
        }
        let mut expired = Vec::new();
        while let Some(oldest) = self.idle.back() {
            if now.saturating_duration_since(oldest.last_active()) < ttl {
                break;
            }
            if let Some(conn) = self.idle.pop_back() {
                expired.push(conn);
            }
        }
        expired
    }
}

/// Bounded pool of connections to one endpoint address.
///
/// Usually created and owned by a [`PoolManager`](crate::PoolManager), but
/// usable on its own.
pub struct EndpointPool<K: Connector> {
    id: PoolId,
    address: Arc<str>,
    slot: usize,
    connect_timeout: Duration,
    rw_timeout: Duration,
    connector: K,
    state: Mutex<PoolState<K::Conn>>,
}

impl<K: Connector> EndpointPool<K> {
    /// Create a pool for `address`. Nothing is opened until the first checkout.
    pub fn new(address: &str, slot: usize, connector: K, config: &PoolConfig) -> Self {
        Self {
            id: PoolId::next(),
            address: Arc::from(address),
            slot,
            connect_timeout: config.connect_timeout,
            rw_timeout: config.rw_timeout,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_flight: 0,
                capacity: config.capacity,
                health: HealthTracker::new(config.retry_interval),
                idle_ttl: config.idle_ttl,
                check_interval: config.check_interval,
                last_check: Instant::now(),
                destroy_pending: false,
                destroyed: false,
                total_used: 0,
                current_used: 0,
                opened: 0,
                connect_failures: 0,
                reaped: 0,
            }),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Creation index of this pool within its manager.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn rw_timeout(&self) -> Duration {
        self.rw_timeout
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.state.lock().idle_ttl
    }

    pub fn set_idle_ttl(&self, idle_ttl: Option<Duration>) {
        self.state.lock().idle_ttl = idle_ttl;
    }

    pub fn set_retry_interval(&self, retry_interval: Option<Duration>) {
        self.state.lock().health.set_retry_interval(retry_interval);
    }

    pub fn set_check_interval(&self, check_interval: Duration) {
        self.state.lock().check_interval = check_interval;
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().health.is_alive()
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().destroy_pending
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether a checkout would currently be allowed to touch the endpoint.
    ///
    /// A dead endpoint whose retry interval has elapsed is flipped back to
    /// alive by this call.
    pub fn is_available(&self) -> bool {
        let mut state = self.state.lock();
        if state.destroy_pending {
            return false;
        }
        let admission = state.health.admit(Instant::now());
        drop(state);
        if admission == Admission::Revived {
            tracing::info!(
                address = %self.address,
                "retry interval elapsed, endpoint eligible again"
            );
        }
        admission.allowed()
    }

    /// Check a connection out of the pool.
    ///
    /// Never blocks waiting for a connection to be returned. The only I/O
    /// is a single `open()` when no idle connection exists and capacity
    /// allows a new one.
    pub fn checkout(&self) -> PoolResult<PooledConnection<K::Conn>> {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if state.destroy_pending {
                return Err(self.draining());
            }

            match state.health.admit(now) {
                Admission::Refused => {
                    return Err(PoolError::EndpointDead {
                        address: self.address.to_string(),
                        cause: None,
                    });
                }
                Admission::Revived => {
                    tracing::info!(
                        address = %self.address,
                        "retry interval elapsed, probing endpoint"
                    );
                }
                Admission::Alive => {}
            }

            if let Some(mut conn) = state.idle.pop_front() {
                state.served();
                conn.reused();
                tracing::debug!(
                    address = %self.address,
                    use_count = conn.use_count(),
                    idle = state.idle.len(),
                    in_flight = state.in_flight,
                    "reused idle connection"
                );
                return Ok(conn);
            }

            if state.at_capacity() {
                tracing::debug!(
                    address = %self.address,
                    capacity = state.capacity,
                    in_flight = state.in_flight,
                    "pool at capacity, refusing checkout"
                );
                return Err(PoolError::CapacityExceeded {
                    address: self.address.to_string(),
                    capacity: state.capacity,
                });
            }

            // Reserve the slot before releasing the lock so racing
            // checkouts cannot overshoot capacity while we connect.
            state.in_flight += 1;
        }

        let mut conn = self.connector.create();
        match conn.open() {
            Ok(()) => self.finish_open(conn),
            Err(e) => {
                let destroyed = {
                    let mut state = self.state.lock();
                    state.in_flight -= 1;
                    state.connect_failures += 1;
                    if state.health.record_failure(Instant::now()) {
                        tracing::warn!(
                            address = %self.address,
                            error = %e,
                            "connect failed, endpoint marked dead"
                        );
                    } else {
                        tracing::debug!(
                            address = %self.address,
                            error = %e,
                            "connect failed again"
                        );
                    }
                    self.destroy_if_drained(&mut state)
                };
                if destroyed {
                    self.log_destroyed();
                }
                Err(PoolError::EndpointDead {
                    address: self.address.to_string(),
                    cause: Some(e),
                })
            }
        }
    }

    fn finish_open(&self, conn: K::Conn) -> PoolResult<PooledConnection<K::Conn>> {
        let mut pooled = PooledConnection::new(conn, self.id, Arc::clone(&self.address));
        let mut state = self.state.lock();
        state.opened += 1;
        state.health.record_success();

        // Teardown was requested while we were connecting.
        if state.destroy_pending {
            state.in_flight -= 1;
            let destroyed = self.destroy_if_drained(&mut state);
            drop(state);
            pooled.close();
            if destroyed {
                self.log_destroyed();
            }
            return Err(self.draining());
        }

        state.total_used += 1;
        state.current_used += 1;
        tracing::debug!(
            address = %self.address,
            in_flight = state.in_flight,
            opened = state.opened,
            "opened new connection"
        );
        Ok(pooled)
    }

    /// Return a checked-out connection.
    ///
    /// With `keep` set and the endpoint alive, the connection goes back on
    /// the idle list; otherwise it is closed. Returning a connection that
    /// belongs to another pool is rejected with
    /// [`PoolError::InvalidHandle`] and leaves this pool untouched.
    pub fn checkin(
        &self,
        mut conn: PooledConnection<K::Conn>,
        keep: bool,
    ) -> PoolResult<CheckinOutcome> {
        if conn.pool_id() != self.id {
            return Err(PoolError::InvalidHandle(conn.pool_id()));
        }

        let now = Instant::now();
        let mut to_close = Vec::new();
        let outcome;
        {
            let mut state = self.state.lock();
            if state.destroyed || state.in_flight == 0 {
                return Err(PoolError::InvalidHandle(conn.pool_id()));
            }
            state.in_flight -= 1;

            if state.destroy_pending {
                to_close.push(conn);
                outcome = if self.destroy_if_drained(&mut state) {
                    CheckinOutcome::PoolDestroyed
                } else {
                    CheckinOutcome::Discarded
                };
            } else {
                if keep && state.health.is_alive() {
                    conn.touch(now);
                    state.idle.push_front(conn);
                    outcome = CheckinOutcome::Idle;
                } else {
                    to_close.push(conn);
                    outcome = CheckinOutcome::Discarded;
                }

                if state.maintenance_due(now) {
                    if let Some(ttl) = state.idle_ttl {
                        let expired = state.take_expired(ttl, now);
                        state.reaped += expired.len() as u64;
                        if !expired.is_empty() {
                            tracing::debug!(
                                address = %self.address,
                                reaped = expired.len(),
                                remaining_idle = state.idle.len(),
                                "opportunistic idle sweep"
                            );
                        }
                        to_close.extend(expired);
                    }
                    state.last_check = now;
                }
            }
        }

        for mut conn in to_close {
            conn.close();
        }
        if outcome == CheckinOutcome::PoolDestroyed {
            self.log_destroyed();
        }
        Ok(outcome)
    }

    /// Close idle connections unused for at least `ttl`.
    ///
    /// Scans from the least recently used end and stops at the first fresh
    /// connection. `Some(Duration::ZERO)` closes every idle connection;
    /// `None` does nothing. Returns the number of connections closed.
    pub fn reap_idle(&self, ttl: Option<Duration>) -> usize {
        let Some(ttl) = ttl else {
            return 0;
        };
        let expired = {
            let mut state = self.state.lock();
            let expired = state.take_expired(ttl, Instant::now());
            state.reaped += expired.len() as u64;
            expired
        };

        let reaped = expired.len();
        for mut conn in expired {
            conn.close();
        }
        if reaped > 0 {
            tracing::info!(
                address = %self.address,
                reaped = reaped,
                ttl = ?ttl,
                "reaped idle connections"
            );
        }
        reaped
    }

    /// Mark the endpoint dead after an application-level failure.
    pub fn mark_dead(&self) {
        self.state.lock().health.mark_dead(Instant::now());
        tracing::warn!(address = %self.address, "endpoint marked dead");
    }

    /// Mark the endpoint alive, ending any backoff.
    pub fn mark_alive(&self) {
        self.state.lock().health.mark_alive();
        tracing::info!(address = %self.address, "endpoint marked alive");
    }

    /// Tear the pool down once every checked-out connection is back.
    ///
    /// New checkouts are refused from now on and idle connections are
    /// closed right away. Returns `true` if the pool is destroyed when the
    /// call returns; otherwise the checkin that returns the last
    /// outstanding connection destroys it.
    pub fn request_destroy(&self) -> bool {
        let (idle, destroyed) = {
            let mut state = self.state.lock();
            if state.destroy_pending {
                return state.destroyed;
            }
            state.destroy_pending = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            let destroyed = self.destroy_if_drained(&mut state);
            if !destroyed {
                tracing::info!(
                    address = %self.address,
                    in_flight = state.in_flight,
                    "pool draining, destruction deferred until connections return"
                );
            }
            (idle, destroyed)
        };

        for mut conn in idle {
            conn.close();
        }
        if destroyed {
            self.log_destroyed();
        }
        destroyed
    }

    /// Reset the per-round checkout counter.
    pub fn reset_current_used(&self) {
        self.state.lock().current_used = 0;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            address: self.address.to_string(),
            slot: self.slot,
            alive: state.health.is_alive(),
            draining: state.destroy_pending,
            idle: state.idle.len(),
            in_flight: state.in_flight,
            capacity: state.capacity,
            total_used: state.total_used,
            current_used: state.current_used,
            opened: state.opened,
            connect_failures: state.connect_failures,
            reaped: state.reaped,
        }
    }

    /// Flip to destroyed if draining with nothing outstanding. Runs at most
    /// once per pool; returns whether this call did it.
    fn destroy_if_drained(&self, state: &mut PoolState<K::Conn>) -> bool {
        if state.destroy_pending && !state.destroyed && state.in_flight == 0 {
            state.destroyed = true;
            return true;
        }
        false
    }

    fn log_destroyed(&self) {
        tracing::info!(address = %self.address, pool = %self.id, "connection pool destroyed");
    }

    fn draining(&self) -> PoolError {
        PoolError::Draining {
            address: self.address.to_string(),
        }
    }
}

impl<K: Connector> Drop for EndpointPool<K> {
    fn drop(&mut self) {
        for mut conn in self.state.get_mut().idle.drain(..) {
            conn.close();
        }
    }
}

impl<K: Connector> fmt::Debug for EndpointPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}
