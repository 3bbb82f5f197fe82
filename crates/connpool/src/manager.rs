//! Pool manager — routes checkouts to per-address endpoint pools.
//!
//! # Architecture
//!
//! ```text
//! checkout(address)
//!   → registry lookup (DashMap, sharded by address)
//!     → pool exists          → EndpointPool::checkout()
//!     → no pool yet          → factory.create_connector(address, &config, slot)
//!                              → new EndpointPool with the current defaults
//!
//! checkin(conn)
//!   → live pools by PoolId   → EndpointPool::checkin()
//!     → PoolDestroyed        → drop the id entry
//! ```
//!
//! Removing an address only detaches it from the registry. The pool stays
//! reachable by id until its last outstanding connection comes back, which
//! is what lets borrowers return connections to a pool that is being torn
//! down.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::{ManagerSettings, PoolConfig};
use crate::connection::{Connector, ConnectorFactory, PoolId, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::pool::{CheckinOutcome, EndpointPool, PoolStats};

/// Endpoint pool type created by a manager using factory `F`.
pub type ManagedPool<F> = EndpointPool<<F as ConnectorFactory>::Connector>;

/// Connection type handed out by a manager using factory `F`.
pub type ManagedConnection<F> =
    PooledConnection<<<F as ConnectorFactory>::Connector as Connector>::Conn>;

/// Owns one [`EndpointPool`] per address and creates them on first use.
pub struct PoolManager<F: ConnectorFactory> {
    factory: F,
    /// Applied to pools at creation only.
    defaults: RwLock<PoolConfig>,
    /// Address → pool. At most one pool per address.
    pools: DashMap<String, Arc<ManagedPool<F>>>,
    /// Every pool not yet destroyed, including draining ones no longer
    /// reachable by address.
    live: DashMap<PoolId, Arc<ManagedPool<F>>>,
    next_slot: AtomicUsize,
    cursor: AtomicUsize,
}

impl<F: ConnectorFactory> PoolManager<F> {
    pub fn new(factory: F, defaults: PoolConfig) -> Self {
        Self {
            factory,
            defaults: RwLock::new(defaults),
            pools: DashMap::new(),
            live: DashMap::new(),
            next_slot: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build a manager from a settings file and register its endpoints.
    pub fn with_settings(factory: F, settings: &ManagerSettings) -> anyhow::Result<Self> {
        let manager = Self::new(factory, settings.pool_config()?);
        for endpoint in &settings.endpoints {
            manager.register(&endpoint.address, endpoint.capacity);
        }
        Ok(manager)
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn default_config(&self) -> PoolConfig {
        self.defaults.read().clone()
    }

    /// Replace the defaults used for pools created from now on.
    /// Existing pools keep the configuration they were created with.
    pub fn set_default_config(&self, defaults: PoolConfig) {
        *self.defaults.write() = defaults;
    }

    /// Check out a connection to `address`, creating its pool on first use.
    pub fn checkout(&self, address: &str) -> PoolResult<ManagedConnection<F>> {
        match self.checkout_from(&self.pool_for(address)) {
            // Raced with remove(); the registry has a replacement by now.
            Err(PoolError::Draining { .. }) => self.checkout_from(&self.pool_for(address)),
            result => result,
        }
    }

    /// Return a connection to the pool it came from.
    ///
    /// Works for pools that have been removed but are still draining. A
    /// connection whose pool is unknown to this manager is rejected with
    /// [`PoolError::InvalidHandle`].
    pub fn checkin(&self, conn: ManagedConnection<F>, keep: bool) -> PoolResult<CheckinOutcome> {
        let id = conn.pool_id();
        let pool = self
            .live
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PoolError::InvalidHandle(id))?;

        let outcome = pool.checkin(conn, keep)?;
        if outcome == CheckinOutcome::PoolDestroyed {
            self.live.remove(&id);
        }
        Ok(outcome)
    }

    /// Check out from any registered endpoint, round robin.
    ///
    /// Endpoints that refuse (dead, saturated) are skipped; the last
    /// refusal is returned if none can serve.
    pub fn checkout_any(&self) -> PoolResult<ManagedConnection<F>> {
        let pools = self.snapshot();
        if pools.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % pools.len();
        let mut last_err = PoolError::NoEndpoints;
        for pool in pools.iter().cycle().skip(start).take(pools.len()) {
            match self.checkout_from(pool) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(address = %pool.address(), error = %e, "endpoint skipped");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Create the pool for `address` now, optionally overriding the default
    /// capacity. An existing pool is returned unchanged.
    pub fn register(&self, address: &str, capacity: Option<usize>) -> Arc<ManagedPool<F>> {
        let entry = self
            .pools
            .entry(address.to_string())
            .or_insert_with(|| self.create_pool(address, capacity));
        Arc::clone(entry.value())
    }

    pub fn get(&self, address: &str) -> Option<Arc<ManagedPool<F>>> {
        self.prune_destroyed();
        self.pools.get(address).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.prune_destroyed();
        self.pools.contains_key(address)
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.prune_destroyed();
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prune_destroyed();
        self.pools.is_empty()
    }

    /// Pools torn down but still waiting for connections to come back.
    pub fn draining_count(&self) -> usize {
        self.prune_destroyed();
        self.live.iter().filter(|entry| entry.value().is_draining()).count()
    }

    /// Registered addresses in creation order.
    pub fn addresses(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|pool| pool.address().to_string())
            .collect()
    }

    /// Detach `address` and tear its pool down once drained.
    pub fn remove(&self, address: &str) -> bool {
        let Some((_, pool)) = self.pools.remove(address) else {
            return false;
        };
        tracing::info!(address = %address, pool = %pool.id(), "removing endpoint pool");
        if pool.request_destroy() {
            self.live.remove(&pool.id());
        }
        true
    }

    /// Remove every registered address. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let addresses: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        addresses
            .iter()
            .filter(|address| self.remove(address))
            .count()
    }

    /// Reap every pool with its own idle TTL.
    ///
    /// The manager runs no timer; clients that want reaping without
    /// traffic call this from their own.
    pub fn reap_idle_all(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|pool| pool.reap_idle(pool.idle_ttl()))
            .sum()
    }

    /// Statistics for all registered pools, in creation order.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.snapshot().iter().map(|pool| pool.stats()).collect()
    }

    /// Log one line of statistics per registered pool.
    pub fn log_stats(&self) {
        for stats in self.stats() {
            tracing::info!(
                address = %stats.address,
                slot = stats.slot,
                alive = stats.alive,
                idle = stats.idle,
                in_flight = stats.in_flight,
                capacity = stats.capacity,
                total_used = stats.total_used,
                current_used = stats.current_used,
                connect_failures = stats.connect_failures,
                "pool statistics"
            );
        }
    }

    fn pool_for(&self, address: &str) -> Arc<ManagedPool<F>> {
        let existing = self.pools.get(address).map(|entry| Arc::clone(entry.value()));
        if let Some(pool) = existing {
            if !pool.is_draining() {
                return pool;
            }
            // Torn down directly through the pool handle; replace it.
            self.pools.remove_if(address, |_, current| current.id() == pool.id());
            if pool.is_destroyed() {
                self.live.remove(&pool.id());
            }
        }
        self.register(address, None)
    }

    fn checkout_from(&self, pool: &Arc<ManagedPool<F>>) -> PoolResult<ManagedConnection<F>> {
        let result = pool.checkout();
        if result.is_err() && pool.is_destroyed() {
            self.live.remove(&pool.id());
        }
        result
    }

    fn create_pool(&self, address: &str, capacity: Option<usize>) -> Arc<ManagedPool<F>> {
        let mut config = self.default_config();
        if let Some(capacity) = capacity {
            config.capacity = capacity;
        }
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let connector = self.factory.create_connector(address, &config, slot);
        let pool = Arc::new(EndpointPool::new(address, slot, connector, &config));
        self.live.insert(pool.id(), Arc::clone(&pool));

        tracing::info!(
            address = %address,
            pool = %pool.id(),
            slot = slot,
            capacity = config.capacity,
            "created endpoint pool"
        );
        pool
    }

    /// Drop pools destroyed through their own handle from both maps.
    fn prune_destroyed(&self) {
        self.pools.retain(|_, pool| !pool.is_destroyed());
        self.live.retain(|_, pool| !pool.is_destroyed());
    }

    fn snapshot(&self) -> Vec<Arc<ManagedPool<F>>> {
        self.prune_destroyed();
        let mut pools: Vec<_> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        pools.sort_by_key(|pool| pool.slot());
        pools
    }
}

impl<F: ConnectorFactory> fmt::Debug for PoolManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("defaults", &*self.defaults.read())
            .field("pools", &self.pools.len())
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}
