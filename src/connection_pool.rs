// Copyright 2020 Joyent, Inc.

pub mod host_pool;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use slog::{debug, info, o, warn, Drain, Logger};

use crate::connection::{Connection, Connector};
use crate::connection_pool::host_pool::HostConnPool;
use crate::connection_pool::types::{
    ConnectionCount, ConnectionPoolOptions, ConnectionPoolState, ConnectionPoolStats,
};
use crate::host::Host;
use crate::shuffle::RandomSource;

// Default number of connections per host
const DEFAULT_NUM_CONNS: usize = 2;

/// The connections to every host of the cluster, one `HostConnPool` per host.
///
/// Pools for new hosts are created concurrently and only registered once they
/// hold at least one live connection, so an unreachable host never ends up in
/// the pool map. Clones share the same set of pools.
pub struct ConnectionPool<C: Connection> {
    pools: Arc<RwLock<HashMap<SocketAddr, HostConnPool<C>>>>,
    state: Arc<Mutex<ConnectionPoolState>>,
    num_conns: usize,
    connector: Connector<C>,
    random: RandomSource,
    log: Logger,
}

impl<C: Connection> Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let hosts: Vec<SocketAddr> = self.read().keys().cloned().collect();
        f.debug_struct("ConnectionPool")
            .field("hosts", &hosts)
            .field("num_conns", &self.num_conns)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Connection> Clone for ConnectionPool<C> {
    fn clone(&self) -> ConnectionPool<C> {
        ConnectionPool {
            pools: Arc::clone(&self.pools),
            state: Arc::clone(&self.state),
            num_conns: self.num_conns,
            connector: Arc::clone(&self.connector),
            random: self.random.clone(),
            log: self.log.clone(),
        }
    }
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(cpo: ConnectionPoolOptions, connector: Connector<C>) -> Self {
        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        ConnectionPool {
            pools: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(Mutex::new(ConnectionPoolState::Running)),
            num_conns: cpo.num_conns.unwrap_or(DEFAULT_NUM_CONNS),
            connector,
            random: cpo.random.unwrap_or_default(),
            log: logger.new(o!("component" => "ConnectionPool")),
        }
    }

    /// Reconcile the pools with a new host list. Pools are created for up
    /// hosts that have none, and pools of hosts missing from the list (or no
    /// longer up) are closed. Blocks until every new pool has either made its
    /// first connection or failed to.
    pub fn set_hosts(&self, hosts: &[Host]) {
        if self.is_closed() {
            return;
        }

        let mut to_remove: HashSet<SocketAddr> = self.read().keys().cloned().collect();
        let (tx, rx) = channel();

        for host in hosts {
            if !host.is_up() {
                continue;
            }
            if to_remove.remove(&host.connect_address()) {
                continue;
            }
            let pool = self.new_host_pool(host.clone());
            let tx = tx.clone();
            thread::spawn(move || {
                pool.fill();
                let _ = tx.send(pool);
            });
        }
        drop(tx);

        for pool in rx {
            self.register(pool);
        }

        for addr in to_remove {
            self.remove_host(&addr);
        }
    }

    /// Create a pool for a host unless it already has one. Returns the host's
    /// pool if it has at least one live connection. An existing pool that
    /// cannot make one is dropped.
    pub fn add_host(&self, host: &Host) -> Option<HostConnPool<C>> {
        if self.is_closed() {
            return None;
        }
        let addr = host.connect_address();
        if let Some(pool) = self.get_pool(&addr) {
            pool.fill();
            if pool.size() > 0 {
                return Some(pool);
            }
            warn!(self.log, "host pool has no live connections"; "host" => addr.to_string());
            self.remove_pool(&addr, &pool);
            return None;
        }

        let pool = self.new_host_pool(host.clone());
        pool.fill();
        if self.register(pool) {
            self.get_pool(&addr)
        } else {
            None
        }
    }

    /// Drop and close the pool of a host.
    pub fn remove_host(&self, addr: &SocketAddr) {
        let removed = self.write().remove(addr);
        if let Some(pool) = removed {
            info!(self.log, "removing pool"; "host" => addr.to_string());
            pool.close();
        }
    }

    // Drop the pool of a host only if it is still `pool`, so a replacement
    // registered in the meantime survives.
    fn remove_pool(&self, addr: &SocketAddr, pool: &HostConnPool<C>) {
        let removed = {
            let mut pools = self.write();
            match pools.get(addr) {
                Some(current) if current.ptr_eq(pool) => pools.remove(addr),
                _ => None,
            }
        };
        if let Some(pool) = removed {
            pool.close();
        }
    }

    pub fn host_up(&self, host: &Host) -> Option<HostConnPool<C>> {
        self.add_host(host)
    }

    pub fn host_down(&self, addr: &SocketAddr) {
        self.remove_host(addr)
    }

    pub fn get_pool(&self, addr: &SocketAddr) -> Option<HostConnPool<C>> {
        self.read().get(addr).cloned()
    }

    /// The total number of live connections across all hosts.
    pub fn size(&self) -> usize {
        self.pools_snapshot().iter().map(HostConnPool::size).sum()
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        let mut stats = ConnectionPoolStats::new();
        for pool in self.pools_snapshot() {
            let size = pool.size();
            stats.host_pools += ConnectionCount::from(1);
            stats.total_connections += ConnectionCount::from(size as u32);
            if size < pool.capacity() {
                stats.underfilled_pools += ConnectionCount::from(1);
            }
        }
        stats
    }

    pub fn state(&self) -> ConnectionPoolState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionPoolState::Closed
    }

    /// Close every pool. Later calls do nothing.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ConnectionPoolState::Closed {
                return;
            }
            *state = ConnectionPoolState::Closed;
        }
        let pools: Vec<HostConnPool<C>> = self.write().drain().map(|(_, p)| p).collect();
        debug!(self.log, "closing {} host pools", pools.len());
        for pool in pools {
            pool.close();
        }
    }

    fn new_host_pool(&self, host: Host) -> HostConnPool<C> {
        HostConnPool::new(
            host,
            self.num_conns,
            Arc::clone(&self.connector),
            self.random.clone(),
            &self.log,
        )
    }

    // Register a freshly filled pool. Pools without a live connection, pools
    // that lost a race with another pool for the same host, and pools
    // finishing after close are closed instead.
    fn register(&self, pool: HostConnPool<C>) -> bool {
        let addr = pool.host().connect_address();
        if pool.size() == 0 {
            warn!(self.log, "unable to connect to host"; "host" => addr.to_string());
            pool.close();
            return false;
        }

        let mut pools = self.write();
        if self.is_closed() || pools.contains_key(&addr) {
            drop(pools);
            pool.close();
            return false;
        }
        pools.insert(addr, pool);
        true
    }

    fn pools_snapshot(&self) -> Vec<HostConnPool<C>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<HashMap<SocketAddr, HostConnPool<C>>> {
        self.pools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<HashMap<SocketAddr, HostConnPool<C>>> {
        self.pools.write().unwrap_or_else(|e| e.into_inner())
    }
}
