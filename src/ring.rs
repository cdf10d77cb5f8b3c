// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwap;

use crate::host::Host;

/// The registry of every node the client knows about.
///
/// Lookups by address go through the map. Iteration goes through a
/// copy-on-write list that is replaced wholesale on every membership change,
/// so a reader holding a snapshot never observes a half-applied update.
#[derive(Clone, Debug)]
pub struct Ring(Arc<RingInner>);

#[derive(Debug)]
struct RingInner {
    endpoints: Vec<SocketAddr>,
    hosts: RwLock<HashMap<SocketAddr, Host>>,
    host_list: ArcSwap<Vec<Host>>,
    pos: AtomicUsize,
}

impl Ring {
    pub fn new(endpoints: Vec<SocketAddr>) -> Self {
        Ring(Arc::new(RingInner {
            endpoints,
            hosts: RwLock::new(HashMap::new()),
            host_list: ArcSwap::from_pointee(Vec::new()),
            pos: AtomicUsize::new(0),
        }))
    }

    /// The bootstrap addresses the client was configured with.
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.0.endpoints
    }

    pub fn get_host(&self, addr: &SocketAddr) -> Option<Host> {
        self.read().get(addr).cloned()
    }

    /// Insert a host unless one with the same address is already known.
    /// Returns the registered host and whether it was already present.
    pub fn add_host(&self, host: Host) -> (Host, bool) {
        let mut hosts = self.write();
        if let Some(existing) = hosts.get(&host.connect_address()) {
            return (existing.clone(), true);
        }
        hosts.insert(host.connect_address(), host.clone());
        self.publish(&hosts);
        (host, false)
    }

    /// Insert a host, or merge it into the already registered one. Returns the
    /// registered host and whether it was already present.
    pub fn add_or_update(&self, host: Host) -> (Host, bool) {
        let (registered, existed) = self.add_host(host.clone());
        if existed {
            registered.update(&host);
        }
        (registered, existed)
    }

    pub fn remove_host(&self, addr: &SocketAddr) -> Option<Host> {
        let mut hosts = self.write();
        let removed = hosts.remove(addr);
        if removed.is_some() {
            self.publish(&hosts);
        }
        removed
    }

    /// A consistent snapshot of every registered host, in insertion order.
    pub fn all_hosts(&self) -> Vec<Host> {
        let list = self.0.host_list.load_full();
        (*list).clone()
    }

    pub fn current_hosts(&self) -> HashMap<SocketAddr, Host> {
        self.read().clone()
    }

    /// The next host in round-robin order, if any are registered.
    pub fn rr_host(&self) -> Option<Host> {
        let list = self.0.host_list.load();
        if list.is_empty() {
            return None;
        }
        let pos = self.0.pos.fetch_add(1, Ordering::Relaxed);
        Some(list[pos % list.len()].clone())
    }

    pub fn len(&self) -> usize {
        self.0.host_list.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Rebuild the iteration list while the map write lock is still held, so
    // list replacements are ordered the same way as map updates.
    fn publish(&self, hosts: &HashMap<SocketAddr, Host>) {
        let previous = self.0.host_list.load();
        let mut list: Vec<Host> = previous
            .iter()
            .filter(|h| hosts.contains_key(&h.connect_address()))
            .cloned()
            .collect();
        for host in hosts.values() {
            if !list.iter().any(|h| h.connect_address() == host.connect_address()) {
                list.push(host.clone());
            }
        }
        self.0.host_list.store(Arc::new(list));
    }

    fn read(&self) -> RwLockReadGuard<HashMap<SocketAddr, Host>> {
        self.0.hosts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<HashMap<SocketAddr, Host>> {
        self.0.hosts.write().unwrap_or_else(|e| e.into_inner())
    }
}
