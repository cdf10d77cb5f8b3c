// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

/// A shared handle to a cluster node.
pub type Host = Arc<HostInfo>;

/// Whether a node is believed to be accepting connections.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostState {
    Up,
    Down,
}

impl fmt::Display for HostState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostState::Up => fmt.write_str("UP"),
            HostState::Down => fmt.write_str("DOWN"),
        }
    }
}

impl Default for HostState {
    fn default() -> Self {
        HostState::Up
    }
}

/// The mutable attributes of a node, as learned from the cluster's system
/// tables or from push events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostDetails {
    pub peer: Option<IpAddr>,
    pub broadcast_address: Option<IpAddr>,
    pub rpc_address: Option<IpAddr>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub host_id: Option<Uuid>,
    pub partitioner: Option<String>,
    pub version: Option<String>,
    pub tokens: Vec<String>,
    pub state: HostState,
}

/// A node of the cluster.
///
/// A host is identified solely by the address the client connects to. Two
/// `HostInfo` values with the same connect address are the same node, even if
/// the rest of what is known about them differs.
#[derive(Debug)]
pub struct HostInfo {
    connect_address: SocketAddr,
    details: RwLock<HostDetails>,
}

impl HostInfo {
    pub fn new(connect_address: SocketAddr) -> Self {
        HostInfo::with_details(connect_address, HostDetails::default())
    }

    pub fn with_details(connect_address: SocketAddr, details: HostDetails) -> Self {
        HostInfo {
            connect_address,
            details: RwLock::new(details),
        }
    }

    pub fn connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// A copy of everything currently known about the host.
    pub fn details(&self) -> HostDetails {
        self.read().clone()
    }

    pub fn datacenter(&self) -> Option<String> {
        self.read().datacenter.clone()
    }

    pub fn rack(&self) -> Option<String> {
        self.read().rack.clone()
    }

    pub fn host_id(&self) -> Option<Uuid> {
        self.read().host_id
    }

    pub fn partitioner(&self) -> Option<String> {
        self.read().partitioner.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.read().version.clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.read().tokens.clone()
    }

    pub fn state(&self) -> HostState {
        self.read().state
    }

    pub fn is_up(&self) -> bool {
        self.state() == HostState::Up
    }

    /// Set the host state, returning the previous one.
    pub fn set_state(&self, state: HostState) -> HostState {
        let mut details = self.write();
        std::mem::replace(&mut details.state, state)
    }

    pub fn mark_up(&self) -> HostState {
        self.set_state(HostState::Up)
    }

    pub fn mark_down(&self) -> HostState {
        self.set_state(HostState::Down)
    }

    /// Merge another view of the same node into this one. Only fields that
    /// are still unknown here are filled in; the state is left alone.
    pub fn update(&self, other: &HostInfo) {
        if std::ptr::eq(self, other) {
            return;
        }
        let from = other.details();
        let mut to = self.write();

        fill(&mut to.peer, from.peer);
        fill(&mut to.broadcast_address, from.broadcast_address);
        fill(&mut to.rpc_address, from.rpc_address);
        fill(&mut to.datacenter, from.datacenter);
        fill(&mut to.rack, from.rack);
        fill(&mut to.host_id, from.host_id);
        fill(&mut to.partitioner, from.partitioner);
        fill(&mut to.version, from.version);
        if to.tokens.is_empty() {
            to.tokens = from.tokens;
        }
    }

    fn read(&self) -> RwLockReadGuard<HostDetails> {
        self.details.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<HostDetails> {
        self.details.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn fill<T>(to: &mut Option<T>, from: Option<T>) {
    if to.is_none() {
        *to = from;
    }
}

impl PartialEq for HostInfo {
    fn eq(&self, other: &HostInfo) -> bool {
        self.connect_address == other.connect_address
    }
}

impl Eq for HostInfo {}

impl Hash for HostInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connect_address.hash(state)
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let d = self.read();
        write!(
            f,
            "[host {} dc={} rack={} state={}]",
            self.connect_address,
            d.datacenter.as_ref().map(String::as_str).unwrap_or("?"),
            d.rack.as_ref().map(String::as_str).unwrap_or("?"),
            d.state
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn identity_is_connect_address() {
        let a = HostInfo::with_details(
            addr(9042),
            HostDetails {
                datacenter: Some(String::from("dc1")),
                ..HostDetails::default()
            },
        );
        let b = HostInfo::new(addr(9042));
        let c = HostInfo::new(addr(9043));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn update_only_fills_empty_fields() {
        let host = HostInfo::with_details(
            addr(9042),
            HostDetails {
                datacenter: Some(String::from("dc1")),
                ..HostDetails::default()
            },
        );
        let other = HostInfo::with_details(
            addr(9042),
            HostDetails {
                datacenter: Some(String::from("dc2")),
                rack: Some(String::from("r1")),
                tokens: vec![String::from("10")],
                state: HostState::Down,
                ..HostDetails::default()
            },
        );

        host.update(&other);

        assert_eq!(host.datacenter(), Some(String::from("dc1")));
        assert_eq!(host.rack(), Some(String::from("r1")));
        assert_eq!(host.tokens(), vec![String::from("10")]);
        assert!(host.is_up());
    }

    #[test]
    fn state_transitions() {
        let host = HostInfo::new(addr(9042));
        assert_eq!(host.mark_down(), HostState::Up);
        assert!(!host.is_up());
        assert_eq!(host.mark_up(), HostState::Down);
        assert_eq!(host.state().to_string(), "UP");
    }
}
