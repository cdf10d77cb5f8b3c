// Copyright 2020 Joyent, Inc.

//! The control connection.
//!
//! One connection, separate from the query pools, is used to learn about the
//! cluster: it negotiates the protocol version, reads the cluster's system
//! tables to discover the other nodes, and is the only connection registered
//! for server-pushed events. A heartbeat thread keeps it honest and moves it
//! to another node when the current one stops answering.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use slog::{debug, error, info, o, warn, Logger};

use crate::config::{AddressTranslator, ClusterConfig, EventsConfig};
use crate::connection::{ConnConfig, Connection, MultiplexedConnection};
use crate::error::Error;
use crate::frame::message::{SCHEMA_CHANGE, STATUS_CHANGE, TOPOLOGY_CHANGE};
use crate::frame::{Event, QueryResult, Row, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use crate::host::{Host, HostDetails, HostInfo};
use crate::ring::Ring;
use crate::shuffle::RandomSource;

// Attempts a control query gets across reconnects
const QUERY_ATTEMPTS: usize = 3;

const LOCAL_QUERY: &str = "SELECT * FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT * FROM system.peers";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connecting,
    Registered,
    Active,
}

impl fmt::Display for ControlState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlState::Disconnected => fmt.write_str("disconnected"),
            ControlState::Connecting => fmt.write_str("connecting"),
            ControlState::Registered => fmt.write_str("registered"),
            ControlState::Active => fmt.write_str("active"),
        }
    }
}

type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

struct Heartbeat {
    quit: Sender<()>,
    handle: JoinHandle<()>,
}

struct ControlInner {
    conn: ArcSwapOption<MultiplexedConnection>,
    state: Mutex<ControlState>,
    conn_config: ConnConfig,
    classes: Vec<String>,
    events: Mutex<Sender<Event>>,
    ring: Ring,
    port: u16,
    translator: Option<AddressTranslator>,
    heartbeat_interval: Duration,
    heartbeat_retry_interval: Duration,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    on_reconnect: Mutex<Option<ReconnectHook>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    random: RandomSource,
    log: Logger,
}

/// A handle to the control connection. Clones share the same connection.
#[derive(Clone)]
pub struct ControlConn(Arc<ControlInner>);

impl fmt::Debug for ControlConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlConn")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

/// The event classes to register for, given which ones are disabled.
pub fn event_classes(events: &EventsConfig) -> Vec<String> {
    let mut classes = Vec::new();
    if !events.disable_topology_events {
        classes.push(TOPOLOGY_CHANGE.to_string());
    }
    if !events.disable_node_status_events {
        classes.push(STATUS_CHANGE.to_string());
    }
    if !events.disable_schema_events {
        classes.push(SCHEMA_CHANGE.to_string());
    }
    classes
}

/// Find the highest protocol version the cluster speaks.
///
/// Each seed is tried in random order, starting at the highest supported
/// version and stepping down whenever the server rejects it. A server that
/// names the version it does speak has that version adopted directly.
pub fn discover_protocol(
    seeds: &[SocketAddr],
    cfg: &ConnConfig,
    random: &RandomSource,
    log: &Logger,
) -> Result<u8, Error> {
    let mut seeds = seeds.to_vec();
    random.shuffle(&mut seeds);

    let mut version = MAX_PROTOCOL_VERSION;
    let mut last_error = None;
    for addr in seeds {
        while version >= MIN_PROTOCOL_VERSION {
            let cfg = ConnConfig {
                proto_version: version,
                ..cfg.clone()
            };
            match MultiplexedConnection::dial(addr, &cfg, None, log) {
                Ok(conn) => {
                    conn.close();
                    info!(
                        log,
                        "discovered protocol version";
                        "version" => version,
                        "host" => %addr
                    );
                    return Ok(version);
                }
                Err(Error::UnsupportedProtocol {
                    server: Some(offered),
                    ..
                }) if offered >= MIN_PROTOCOL_VERSION && offered < version => {
                    debug!(log, "server offered protocol version {}", offered; "host" => %addr);
                    version = offered;
                }
                Err(Error::UnsupportedProtocol { .. }) => {
                    debug!(log, "protocol version {} rejected", version; "host" => %addr);
                    version -= 1;
                }
                Err(e) => {
                    warn!(log, "unable to reach seed: {}", e; "host" => %addr);
                    last_error = Some(e);
                    break;
                }
            }
        }
        if version < MIN_PROTOCOL_VERSION {
            break;
        }
    }

    Err(Error::ProtocolDiscovery(match last_error {
        Some(e) if version >= MIN_PROTOCOL_VERSION => e.to_string(),
        _ => String::from("no supported protocol version"),
    }))
}

impl ControlConn {
    /// Create a disconnected control connection. Events pushed by the server
    /// arrive on the returned receiver.
    pub fn new(
        cfg: &ClusterConfig,
        proto_version: u8,
        ring: Ring,
        random: RandomSource,
        log: &Logger,
    ) -> (ControlConn, Receiver<Event>) {
        let (tx, rx) = channel();
        let inner = ControlInner {
            conn: ArcSwapOption::from(None),
            state: Mutex::new(ControlState::Disconnected),
            conn_config: cfg.conn_config(proto_version),
            classes: event_classes(&cfg.events),
            events: Mutex::new(tx),
            ring,
            port: cfg.port(),
            translator: cfg.address_translator.clone(),
            heartbeat_interval: cfg.heartbeat_interval(),
            heartbeat_retry_interval: cfg.heartbeat_retry_interval(),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            on_reconnect: Mutex::new(None),
            heartbeat: Mutex::new(None),
            random,
            log: log.new(o!("component" => "ControlConn")),
        };
        (ControlConn(Arc::new(inner)), rx)
    }

    pub fn state(&self) -> ControlState {
        *self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The node the control connection is currently attached to.
    pub fn address(&self) -> Option<SocketAddr> {
        self.0.conn.load_full().map(|c| c.address())
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Run `hook` after every successful reconnect.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.0.on_reconnect.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    /// Connect to the first reachable seed, in random order, and start the
    /// heartbeat.
    pub fn connect(&self, seeds: &[SocketAddr]) -> Result<(), Error> {
        let mut seeds = seeds.to_vec();
        self.0.random.shuffle(&mut seeds);

        let mut last_error = None;
        for addr in seeds {
            match self.setup(addr) {
                Ok(()) => {
                    self.start_heartbeat();
                    return Ok(());
                }
                Err(e) => {
                    warn!(self.0.log, "unable to connect: {}", e; "host" => %addr);
                    last_error = Some(e);
                }
            }
        }
        self.set_state(ControlState::Disconnected);
        Err(last_error.unwrap_or(Error::NoControlConnection))
    }

    /// Run a statement on the control connection. Transport failures move the
    /// control connection to another node and try again.
    pub fn query(&self, statement: &str) -> Result<QueryResult, Error> {
        let mut last_error = Error::NoControlConnection;
        for _ in 0..QUERY_ATTEMPTS {
            if self.is_closed() {
                return Err(Error::NoControlConnection);
            }
            let conn = match self.0.conn.load_full() {
                Some(conn) => conn,
                None => {
                    self.reconnect();
                    continue;
                }
            };
            match conn.query(statement) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transport() => {
                    warn!(self.0.log, "control query failed: {}", e; "host" => %conn.address());
                    last_error = e;
                    self.reconnect();
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Move the control connection to a working node: the previous one first,
    /// then the next node in round-robin order, then every known node in
    /// random order. Returns at once if a reconnect is already running.
    pub fn reconnect(&self) {
        if self.is_closed() {
            return;
        }
        if self
            .0
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let previous = self.0.conn.swap(None);
        let previous = previous.map(|conn| {
            conn.close();
            conn.address()
        });
        self.set_state(ControlState::Connecting);

        let mut candidates: Vec<SocketAddr> = previous.into_iter().collect();
        if let Some(host) = self.0.ring.rr_host() {
            candidates.push(host.connect_address());
        }
        let mut all: Vec<SocketAddr> = self
            .0
            .ring
            .all_hosts()
            .iter()
            .map(|h| h.connect_address())
            .collect();
        self.0.random.shuffle(&mut all);
        candidates.extend(all);

        let mut connected = false;
        for addr in candidates {
            match self.setup(addr) {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => debug!(self.0.log, "reconnect attempt failed: {}", e; "host" => %addr),
            }
        }
        self.0.reconnecting.store(false, Ordering::SeqCst);

        if !connected {
            self.set_state(ControlState::Disconnected);
            error!(self.0.log, "unable to reconnect control connection");
            return;
        }
        info!(self.0.log, "control connection reconnected"; "host" => ?self.address());

        let hook = self
            .0
            .on_reconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Read the cluster's members from its system tables. Returns the hosts
    /// and the cluster's partitioner.
    pub fn fetch_hosts(&self) -> Result<(Vec<Host>, Option<String>), Error> {
        let local_addr = self.address().ok_or(Error::NoControlConnection)?;
        let local = self.query(LOCAL_QUERY)?.into_rows().unwrap_or_default();
        let peers = self.query(PEERS_QUERY)?.into_rows().unwrap_or_default();

        let mut hosts = Vec::with_capacity(peers.len() + 1);
        let mut partitioner = None;

        // The control connection may have moved while querying, so the local
        // row is attributed to wherever it is now.
        let local_addr = self.address().unwrap_or(local_addr);
        if let Some(row) = local.iter().next() {
            let details = host_details(&row)?;
            partitioner = details.partitioner.clone();
            hosts.push(Arc::new(HostInfo::with_details(local_addr, details)));
        }

        for row in peers.iter() {
            let details = host_details(&row)?;
            if !valid_peer(&details) {
                warn!(self.0.log, "ignoring invalid peer"; "peer" => ?details.peer);
                continue;
            }
            let ip = match details.rpc_address {
                Some(ip) if !ip.is_unspecified() => ip,
                _ => match details.peer {
                    Some(ip) => ip,
                    None => continue,
                },
            };
            let port = match row.get_int("native_port")? {
                Some(port) if port > 0 && port <= i32::from(u16::MAX) => port as u16,
                _ => self.0.port,
            };
            let addr = self.translate(ip, port);
            hosts.push(Arc::new(HostInfo::with_details(addr, details)));
        }

        debug!(self.0.log, "fetched {} hosts", hosts.len());
        Ok((hosts, partitioner))
    }

    /// Apply the address translator, if any.
    pub fn translate(&self, ip: IpAddr, port: u16) -> SocketAddr {
        match self.0.translator {
            Some(ref t) => t.translate(ip, port),
            None => SocketAddr::new(ip, port),
        }
    }

    /// Stop the heartbeat and close the connection. Later calls do nothing.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let heartbeat = self
            .0
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hb) = heartbeat {
            let _ = hb.quit.send(());
            if hb.handle.thread().id() != thread::current().id() {
                let _ = hb.handle.join();
            }
        }
        if let Some(conn) = self.0.conn.swap(None) {
            conn.close();
        }
        self.set_state(ControlState::Disconnected);
        debug!(self.0.log, "closed");
    }

    fn setup(&self, addr: SocketAddr) -> Result<(), Error> {
        self.set_state(ControlState::Connecting);
        let events = self
            .0
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let conn =
            MultiplexedConnection::dial(addr, &self.0.conn_config, Some(events), &self.0.log)?;

        if !self.0.classes.is_empty() {
            if let Err(e) = conn.register(&self.0.classes) {
                conn.close();
                return Err(e);
            }
            self.set_state(ControlState::Registered);
        }

        if self.is_closed() {
            conn.close();
            return Err(Error::NoControlConnection);
        }
        if let Some(old) = self.0.conn.swap(Some(conn)) {
            old.close();
        }
        // A close that ran since the check above may have missed the new
        // connection.
        if self.is_closed() {
            if let Some(conn) = self.0.conn.swap(None) {
                conn.close();
            }
            self.set_state(ControlState::Disconnected);
            return Err(Error::NoControlConnection);
        }
        self.set_state(ControlState::Active);
        info!(self.0.log, "control connection established"; "host" => %addr);
        Ok(())
    }

    fn start_heartbeat(&self) {
        let mut heartbeat = self.0.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if heartbeat.is_some() || self.is_closed() {
            return;
        }
        let (quit, quit_rx) = channel();
        let weak = Arc::downgrade(&self.0);
        let interval = self.0.heartbeat_interval;
        let retry_interval = self.0.heartbeat_retry_interval;
        let handle = thread::spawn(move || heartbeat_loop(weak, quit_rx, interval, retry_interval));
        *heartbeat = Some(Heartbeat { quit, handle });
    }

    fn set_state(&self, state: ControlState) {
        *self.0.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

fn heartbeat_loop(
    inner: Weak<ControlInner>,
    quit: Receiver<()>,
    interval: Duration,
    retry_interval: Duration,
) {
    let mut sleep = interval;
    loop {
        match quit.recv_timeout(sleep) {
            Err(RecvTimeoutError::Timeout) => (),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let control = match inner.upgrade() {
            Some(inner) => ControlConn(inner),
            None => break,
        };
        if control.is_closed() {
            break;
        }

        let result = match control.0.conn.load_full() {
            Some(conn) => conn.options(),
            None => Err(Error::NoControlConnection),
        };
        sleep = match result {
            Ok(()) => interval,
            Err(e) => {
                warn!(control.0.log, "heartbeat failed: {}", e);
                control.reconnect();
                retry_interval
            }
        };
    }
}

fn host_details(row: &Row) -> Result<HostDetails, Error> {
    Ok(HostDetails {
        peer: row.get_inet("peer")?,
        broadcast_address: row.get_inet("broadcast_address")?,
        rpc_address: row.get_inet("rpc_address")?,
        datacenter: row.get_text("data_center")?,
        rack: row.get_text("rack")?,
        host_id: row.get_uuid("host_id")?,
        partitioner: row.get_text("partitioner")?,
        version: row.get_text("release_version")?,
        tokens: row.get_string_set("tokens")?,
        ..HostDetails::default()
    })
}

// A peer row is only usable once the node has fully joined.
fn valid_peer(details: &HostDetails) -> bool {
    (details.rpc_address.is_some() || details.peer.is_some())
        && details.host_id.is_some()
        && details.datacenter.is_some()
        && details.rack.is_some()
        && !details.tokens.is_empty()
}

#[cfg(test)]
mod test {
    use super::*;

    use uuid::Uuid;

    #[test]
    fn classes_follow_config() {
        let mut events = EventsConfig::default();
        assert_eq!(
            event_classes(&events),
            vec![TOPOLOGY_CHANGE, STATUS_CHANGE, SCHEMA_CHANGE]
        );
        events.disable_topology_events = true;
        events.disable_schema_events = true;
        assert_eq!(event_classes(&events), vec![STATUS_CHANGE]);
        events.disable_node_status_events = true;
        assert!(event_classes(&events).is_empty());
    }

    #[test]
    fn peer_validity() {
        let mut details = HostDetails {
            rpc_address: Some("10.0.0.2".parse().unwrap()),
            host_id: Some(Uuid::new_v4()),
            datacenter: Some(String::from("dc1")),
            rack: Some(String::from("r1")),
            tokens: vec![String::from("100")],
            ..HostDetails::default()
        };
        assert!(valid_peer(&details));
        details.tokens.clear();
        assert!(!valid_peer(&details));
        details.tokens.push(String::from("100"));
        details.host_id = None;
        assert!(!valid_peer(&details));
    }

    #[test]
    fn close_without_connect() {
        let cfg = ClusterConfig::new(vec!["127.0.0.1"]);
        let log = Logger::root(slog::Discard, o!());
        let (control, _events) =
            ControlConn::new(&cfg, 4, Ring::new(vec![]), RandomSource::seeded(1), &log);
        assert_eq!(control.state(), ControlState::Disconnected);
        control.close();
        control.close();
        assert!(control.is_closed());
        match control.query("SELECT 1") {
            Err(Error::NoControlConnection) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
