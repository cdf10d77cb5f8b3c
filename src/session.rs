// Copyright 2020 Joyent, Inc.

//! The session: the client's public entry point.
//!
//! A `Session` wires the components together. At start-up it resolves the
//! seed hosts, settles on a protocol version, attaches the control
//! connection, learns the cluster's members and opens a pool to each of them.
//! Afterwards it keeps the host registry, the pools and the host-selection
//! policy in step with the cluster by acting on debounced server events, by
//! refreshing the member list whenever the control connection moves, and by
//! periodically retrying hosts that are down.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use slog::{debug, error, info, o, trace, warn, Logger};
use timer::Guard;

use crate::config::ClusterConfig;
use crate::connection::MultiplexedConnection;
use crate::connection_pool::types::{ConnectionPoolOptions, ConnectionPoolStats};
use crate::connection_pool::ConnectionPool;
use crate::control::{self, ControlConn};
use crate::error::Error;
use crate::events::EventDebouncer;
use crate::executor::QueryExecutor;
use crate::frame::{Event, QueryResult, StatusChange, TopologyChange};
use crate::host::{Host, HostInfo};
use crate::policies::HostSelectionPolicy;
use crate::prepared::PreparedCache;
use crate::query::Query;
use crate::retry::{NoRetryPolicy, RetryPolicy};
use crate::ring::Ring;

// How often the event pump checks whether the session has closed
const EVENT_POLL_MS: u64 = 100;

type Pool = ConnectionPool<MultiplexedConnection>;

struct SessionInner {
    cfg: ClusterConfig,
    proto_version: u8,
    ring: Ring,
    pool: Pool,
    policy: Arc<HostSelectionPolicy>,
    prepared: Arc<PreparedCache>,
    executor: QueryExecutor<MultiplexedConnection>,
    control: Option<ControlConn>,
    node_events: Mutex<Option<EventDebouncer<Event>>>,
    schema_events: Mutex<Option<EventDebouncer<Event>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<(timer::Timer, Guard)>>,
    closed: AtomicBool,
    log: Logger,
}

/// A connected client. Clones share the same connections.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("proto_version", &self.0.proto_version)
            .field("hosts", &self.0.ring.len())
            .field("pool", &self.0.pool)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Connect to the cluster described by `cfg`.
    pub fn new(cfg: ClusterConfig) -> Result<Session, Error> {
        cfg.validate()?;
        let root = cfg.logger();
        let log = root.new(o!("component" => "Session"));
        let random = cfg.random_source();

        let seeds = resolve_seeds(&cfg.hosts, cfg.port(), &log)?;
        let proto_version = match cfg.proto_version() {
            0 => control::discover_protocol(&seeds, &cfg.conn_config(0), &random, &log)?,
            v => v,
        };
        info!(log, "starting session"; "version" => proto_version, "seeds" => seeds.len());

        let policy = Arc::new(HostSelectionPolicy::from_config(&cfg.policy, &random, &root));
        let connector =
            MultiplexedConnection::connector(cfg.conn_config(proto_version), root.clone());
        let pool = ConnectionPool::new(
            ConnectionPoolOptions {
                num_conns: Some(cfg.num_conns()),
                log: Some(root.clone()),
                random: Some(random.clone()),
            },
            connector,
        );
        let prepared = Arc::new(PreparedCache::new(cfg.max_prepared_stmts()));
        let retry_policy: Arc<dyn RetryPolicy> = cfg
            .retry_policy
            .clone()
            .unwrap_or_else(|| Arc::new(NoRetryPolicy));
        let executor = QueryExecutor::new(
            pool.clone(),
            Arc::clone(&policy),
            retry_policy,
            Arc::clone(&prepared),
            &root,
        );
        let ring = Ring::new(seeds.clone());

        let (control, events) = if control_disabled(&cfg) {
            (None, None)
        } else {
            let (control, events) =
                ControlConn::new(&cfg, proto_version, ring.clone(), random, &root);
            (Some(control), Some(events))
        };

        let session = Session(Arc::new(SessionInner {
            cfg,
            proto_version,
            ring,
            pool,
            policy,
            prepared,
            executor,
            control,
            node_events: Mutex::new(None),
            schema_events: Mutex::new(None),
            pump: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
            log,
        }));

        if let Err(e) = session.init(&seeds, events) {
            error!(session.0.log, "unable to start session: {}", e);
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    /// Run a query, choosing hosts with the configured policy.
    pub fn execute(&self, query: &Query) -> Result<QueryResult, Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.0.executor.execute(query)
    }

    /// Every host the session knows about, up or down.
    pub fn current_hosts(&self) -> Vec<Host> {
        self.0.ring.all_hosts()
    }

    pub fn proto_version(&self) -> u8 {
        self.0.proto_version
    }

    pub fn pool_stats(&self) -> ConnectionPoolStats {
        self.0.pool.stats()
    }

    pub fn policy(&self) -> &Arc<HostSelectionPolicy> {
        &self.0.policy
    }

    pub fn control(&self) -> Option<&ControlConn> {
        self.0.control.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Shut down every component. Queries issued afterwards fail with
    /// `Error::SessionClosed`. Later calls do nothing.
    pub fn close(&self) {
        self.0.close()
    }

    /// Re-read the cluster's members through the control connection: new
    /// hosts are added, known ones updated and vanished ones removed.
    pub fn refresh_ring(&self) -> Result<(), Error> {
        self.0.refresh_ring()
    }

    fn init(&self, seeds: &[SocketAddr], events: Option<Receiver<Event>>) -> Result<(), Error> {
        let inner = &self.0;
        let (hosts, partitioner) = match inner.control {
            Some(ref control) => {
                control.connect(seeds)?;
                if inner.cfg.disable_initial_host_lookup {
                    (seed_hosts(seeds), None)
                } else {
                    control.fetch_hosts()?
                }
            }
            None => (seed_hosts(seeds), None),
        };

        if let Some(ref partitioner) = partitioner {
            inner.policy.set_partitioner(partitioner);
        }
        for host in hosts {
            if !inner.cfg.accept(&host) {
                debug!(inner.log, "host filtered out"; "host" => %host.connect_address());
                continue;
            }
            inner.ring.add_or_update(host);
        }

        let hosts = inner.ring.all_hosts();
        inner.pool.set_hosts(&hosts);
        for host in hosts.iter().filter(|h| h.is_up()) {
            inner.policy.add_host(host);
        }
        if inner.pool.size() == 0 {
            return Err(Error::NoConnectionsStarted);
        }

        if let Some(events) = events {
            self.start_events(events);
        }
        if let Some(ref control) = inner.control {
            let weak = Arc::downgrade(&self.0);
            control.on_reconnect(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.refresh_ring() {
                        warn!(inner.log, "unable to refresh ring: {}", e);
                    }
                }
            });
        }
        if let Some(interval) = inner.cfg.reconnect_interval() {
            self.start_reconnect_timer(interval);
        }

        info!(
            inner.log,
            "session started";
            "hosts" => inner.ring.len(),
            "connections" => inner.pool.size()
        );
        Ok(())
    }

    fn start_events(&self, events: Receiver<Event>) {
        let inner = &self.0;
        let quiet = inner.cfg.events.debounce();
        let capacity = inner.cfg.events.buffer_capacity();

        let weak = Arc::downgrade(&self.0);
        let node_events = EventDebouncer::new(
            "node",
            quiet,
            capacity,
            move |batch| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_node_events(batch);
                }
            },
            &inner.log,
        );
        let weak = Arc::downgrade(&self.0);
        let schema_events = EventDebouncer::new(
            "schema",
            quiet,
            capacity,
            move |batch| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_schema_events(batch);
                }
            },
            &inner.log,
        );
        *inner.node_events.lock().unwrap_or_else(|e| e.into_inner()) = Some(node_events);
        *inner.schema_events.lock().unwrap_or_else(|e| e.into_inner()) = Some(schema_events);

        let weak = Arc::downgrade(&self.0);
        let pump = thread::spawn(move || event_pump(weak, events));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
    }

    fn start_reconnect_timer(&self, interval: Duration) {
        let inner = &self.0;
        debug!(inner.log, "starting down host reconnection, interval {:?}", interval);
        let timer = timer::Timer::new();
        let weak = Arc::downgrade(&self.0);
        let guard = timer.schedule_repeating(
            chrono::Duration::milliseconds(interval.as_millis() as i64),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.reconnect_downed_hosts();
                }
            },
        );
        *inner.reconnect_timer.lock().unwrap_or_else(|e| e.into_inner()) = Some((timer, guard));
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(self.log, "closing session");

        // Dropping the guard cancels the task.
        let _timer = self
            .reconnect_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ref control) = self.control {
            control.close();
        }
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            if pump.thread().id() != thread::current().id() {
                let _ = pump.join();
            }
        }
        for debouncer in &[&self.node_events, &self.schema_events] {
            let debouncer = debouncer.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(debouncer) = debouncer {
                debouncer.stop();
            }
        }
        self.pool.close();
    }

    // Route an event to its debouncer.
    fn dispatch(&self, event: Event) {
        let debouncer = match event {
            Event::Topology { .. } | Event::Status { .. } => &self.node_events,
            Event::Schema(_) => &self.schema_events,
        };
        let debouncer = debouncer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref debouncer) = *debouncer {
            debouncer.submit(event);
        }
    }

    fn handle_node_events(&self, batch: Vec<Event>) {
        if self.is_closed() {
            return;
        }

        // Only the last change reported for each node matters.
        let mut order = Vec::new();
        let mut latest: HashMap<SocketAddr, Event> = HashMap::new();
        for event in batch {
            let addr = match event {
                Event::Topology { address, .. } | Event::Status { address, .. } => address,
                Event::Schema(_) => continue,
            };
            let addr = self.translate(addr);
            if latest.insert(addr, event).is_none() {
                order.push(addr);
            }
        }

        for addr in order {
            match latest.remove(&addr) {
                Some(Event::Topology { change, .. }) => match change {
                    TopologyChange::NewNode => self.handle_new_node(addr),
                    TopologyChange::RemovedNode => self.handle_removed_node(addr),
                    TopologyChange::MovedNode => {
                        trace!(self.log, "ignoring moved node"; "host" => %addr)
                    }
                },
                Some(Event::Status { change, .. }) => match change {
                    StatusChange::Up => self.handle_node_up(addr),
                    StatusChange::Down => self.handle_node_down(addr),
                },
                _ => (),
            }
        }
    }

    fn handle_schema_events(&self, batch: Vec<Event>) {
        for event in batch {
            if let Event::Schema(change) = event {
                debug!(
                    self.log,
                    "schema change";
                    "change" => &change.change,
                    "target" => &change.target,
                    "keyspace" => &change.keyspace,
                    "name" => &change.name
                );
                if !change.keyspace.is_empty() {
                    self.prepared.remove_keyspace(&change.keyspace);
                }
            }
        }
    }

    fn handle_new_node(&self, addr: SocketAddr) {
        info!(self.log, "new node"; "host" => %addr);
        let host = self
            .lookup_host(addr)
            .unwrap_or_else(|| Arc::new(HostInfo::new(addr)));
        self.add_host(host);
    }

    fn handle_removed_node(&self, addr: SocketAddr) {
        info!(self.log, "removed node"; "host" => %addr);
        self.remove_host(addr);
    }

    fn handle_node_up(&self, addr: SocketAddr) {
        let host = match self.ring.get_host(&addr) {
            Some(host) => host,
            None => {
                self.handle_new_node(addr);
                return;
            }
        };
        if !self.cfg.accept(&host) {
            return;
        }
        info!(self.log, "node up"; "host" => %addr);
        host.mark_up();
        self.pool.host_up(&host);
        if host.is_up() {
            self.policy.host_up(&host);
        }
    }

    fn handle_node_down(&self, addr: SocketAddr) {
        if let Some(host) = self.ring.get_host(&addr) {
            info!(self.log, "node down"; "host" => %addr);
            host.mark_down();
            self.policy.host_down(&addr);
            self.pool.host_down(&addr);
        }
    }

    // Register a host and open its pool. Returns false for filtered hosts.
    fn add_host(&self, host: Host) -> bool {
        if !self.cfg.accept(&host) {
            debug!(self.log, "host filtered out"; "host" => %host.connect_address());
            return false;
        }
        let (host, existed) = self.ring.add_or_update(host);
        if existed && host.is_up() && self.pool.get_pool(&host.connect_address()).is_some() {
            return true;
        }
        host.mark_up();
        self.pool.add_host(&host);
        if host.is_up() {
            self.policy.add_host(&host);
        }
        true
    }

    fn remove_host(&self, addr: SocketAddr) {
        if let Some(host) = self.ring.remove_host(&addr) {
            host.mark_down();
        }
        self.policy.remove_host(&addr);
        self.pool.remove_host(&addr);
        self.prepared.remove_host(&addr);
    }

    fn refresh_ring(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let control = match self.control {
            Some(ref control) if !self.cfg.disable_initial_host_lookup => control,
            _ => return Ok(()),
        };

        let (hosts, partitioner) = control.fetch_hosts()?;
        if let Some(ref partitioner) = partitioner {
            self.policy.set_partitioner(partitioner);
        }

        let mut stale = self.ring.current_hosts();
        for host in hosts {
            let addr = host.connect_address();
            if !self.cfg.accept(&host) {
                continue;
            }
            stale.remove(&addr);
            match self.ring.get_host(&addr) {
                Some(known) => known.update(&host),
                None => {
                    self.add_host(host);
                }
            }
        }
        for addr in stale.keys() {
            self.handle_removed_node(*addr);
        }
        debug!(self.log, "ring refreshed"; "hosts" => self.ring.len());
        Ok(())
    }

    fn reconnect_downed_hosts(&self) {
        if self.is_closed() {
            return;
        }
        for host in self.ring.all_hosts() {
            if host.is_up() {
                continue;
            }
            debug!(self.log, "reconnecting to down host"; "host" => %host.connect_address());
            if self.pool.host_up(&host).is_some() {
                info!(self.log, "down host reconnected"; "host" => %host.connect_address());
                host.mark_up();
                self.policy.host_up(&host);
            }
        }
    }

    // Find a node in the cluster's member list.
    fn lookup_host(&self, addr: SocketAddr) -> Option<Host> {
        let control = self.control.as_ref()?;
        if self.cfg.disable_initial_host_lookup {
            return None;
        }
        match control.fetch_hosts() {
            Ok((hosts, _)) => hosts.into_iter().find(|h| h.connect_address() == addr),
            Err(e) => {
                warn!(self.log, "unable to look up host: {}", e; "host" => %addr);
                None
            }
        }
    }

    fn translate(&self, addr: SocketAddr) -> SocketAddr {
        match self.control {
            Some(ref control) => control.translate(addr.ip(), addr.port()),
            None => addr,
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn event_pump(inner: Weak<SessionInner>, events: Receiver<Event>) {
    loop {
        let event = match events.recv_timeout(Duration::from_millis(EVENT_POLL_MS)) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        if inner.is_closed() {
            break;
        }
        if let Some(event) = event {
            trace!(inner.log, "event received"; "event" => ?event);
            inner.dispatch(event);
        }
    }
}

// The control connection is only needed to look up hosts or to hear events.
fn control_disabled(cfg: &ClusterConfig) -> bool {
    cfg.disable_initial_host_lookup
        && cfg.events.disable_topology_events
        && cfg.events.disable_node_status_events
        && cfg.events.disable_schema_events
}

fn seed_hosts(seeds: &[SocketAddr]) -> Vec<Host> {
    seeds.iter().map(|addr| Arc::new(HostInfo::new(*addr))).collect()
}

/// Resolve seed host strings, with or without a port, into addresses.
/// Unresolvable entries are skipped.
pub fn resolve_seeds(hosts: &[String], port: u16, log: &Logger) -> Result<Vec<SocketAddr>, Error> {
    let mut seeds: Vec<SocketAddr> = Vec::new();
    for host in hosts {
        let resolved = host
            .as_str()
            .to_socket_addrs()
            .or_else(|_| (host.as_str(), port).to_socket_addrs());
        match resolved {
            Ok(addrs) => {
                for addr in addrs {
                    if !seeds.contains(&addr) {
                        seeds.push(addr);
                    }
                }
            }
            Err(e) => warn!(log, "unable to resolve seed host: {}", e; "seed" => host.as_str()),
        }
    }
    if seeds.is_empty() {
        return Err(Error::NoHosts);
    }
    Ok(seeds)
}
