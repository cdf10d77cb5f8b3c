// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::io::{BufReader, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::{o, Drain, Level, LevelFilter, Logger};
use uuid::Uuid;

use shoal::connection::{Connection, Connector};
use shoal::error::{Error, ServerError};
use shoal::frame::message::value;
use shoal::frame::{
    self, ColumnSpec, ColumnType, Envelope, Event, QueryResult, Request, Response, Rows,
    EVENT_STREAM, MAX_PROTOCOL_VERSION,
};
use shoal::host::Host;

pub const LOG_LEVEL_ENV_VAR: &str = "SHOAL_LOG_LEVEL";

pub fn parse_log_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::Trace),
        "debug" => Some(Level::Debug),
        "info" => Some(Level::Info),
        "warning" => Some(Level::Warning),
        "error" => Some(Level::Error),
        "critical" => Some(Level::Critical),
        _ => None,
    }
}

/// A terminal logger at the level named by `SHOAL_LOG_LEVEL`, or a logger
/// that discards everything when it is unset.
pub fn log_from_env() -> Logger {
    let level = env::var(LOG_LEVEL_ENV_VAR)
        .ok()
        .and_then(|l| parse_log_level(&l));
    match level {
        Some(level) => {
            let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
            Logger::root(
                Mutex::new(LevelFilter::new(
                    slog_term::FullFormat::new(plain).build(),
                    level,
                ))
                .fuse(),
                o!("build-id" => "0.1.0"),
            )
        }
        None => Logger::root(slog::Discard, o!()),
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// What a node reports about itself in the system tables.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub datacenter: String,
    pub rack: String,
    pub host_id: Uuid,
    pub tokens: Vec<String>,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, token: &str) -> Self {
        PeerInfo {
            addr,
            datacenter: String::from("dc1"),
            rack: String::from("rack1"),
            host_id: Uuid::new_v4(),
            tokens: vec![token.to_string()],
        }
    }
}

struct Client {
    writer: Mutex<TcpStream>,
    version: AtomicU8,
    registered: AtomicBool,
}

impl Client {
    fn write(&self, version: u8, stream: i16, resp: &Response) {
        self.write_with(version, stream, &Envelope::default(), resp)
    }

    fn write_with(&self, version: u8, stream: i16, env: &Envelope, resp: &Response) {
        let mut body = Vec::new();
        env.encode(&mut body);
        body.extend(resp.encode(version));
        let (flags, opcode) = (env.flags(), resp.opcode());
        let bytes = frame::encode_frame_with_flags(version, true, flags, stream, opcode, &body);
        let mut writer = self.writer.lock().unwrap();
        let _ = writer.write_all(&bytes).and_then(|_| writer.flush());
    }

    fn shutdown(&self) {
        let _ = self.writer.lock().unwrap().shutdown(Shutdown::Both);
    }
}

struct NodeShared {
    info: Mutex<PeerInfo>,
    max_version: u8,
    partitioner: String,
    peers: Mutex<Vec<PeerInfo>>,
    clients: Mutex<Vec<Arc<Client>>>,
    unprepare_next: AtomicBool,
    connections: AtomicUsize,
    queries: AtomicUsize,
    prepares: AtomicUsize,
    executes: AtomicUsize,
    stopped: AtomicBool,
}

/// A single cluster node listening on localhost. It answers STARTUP,
/// OPTIONS, REGISTER, PREPARE and EXECUTE, serves `system.local` and
/// `system.peers`, and echoes every other statement back as one row with
/// the columns `stmt` and `node`. Statements starting with `HOLD` are never
/// answered, statements starting with `SLOW` are answered after 300ms and
/// statements starting with `FAIL` get an UNAVAILABLE error. Statements
/// starting with `WARN` are echoed with a server warning and a tracing id
/// ahead of the result.
pub struct MockNode {
    addr: SocketAddr,
    shared: Arc<NodeShared>,
    acceptor: Option<JoinHandle<()>>,
}

impl MockNode {
    pub fn start() -> MockNode {
        MockNode::with_version(MAX_PROTOCOL_VERSION)
    }

    pub fn with_version(max_version: u8) -> MockNode {
        MockNode::listen(TcpListener::bind("127.0.0.1:0").unwrap(), max_version)
    }

    /// Start a node on a fixed address, such as one a stopped node used.
    pub fn start_on(addr: SocketAddr) -> MockNode {
        MockNode::listen(TcpListener::bind(addr).unwrap(), MAX_PROTOCOL_VERSION)
    }

    fn listen(listener: TcpListener, max_version: u8) -> MockNode {
        let addr = listener.local_addr().unwrap();
        let token = (u64::from(addr.port()) * 1_000_000).to_string();
        let shared = Arc::new(NodeShared {
            info: Mutex::new(PeerInfo::new(addr, &token)),
            max_version,
            partitioner: String::from("org.apache.cassandra.dht.Murmur3Partitioner"),
            peers: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            unprepare_next: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        let acceptor = thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Ok(stream) = stream {
                    let shared = Arc::clone(&accept_shared);
                    thread::spawn(move || serve(shared, stream));
                }
            }
        });

        MockNode {
            addr,
            shared,
            acceptor: Some(acceptor),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn info(&self) -> PeerInfo {
        self.shared.info.lock().unwrap().clone()
    }

    pub fn set_datacenter(&self, dc: &str) {
        self.shared.info.lock().unwrap().datacenter = dc.to_string();
    }

    /// List another node in this node's `system.peers`.
    pub fn add_peer(&self, peer: PeerInfo) {
        self.shared.peers.lock().unwrap().push(peer);
    }

    pub fn remove_peer(&self, addr: SocketAddr) {
        self.shared.peers.lock().unwrap().retain(|p| p.addr != addr);
    }

    /// Answer the next EXECUTE with an UNPREPARED error.
    pub fn unprepare_next(&self) {
        self.shared.unprepare_next.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.shared.queries.load(Ordering::SeqCst)
    }

    pub fn prepares(&self) -> usize {
        self.shared.prepares.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.shared.executes.load(Ordering::SeqCst)
    }

    /// The number of connections registered for events.
    pub fn registered(&self) -> usize {
        self.shared
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.registered.load(Ordering::SeqCst))
            .count()
    }

    /// Push an event to every connection registered for events.
    pub fn push_event(&self, event: Event) {
        let clients: Vec<Arc<Client>> = self.shared.clients.lock().unwrap().clone();
        for client in clients {
            if client.registered.load(Ordering::SeqCst) {
                let version = client.version.load(Ordering::SeqCst);
                client.write(version, EVENT_STREAM, &Response::Event(event.clone()));
            }
        }
    }

    /// Stop listening and drop every client connection.
    pub fn stop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the acceptor so it notices.
        let _ = TcpStream::connect(self.addr);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        for client in self.shared.clients.lock().unwrap().drain(..) {
            client.shutdown();
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(shared: Arc<NodeShared>, stream: TcpStream) {
    let client = Arc::new(Client {
        writer: Mutex::new(stream.try_clone().unwrap()),
        version: AtomicU8::new(MAX_PROTOCOL_VERSION),
        registered: AtomicBool::new(false),
    });
    shared.clients.lock().unwrap().push(Arc::clone(&client));
    shared.connections.fetch_add(1, Ordering::SeqCst);

    let mut reader = BufReader::new(stream);
    loop {
        let frame = match frame::read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let version = frame.header.version;
        let stream = frame.header.stream;
        if version > shared.max_version {
            let err = ServerError::new(
                ServerError::PROTOCOL,
                format!("unsupported protocol version {}", version),
            );
            client.write(shared.max_version, stream, &Response::Error(err));
            continue;
        }
        client.version.store(version, Ordering::SeqCst);

        let request = match Request::decode(frame.header.opcode, version, &frame.body) {
            Ok(request) => request,
            Err(_) => break,
        };
        let shared = Arc::clone(&shared);
        let client = Arc::clone(&client);
        let env = envelope_for(&request);
        thread::spawn(move || {
            if let Some(resp) = respond(&shared, &client, request) {
                client.write_with(version, stream, &env, &resp);
            }
        });
    }

    shared.connections.fetch_sub(1, Ordering::SeqCst);
    shared
        .clients
        .lock()
        .unwrap()
        .retain(|c| !Arc::ptr_eq(c, &client));
}

fn envelope_for(request: &Request) -> Envelope {
    match request {
        Request::Query { statement, .. } if statement.starts_with("WARN") => Envelope {
            tracing_id: Some(Uuid::new_v4()),
            warnings: vec![String::from("aggregation query used without partition key")],
            ..Envelope::default()
        },
        _ => Envelope::default(),
    }
}

fn respond(shared: &NodeShared, client: &Client, request: Request) -> Option<Response> {
    let resp = match request {
        Request::Startup(_) => Response::Ready,
        Request::Options => {
            let mut supported = HashMap::new();
            supported.insert(String::from("CQL_VERSION"), vec![String::from("3.0.0")]);
            Response::Supported(supported)
        }
        Request::Register(_) => {
            client.registered.store(true, Ordering::SeqCst);
            Response::Ready
        }
        Request::Query { statement, .. } => {
            if statement.contains("system.local") {
                Response::Result(QueryResult::Rows(local_rows(shared)))
            } else if statement.contains("system.peers") {
                Response::Result(QueryResult::Rows(peer_rows(shared)))
            } else if statement.starts_with("HOLD") {
                return None;
            } else {
                if statement.starts_with("SLOW") {
                    thread::sleep(Duration::from_millis(300));
                }
                shared.queries.fetch_add(1, Ordering::SeqCst);
                if statement.starts_with("FAIL") {
                    Response::Error(ServerError::new(ServerError::UNAVAILABLE, "unavailable"))
                } else {
                    Response::Result(QueryResult::Rows(echo_rows(shared, &statement)))
                }
            }
        }
        Request::Prepare(statement) => {
            shared.prepares.fetch_add(1, Ordering::SeqCst);
            Response::Result(QueryResult::Prepared(statement.into_bytes()))
        }
        Request::Execute { id, .. } => {
            shared.executes.fetch_add(1, Ordering::SeqCst);
            if shared.unprepare_next.swap(false, Ordering::SeqCst) {
                Response::Error(ServerError::new(ServerError::UNPREPARED, "unprepared"))
            } else {
                let statement = String::from_utf8_lossy(&id).into_owned();
                Response::Result(QueryResult::Rows(echo_rows(shared, &statement)))
            }
        }
    };
    Some(resp)
}

fn local_ip() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn local_rows(shared: &NodeShared) -> Rows {
    let info = shared.info.lock().unwrap().clone();
    let col = |name, kind| ColumnSpec::new("system", "local", name, kind);
    let mut rows = Rows::new(vec![
        col("key", ColumnType::Varchar),
        col("broadcast_address", ColumnType::Inet),
        col("rpc_address", ColumnType::Inet),
        col("data_center", ColumnType::Varchar),
        col("rack", ColumnType::Varchar),
        col("host_id", ColumnType::Uuid),
        col("release_version", ColumnType::Varchar),
        col("partitioner", ColumnType::Varchar),
        col("tokens", ColumnType::Set(Box::new(ColumnType::Varchar))),
    ]);
    rows.push(vec![
        Some(value::text("local")),
        Some(value::inet(local_ip())),
        Some(value::inet(local_ip())),
        Some(value::text(&info.datacenter)),
        Some(value::text(&info.rack)),
        Some(value::uuid(&info.host_id)),
        Some(value::text("3.11.4")),
        Some(value::text(&shared.partitioner)),
        Some(value::string_set(&info.tokens)),
    ]);
    rows
}

fn peer_rows(shared: &NodeShared) -> Rows {
    let col = |name, kind| ColumnSpec::new("system", "peers", name, kind);
    let mut rows = Rows::new(vec![
        col("peer", ColumnType::Inet),
        col("rpc_address", ColumnType::Inet),
        col("data_center", ColumnType::Varchar),
        col("rack", ColumnType::Varchar),
        col("host_id", ColumnType::Uuid),
        col("release_version", ColumnType::Varchar),
        col("tokens", ColumnType::Set(Box::new(ColumnType::Varchar))),
        col("native_port", ColumnType::Int),
    ]);
    for peer in shared.peers.lock().unwrap().iter() {
        rows.push(vec![
            Some(value::inet(peer.addr.ip())),
            Some(value::inet(peer.addr.ip())),
            Some(value::text(&peer.datacenter)),
            Some(value::text(&peer.rack)),
            Some(value::uuid(&peer.host_id)),
            Some(value::text("3.11.4")),
            Some(value::string_set(&peer.tokens)),
            Some(value::int(i32::from(peer.addr.port()))),
        ]);
    }
    rows
}

fn echo_rows(shared: &NodeShared, statement: &str) -> Rows {
    let addr = shared.info.lock().unwrap().addr;
    let mut rows = Rows::new(vec![
        ColumnSpec::new("test", "echo", "stmt", ColumnType::Varchar),
        ColumnSpec::new("test", "echo", "node", ColumnType::Varchar),
    ]);
    rows.push(vec![
        Some(value::text(statement)),
        Some(value::text(&addr.to_string())),
    ]);
    rows
}

/// The `(stmt, node)` pair of an echoed row.
pub fn echoed(result: &QueryResult) -> (String, String) {
    let rows = result.rows().expect("expected rows");
    let row = rows.iter().next().expect("expected one row");
    (
        row.get_text("stmt").unwrap().unwrap(),
        row.get_text("node").unwrap().unwrap(),
    )
}

/// The scripted behaviour of one node behind `DummyConnection`s.
#[derive(Debug)]
pub struct DummyNode {
    pub addr: SocketAddr,
    /// Refuse new connections while set.
    pub down: AtomicBool,
    pub saturated: AtomicBool,
    pub fail: Mutex<Option<ServerError>>,
    pub delay: Mutex<Option<Duration>>,
    pub unprepare_next: AtomicBool,
    pub dials: AtomicUsize,
    pub queries: AtomicUsize,
    pub prepares: AtomicUsize,
    pub executes: AtomicUsize,
}

impl DummyNode {
    pub fn new(addr: SocketAddr) -> Arc<DummyNode> {
        Arc::new(DummyNode {
            addr,
            down: AtomicBool::new(false),
            saturated: AtomicBool::new(false),
            fail: Mutex::new(None),
            delay: Mutex::new(None),
            unprepare_next: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
        })
    }

    pub fn fail_with(&self, code: i32) {
        *self.fail.lock().unwrap() = Some(ServerError::new(code, "scripted failure"));
    }
}

/// An in-memory connection answering from a `DummyNode`'s script.
#[derive(Debug)]
pub struct DummyConnection {
    node: Arc<DummyNode>,
    closed: AtomicBool,
}

impl DummyConnection {
    fn echo(&self, statement: &str) -> Response {
        let mut rows = Rows::new(vec![
            ColumnSpec::new("test", "echo", "stmt", ColumnType::Varchar),
            ColumnSpec::new("test", "echo", "node", ColumnType::Varchar),
        ]);
        rows.push(vec![
            Some(value::text(statement)),
            Some(value::text(&self.node.addr.to_string())),
        ]);
        Response::Result(QueryResult::Rows(rows))
    }
}

impl Connection for DummyConnection {
    fn send(&self, request: &Request) -> Result<Response, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if self.node.saturated.load(Ordering::SeqCst) {
            return Err(Error::NoStreamsAvailable);
        }
        let delay = *self.node.delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if let Some(ref err) = *self.node.fail.lock().unwrap() {
            return Ok(Response::Error(err.clone()));
        }
        let resp = match request {
            Request::Query { statement, .. } => {
                self.node.queries.fetch_add(1, Ordering::SeqCst);
                self.echo(statement)
            }
            Request::Prepare(statement) => {
                self.node.prepares.fetch_add(1, Ordering::SeqCst);
                Response::Result(QueryResult::Prepared(statement.clone().into_bytes()))
            }
            Request::Execute { id, .. } => {
                self.node.executes.fetch_add(1, Ordering::SeqCst);
                if self.node.unprepare_next.swap(false, Ordering::SeqCst) {
                    Response::Error(ServerError::new(ServerError::UNPREPARED, "unprepared"))
                } else {
                    self.echo(&String::from_utf8_lossy(id))
                }
            }
            _ => Response::Ready,
        };
        Ok(resp)
    }

    fn available_streams(&self) -> usize {
        if self.node.saturated.load(Ordering::SeqCst) {
            0
        } else {
            128
        }
    }

    fn has_broken(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn address(&self) -> SocketAddr {
        self.node.addr
    }
}

/// A connector reaching only the given nodes. Dialing any other address, or
/// a node that is down, fails with "connection refused".
pub fn dummy_connector(nodes: &[Arc<DummyNode>]) -> Connector<DummyConnection> {
    let nodes: HashMap<SocketAddr, Arc<DummyNode>> =
        nodes.iter().map(|n| (n.addr, Arc::clone(n))).collect();
    Arc::new(move |host: &Host| match nodes.get(&host.connect_address()) {
        Some(node) if !node.down.load(Ordering::SeqCst) => {
            node.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(DummyConnection {
                node: Arc::clone(node),
                closed: AtomicBool::new(false),
            }))
        }
        _ => Err(Error::from(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ))),
    })
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
