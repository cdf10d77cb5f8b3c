// Copyright 2020 Joyent, Inc.

//! A protocol connection carrying many concurrent requests over one socket.
//!
//! Each request is tagged with a stream id taken from a bounded free list.
//! A dedicated reader thread owns the receive half of the socket: it reads
//! one frame at a time and hands it to the caller that owns the frame's stream
//! id. Callers block on their own single-use response slot, never on the
//! socket.
//!
//! A caller that gives up waiting does not return its stream id. The id stays
//! allocated until the server's late response arrives or the connection
//! closes, so the late response can never be handed to a new caller that was
//! given a recycled id.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread;
use std::time::Duration;

use slog::{debug, error, o, warn, Logger};

use crate::connection::{ConnConfig, Connection, Connector};
use crate::error::{Error, ServerError};
use crate::frame::{
    self, Event, Frame, Opcode, QueryResult, Request, Response, MAX_PROTOCOL_VERSION,
};
use crate::host::Host;

type ResponseSlot = SyncSender<Result<Frame, Error>>;

struct StreamTable {
    free: Vec<i16>,
    calls: HashMap<i16, ResponseSlot>,
}

pub struct MultiplexedConnection {
    addr: SocketAddr,
    version: u8,
    writer: Mutex<TcpStream>,
    socket: TcpStream,
    streams: RwLock<StreamTable>,
    closed: AtomicBool,
    consecutive_timeouts: AtomicU32,
    max_consecutive_timeouts: u32,
    timeout: Duration,
    log: Logger,
}

impl MultiplexedConnection {
    /// Connect to `addr` and complete the STARTUP handshake. Events pushed by
    /// the server are forwarded to `events` when one is given and discarded
    /// otherwise.
    pub fn dial(
        addr: SocketAddr,
        cfg: &ConnConfig,
        events: Option<Sender<Event>>,
        log: &Logger,
    ) -> Result<Arc<Self>, Error> {
        let log = log.new(o!("host" => addr.to_string()));
        let version = if cfg.proto_version == 0 {
            MAX_PROTOCOL_VERSION
        } else {
            cfg.proto_version
        };

        let stream = TcpStream::connect_timeout(&addr, cfg.connect_timeout)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let socket = stream.try_clone()?;

        // Stream 0 is never handed out.
        let limit = frame::max_streams(version) - 1;
        let limit = cfg.max_streams.map_or(limit, |m| m.min(limit));
        let free: Vec<i16> = (1..=limit as i16).rev().collect();

        let conn = Arc::new(MultiplexedConnection {
            addr,
            version,
            writer: Mutex::new(stream),
            socket,
            streams: RwLock::new(StreamTable {
                free,
                calls: HashMap::with_capacity(limit),
            }),
            closed: AtomicBool::new(false),
            consecutive_timeouts: AtomicU32::new(0),
            max_consecutive_timeouts: cfg.max_consecutive_timeouts,
            timeout: cfg.timeout,
            log,
        });

        let weak = Arc::downgrade(&conn);
        let reader_log = conn.log.clone();
        thread::Builder::new()
            .name(format!("reader-{}", addr))
            .spawn(move || reader_loop(weak, BufReader::new(reader), events, reader_log))?;

        if let Err(e) = conn.startup() {
            conn.close_with(e.clone());
            return Err(e);
        }
        debug!(conn.log, "connected"; "version" => version);
        Ok(conn)
    }

    /// A connector dialing plain pool connections, which ignore events.
    pub fn connector(cfg: ConnConfig, log: Logger) -> Connector<MultiplexedConnection> {
        Arc::new(move |host: &Host| {
            MultiplexedConnection::dial(host.connect_address(), &cfg, None, &log)
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn in_flight(&self) -> usize {
        self.read_streams().calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, request: &Request) -> Result<Response, Error> {
        let frame = self.call(request.opcode(), &request.encode(self.version))?;
        match self.decode(&frame) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.close_with(e.clone());
                Err(e)
            }
        }
    }

    /// Run a statement with consistency ONE and no values.
    pub fn query(&self, statement: &str) -> Result<QueryResult, Error> {
        self.send(&Request::Query {
            statement: statement.to_string(),
            params: frame::QueryParams {
                consistency: 0x0001,
                values: Vec::new(),
            },
        })?
        .into_result()
    }

    /// An OPTIONS round trip, used as a heartbeat.
    pub fn options(&self) -> Result<(), Error> {
        match self.send(&Request::Options)? {
            Response::Supported(_) => Ok(()),
            Response::Error(e) => Err(Error::Server(e)),
            other => Err(Error::Protocol(format!(
                "unexpected {:?} response to OPTIONS",
                other.opcode()
            ))),
        }
    }

    /// Subscribe this connection to the given event classes.
    pub fn register(&self, classes: &[String]) -> Result<(), Error> {
        match self.send(&Request::Register(classes.to_vec()))? {
            Response::Ready => Ok(()),
            Response::Error(e) => Err(Error::Server(e)),
            other => Err(Error::Protocol(format!(
                "unexpected {:?} response to REGISTER",
                other.opcode()
            ))),
        }
    }

    pub fn close(&self) {
        self.close_with(Error::ConnectionClosed)
    }

    fn startup(&self) -> Result<(), Error> {
        let frame = self.call(Opcode::Startup, &Request::startup().encode(self.version))?;
        let server_version = frame.header.version;
        match self.decode(&frame)? {
            Response::Ready => Ok(()),
            Response::Error(ref e) if e.code == ServerError::PROTOCOL => {
                Err(Error::UnsupportedProtocol {
                    requested: self.version,
                    server: if server_version != self.version {
                        Some(server_version)
                    } else {
                        None
                    },
                })
            }
            Response::Error(e) => Err(Error::Server(e)),
            other => Err(Error::Protocol(format!(
                "unexpected {:?} response to STARTUP",
                other.opcode()
            ))),
        }
    }

    fn decode(&self, frame: &Frame) -> Result<Response, Error> {
        let (env, resp) = Response::decode_frame(frame)?;
        for w in &env.warnings {
            warn!(self.log, "server warning: {}", w; "stream" => frame.header.stream);
        }
        if let Some(id) = env.tracing_id {
            debug!(self.log, "traced response"; "tracing_id" => id.to_string());
        }
        Ok(resp)
    }

    fn call(&self, opcode: Opcode, body: &[u8]) -> Result<Frame, Error> {
        let (tx, rx) = sync_channel(1);
        let stream = {
            let mut table = self.write_streams();
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            let stream = table.free.pop().ok_or(Error::NoStreamsAvailable)?;
            table.calls.insert(stream, tx);
            stream
        };

        let bytes = frame::encode_frame(self.version, false, stream, opcode, body);
        let written = {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_all(&bytes).and_then(|_| writer.flush())
        };
        if let Err(e) = written {
            let err = Error::from(e);
            self.close_with(err.clone());
            return Err(err);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(frame)) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                Ok(frame)
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(self.log, "request timed out"; "stream" => stream, "consecutive" => count);
                if count >= self.max_consecutive_timeouts {
                    warn!(
                        self.log,
                        "closing connection after {} consecutive timeouts", count
                    );
                    self.close_with(Error::Timeout);
                }
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    // Hand a response frame to the caller owning its stream id. The id is
    // returned to the free list in the same critical section that removes the
    // call, whether or not the caller is still waiting.
    fn deliver(&self, frame: Frame) -> Result<(), Error> {
        let stream = frame.header.stream;
        let slot = {
            let mut table = self.write_streams();
            let slot = table.calls.remove(&stream);
            if slot.is_some() {
                table.free.push(stream);
            }
            slot
        };
        match slot {
            Some(slot) => {
                // The caller may have timed out and gone away.
                let _ = slot.try_send(Ok(frame));
                Ok(())
            }
            None if self.is_closed() => Ok(()),
            None => Err(Error::Protocol(format!(
                "response on unused stream {}",
                stream
            ))),
        }
    }

    fn dispatch_event(&self, frame: Frame, events: &Option<Sender<Event>>) -> Result<(), Error> {
        match self.decode(&frame)? {
            Response::Event(event) => {
                debug!(self.log, "received event"; "class" => event.class());
                if let Some(tx) = events {
                    // The receiver going away only means nobody listens
                    // for events any more.
                    let _ = tx.send(event);
                }
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected {:?} frame on event stream",
                other.opcode()
            ))),
        }
    }

    // Close the connection and fail every pending call with `err`. Only the
    // first call has any effect.
    fn close_with(&self, err: Error) {
        let calls: Vec<ResponseSlot> = {
            let mut table = self.write_streams();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            table.free.clear();
            table.calls.drain().map(|(_, slot)| slot).collect()
        };

        match &err {
            Error::ConnectionClosed => debug!(self.log, "connection closed"),
            Error::Protocol(_) => error!(self.log, "closing connection: {}", err),
            _ => warn!(self.log, "closing connection: {}", err),
        }

        let _ = self.socket.shutdown(Shutdown::Both);
        for slot in calls {
            let _ = slot.try_send(Err(err.clone()));
        }
    }

    fn read_streams(&self) -> RwLockReadGuard<StreamTable> {
        self.streams.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_streams(&self) -> RwLockWriteGuard<StreamTable> {
        self.streams.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connection for MultiplexedConnection {
    fn send(&self, request: &Request) -> Result<Response, Error> {
        MultiplexedConnection::send(self, request)
    }

    fn available_streams(&self) -> usize {
        self.read_streams().free.len()
    }

    fn has_broken(&self) -> bool {
        self.is_closed()
    }

    fn close(&self) {
        MultiplexedConnection::close(self)
    }

    fn address(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MultiplexedConnection {
    fn drop(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("addr", &self.addr)
            .field("version", &self.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// The reader only holds a weak reference between frames, so dropping the last
// handle to a connection shuts the socket down and ends this thread.
fn reader_loop(
    conn: Weak<MultiplexedConnection>,
    mut reader: BufReader<TcpStream>,
    events: Option<Sender<Event>>,
    log: Logger,
) {
    loop {
        let result = frame::read_frame(&mut reader);
        let conn = match conn.upgrade() {
            Some(conn) => conn,
            None => break,
        };
        let outcome = result.and_then(|frame| {
            if frame.header.stream < 0 {
                conn.dispatch_event(frame, &events)
            } else {
                conn.deliver(frame)
            }
        });
        if let Err(e) = outcome {
            conn.close_with(e);
            break;
        }
    }
    debug!(log, "reader exiting");
}
