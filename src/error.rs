// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// An error reported by a server node in an ERROR frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub message: String,
}

impl ServerError {
    pub const SERVER: i32 = 0x0000;
    pub const PROTOCOL: i32 = 0x000A;
    pub const CREDENTIALS: i32 = 0x0100;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const BOOTSTRAPPING: i32 = 0x1002;
    pub const TRUNCATE: i32 = 0x1003;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const SYNTAX: i32 = 0x2000;
    pub const UNAUTHORIZED: i32 = 0x2100;
    pub const INVALID: i32 = 0x2200;
    pub const CONFIG: i32 = 0x2300;
    pub const ALREADY_EXISTS: i32 = 0x2400;
    pub const UNPREPARED: i32 = 0x2500;

    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        ServerError {
            code,
            message: message.into(),
        }
    }

    pub fn is_unprepared(&self) -> bool {
        self.code == Self::UNPREPARED
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "server error {:#06x}: {}", self.code, self.message)
    }
}

/// The error type shared by every layer of the client.
///
/// `Error` is `Clone` so that a single fatal connection error can be handed
/// to every call that was waiting on that connection.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
    #[error("no stream ids available on connection")]
    NoStreamsAvailable,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no connections available to execute the query")]
    NoConnections,
    #[error("no usable hosts provided")]
    NoHosts,
    #[error("no connections were made when creating the session")]
    NoConnectionsStarted,
    #[error("session has been closed")]
    SessionClosed,
    #[error("unsupported protocol version {requested} (server offered {server:?})")]
    UnsupportedProtocol { requested: u8, server: Option<u8> },
    #[error("unable to discover protocol version: {0}")]
    ProtocolDiscovery(String),
    #[error("no control connection available")]
    NoControlConnection,
    #[error("unknown partitioner {0}")]
    UnknownPartitioner(String),
    #[error("invalid token {0:?}")]
    InvalidToken(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Server(ServerError),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl From<ServerError> for Error {
    fn from(error: ServerError) -> Self {
        Error::Server(error)
    }
}

impl Error {
    /// Errors after which the connection that produced them is unusable.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(_) | Error::Protocol(_) | Error::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Errors meaning "this node is busy right now, try another".
    pub fn is_saturation(&self) -> bool {
        match self {
            Error::NoStreamsAvailable | Error::NoConnections => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            _ => false,
        }
    }

    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }
}
