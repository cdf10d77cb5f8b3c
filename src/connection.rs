// Copyright 2020 Joyent, Inc.

pub mod multiplexed;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::frame::{Request, Response};
use crate::host::Host;

pub use multiplexed::MultiplexedConnection;

/// A connection to a single cluster node.
///
/// The `Connection` trait defines what the pools and the query executor need
/// from a connection. Implementations must be usable from many threads at
/// once: `send` is called concurrently by every query that shares the
/// connection, and must never block on another caller's request.
pub trait Connection: Send + Sync + 'static {
    /// Send one request and wait for its response. Fails immediately with
    /// `Error::NoStreamsAvailable` when the connection is saturated.
    fn send(&self, request: &Request) -> Result<Response, Error>;
    /// The number of additional requests that could be in flight right now.
    fn available_streams(&self) -> usize;
    /// Whether the connection is closed or otherwise unusable.
    fn has_broken(&self) -> bool;
    /// Close the connection. Calling this more than once is harmless.
    fn close(&self);
    fn address(&self) -> SocketAddr;
}

/// Establishes a new connection to a host. Pools call this from their own
/// threads, so it may block for as long as the connect timeout.
pub type Connector<C> = Arc<dyn Fn(&Host) -> Result<Arc<C>, Error> + Send + Sync>;

/// Per-connection settings.
#[derive(Clone, Debug)]
pub struct ConnConfig {
    /// The protocol version to speak. Zero means the highest supported.
    pub proto_version: u8,
    pub connect_timeout: Duration,
    /// How long a caller waits for its response.
    pub timeout: Duration,
    /// An optional cap below the protocol's own stream id limit.
    pub max_streams: Option<usize>,
    /// Consecutive request timeouts after which the connection is closed.
    pub max_consecutive_timeouts: u32,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            proto_version: 0,
            connect_timeout: Duration::from_millis(600),
            timeout: Duration::from_millis(11000),
            max_streams: None,
            max_consecutive_timeouts: 10,
        }
    }
}
