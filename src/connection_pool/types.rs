// Copyright 2020 Joyent, Inc.

use std::fmt;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::shuffle::RandomSource;

/// The connection counts for the cluster pool
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ConnectionPoolStats {
    /// The number of hosts with a registered per-host pool
    pub host_pools: ConnectionCount,
    /// The total number of live connections across all hosts
    pub total_connections: ConnectionCount,
    /// The number of per-host pools below their target size
    pub underfilled_pools: ConnectionCount,
}

impl ConnectionPoolStats {
    /// Create a new instance of `ConnectionPoolStats`
    pub fn new() -> Self {
        ConnectionPoolStats {
            host_pools: ConnectionCount::from(0),
            total_connections: ConnectionCount::from(0),
            underfilled_pools: ConnectionCount::from(0),
        }
    }
}

impl Default for ConnectionPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a cluster connection pool.
#[derive(Clone, Debug, Default)]
pub struct ConnectionPoolOptions {
    /// An optional number of connections to keep open to each host. If not
    /// specified the default is 2.
    pub num_conns: Option<usize>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    /// An optional random source used to jitter fill back-off. A source seeded
    /// from the operating system is used when none is provided.
    pub random: Option<RandomSource>,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// Sum type representing the current state of the connection pool. Possible
/// states are running or closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionPoolState {
    /// The pool is running and maintaining connections to its hosts.
    Running,
    /// The pool has been closed and all of its connections released.
    Closed,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => fmt.write_str("running"),
            ConnectionPoolState::Closed => fmt.write_str("closed"),
        }
    }
}
