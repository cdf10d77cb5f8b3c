// Copyright 2020 Joyent, Inc.

//! A cluster-aware database client core
//!
//! Shoal manages live connections to a distributed set of database nodes. It
//! keeps track of which nodes make up the cluster, routes each query to an
//! appropriate node and connection, and recovers from node and connection
//! failures without the caller having to notice. The query language itself is
//! none of its business: statements and bound values arrive already encoded.
//!
//! ## Connections
//!
//! A [`MultiplexedConnection`](connection/multiplexed/struct.MultiplexedConnection.html)
//! carries many concurrent requests over a single socket. Every request is
//! tagged with a stream id, and a reader thread hands each response to the
//! caller that owns the id. A stream id is only reused once the response it
//! was issued for has arrived or the connection has closed, so a late response
//! can never reach the wrong caller.
//!
//! The pools and the query executor only rely on the
//! [`Connection`](connection/trait.Connection.html) trait, so anything that
//! can send a request and wait for its response can be pooled.
//!
//! ## Pools
//!
//! Each node gets a
//! [`HostConnPool`](connection_pool/host_pool/struct.HostConnPool.html) of
//! `num_conns` connections (two by default). Queries use whichever of the
//! node's connections has the most free stream ids. A pool that falls short of
//! its target size refills itself in the background, backing off between
//! failed attempts.
//!
//! The [`ConnectionPool`](connection_pool/struct.ConnectionPool.html) holds
//! the per-node pools and reconciles them against membership changes. Pools
//! for new nodes are created concurrently and are only registered once they
//! hold a live connection.
//!
//! ## Host selection
//!
//! A [`HostSelectionPolicy`](policies/enum.HostSelectionPolicy.html) decides
//! the order in which nodes are tried for each query:
//!
//! * round-robin over every node that is up
//! * round-robin over the nodes of the local datacenter, falling back to the
//!   others only when none are available locally
//! * token-aware: the node owning the query's routing key first, then the
//!   fallback policy's order
//! * health-weighted: nodes ordered by a moving average of latency and errors,
//!   with an occasional random pick so slow nodes get a chance to recover
//!
//! ## Cluster tracking
//!
//! A dedicated [`ControlConn`](control/struct.ControlConn.html) negotiates the
//! protocol version, reads the cluster's member list and subscribes to the
//! events the server pushes when nodes join, leave, go up or down, or when the
//! schema changes. Events arrive in bursts, so they are collected by an
//! [`EventDebouncer`](events/struct.EventDebouncer.html) and acted on as a
//! batch once the cluster has been quiet for a second. Nodes that are down are
//! retried periodically.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//!
//! use slog::{o, Drain, Logger};
//!
//! use shoal::config::ClusterConfig;
//! use shoal::query::Query;
//! use shoal::session::Session;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let mut cfg = ClusterConfig::new(vec!["10.0.0.1", "10.0.0.2:9043"]);
//! cfg.log = Some(log);
//!
//! let session = Session::new(cfg)?;
//! let result = session.execute(&Query::new("SELECT * FROM ks.users").prepared(true))?;
//!
//! for host in session.current_hosts() {
//!     println!("{}", host);
//! }
//! session.close();
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod control;
pub mod error;
pub mod events;
pub mod executor;
pub mod frame;
pub mod host;
pub mod policies;
pub mod prepared;
pub mod query;
pub mod retry;
pub mod ring;
pub mod session;
pub mod shuffle;
pub mod token;

pub use config::ClusterConfig;
pub use error::Error;
pub use query::Query;
pub use session::Session;
