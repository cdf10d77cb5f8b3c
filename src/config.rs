// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use slog::{o, Drain, Logger};

use crate::connection::ConnConfig;
use crate::error::Error;
use crate::events::{DEFAULT_BUFFER_CAPACITY, DEFAULT_DEBOUNCE_MS};
use crate::frame::MAX_PROTOCOL_VERSION;
use crate::host::Host;
use crate::policies::PolicyConfig;
use crate::prepared::DEFAULT_MAX_PREPARED_STMTS;
use crate::retry::RetryPolicy;
use crate::shuffle::RandomSource;

pub const DEFAULT_PORT: u16 = 9042;
pub const DEFAULT_NUM_CONNS: usize = 2;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 600;
pub const DEFAULT_TIMEOUT_MS: u64 = 11_000;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_RETRY_INTERVAL_MS: u64 = 1000;

/// Decides whether a host may be used at all.
#[derive(Clone)]
pub struct HostFilter(Arc<dyn Fn(&Host) -> bool + Send + Sync>);

impl HostFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Host) -> bool + Send + Sync + 'static,
    {
        HostFilter(Arc::new(f))
    }

    /// Accept only hosts of one datacenter.
    pub fn datacenter<S: Into<String>>(dc: S) -> Self {
        let dc = dc.into();
        HostFilter::new(move |host| host.datacenter().as_ref() == Some(&dc))
    }

    /// Accept only hosts whose address is in the list.
    pub fn whitelist(addrs: Vec<IpAddr>) -> Self {
        HostFilter::new(move |host| addrs.contains(&host.connect_address().ip()))
    }

    pub fn accept(&self, host: &Host) -> bool {
        (self.0)(host)
    }
}

impl fmt::Debug for HostFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("HostFilter")
    }
}

/// Rewrites the address and port a node advertises into the one the client
/// should connect to, for clusters behind NAT.
#[derive(Clone)]
pub struct AddressTranslator(Arc<dyn Fn(IpAddr, u16) -> SocketAddr + Send + Sync>);

impl AddressTranslator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(IpAddr, u16) -> SocketAddr + Send + Sync + 'static,
    {
        AddressTranslator(Arc::new(f))
    }

    pub fn translate(&self, addr: IpAddr, port: u16) -> SocketAddr {
        (self.0)(addr, port)
    }
}

impl fmt::Debug for AddressTranslator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("AddressTranslator")
    }
}

/// Which server-pushed events the session subscribes to, and how they are
/// batched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub disable_topology_events: bool,
    pub disable_node_status_events: bool,
    pub disable_schema_events: bool,
    /// The quiet period before a batch of events is acted on. The default is
    /// 1000 milliseconds.
    pub debounce_ms: Option<u64>,
    /// The most events buffered between flushes. The default is 1000.
    pub buffer_capacity: Option<usize>,
}

impl EventsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS))
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY)
    }
}

/// The configuration of a session.
///
/// Only `hosts` is required; every other field has a default. The runtime
/// hooks at the end cannot be deserialized and are set in code.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterConfig {
    /// Seed hosts, as `host` or `host:port`. Names are resolved when the
    /// session starts.
    pub hosts: Vec<String>,
    /// The port used for seeds and discovered hosts that do not name one. The
    /// default is 9042.
    pub port: Option<u16>,
    /// Connections per host. The default is 2.
    pub num_conns: Option<usize>,
    /// The default is 600 milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// How long a query waits for its response. The default is 11 seconds.
    pub timeout_ms: Option<u64>,
    /// How often down hosts are retried. The default is 60 seconds; zero
    /// disables reconnection.
    pub reconnect_interval_ms: Option<u64>,
    /// The protocol version to use. Zero or unset means discover it.
    pub proto_version: Option<u8>,
    /// An optional cap on concurrent requests per connection.
    pub max_streams: Option<usize>,
    /// Consecutive request timeouts after which a connection is closed. The
    /// default is 10.
    pub max_consecutive_timeouts: Option<u32>,
    /// Size of the prepared statement cache. The default is 1000.
    pub max_prepared_stmts: Option<usize>,
    /// Use the seeds as the host list instead of asking the cluster for its
    /// members.
    #[serde(default)]
    pub disable_initial_host_lookup: bool,
    #[serde(default)]
    pub events: EventsConfig,
    /// The default is 5 seconds.
    pub heartbeat_interval_ms: Option<u64>,
    /// The heartbeat interval after a failed heartbeat. The default is 1
    /// second.
    pub heartbeat_retry_interval_ms: Option<u64>,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Seed for the session's random source, for reproducible host ordering.
    pub random_seed: Option<u64>,

    #[serde(skip)]
    pub host_filter: Option<HostFilter>,
    #[serde(skip)]
    pub address_translator: Option<AddressTranslator>,
    /// The retry policy for queries that do not set their own. Queries are
    /// not retried when unset.
    #[serde(skip)]
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain.
    #[serde(skip)]
    pub log: Option<Logger>,
}

impl ClusterConfig {
    pub fn new<S: Into<String>>(hosts: Vec<S>) -> Self {
        ClusterConfig {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..ClusterConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.hosts.is_empty() {
            return Err(Error::NoHosts);
        }
        if self.proto_version() > MAX_PROTOCOL_VERSION {
            return Err(Error::Config(format!(
                "unsupported protocol version {}",
                self.proto_version()
            )));
        }
        if self.num_conns() == 0 {
            return Err(Error::Config(String::from("num_conns must be positive")));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn num_conns(&self) -> usize {
        self.num_conns.unwrap_or(DEFAULT_NUM_CONNS)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// `None` when down hosts are not to be retried.
    pub fn reconnect_interval(&self) -> Option<Duration> {
        match self
            .reconnect_interval_ms
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS)
        {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn proto_version(&self) -> u8 {
        self.proto_version.unwrap_or(0)
    }

    pub fn max_consecutive_timeouts(&self) -> u32 {
        self.max_consecutive_timeouts
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_TIMEOUTS)
    }

    pub fn max_prepared_stmts(&self) -> usize {
        self.max_prepared_stmts
            .unwrap_or(DEFAULT_MAX_PREPARED_STMTS)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
        )
    }

    pub fn heartbeat_retry_interval(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_retry_interval_ms
                .unwrap_or(DEFAULT_HEARTBEAT_RETRY_INTERVAL_MS),
        )
    }

    /// Connection settings for the given protocol version.
    pub fn conn_config(&self, proto_version: u8) -> ConnConfig {
        ConnConfig {
            proto_version,
            connect_timeout: self.connect_timeout(),
            timeout: self.timeout(),
            max_streams: self.max_streams,
            max_consecutive_timeouts: self.max_consecutive_timeouts(),
        }
    }

    pub fn random_source(&self) -> RandomSource {
        match self.random_seed {
            Some(seed) => RandomSource::seeded(seed),
            None => RandomSource::new(),
        }
    }

    pub fn logger(&self) -> Logger {
        self.log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
    }

    /// Whether a host passes the configured filter.
    pub fn accept(&self, host: &Host) -> bool {
        self.host_filter.as_ref().map_or(true, |f| f.accept(host))
    }
}
