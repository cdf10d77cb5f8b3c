// Copyright 2020 Joyent, Inc.

//! Host-selection policies.
//!
//! A policy keeps its own view of the cluster, updated through `add_host`,
//! `remove_host`, `host_up` and `host_down`, and turns it into an ordered set
//! of candidate hosts for each query. `pick` returns a lazy iterator over a
//! snapshot of the policy's host list, so it is always finite and never yields
//! the same host twice, however the host list changes while it is consumed.

use std::collections::HashMap;
use std::iter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Deserialize;
use slog::{debug, warn, Logger};

use crate::error::Error;
use crate::host::Host;
use crate::query::Query;
use crate::shuffle::RandomSource;
use crate::token::TokenRing;

/// The candidate hosts for one query, in the order they should be tried.
pub type NextHost = Box<dyn Iterator<Item = Host> + Send>;

// Exploration probability of the health-weighted policy
const DEFAULT_EPSILON: f64 = 0.05;
// Weight of the newest sample in the health-weighted averages
const EWMA_ALPHA: f64 = 0.3;
// How much a failure rate of 1.0 multiplies a host's latency score
const FAILURE_PENALTY: f64 = 10.0;

/// Which policy to build, as it appears in configuration.
///
/// ```json
/// { "type": "token-aware", "fallback": { "type": "dc-aware-round-robin", "local_dc": "us-east" } }
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PolicyConfig {
    RoundRobin,
    DcAwareRoundRobin { local_dc: String },
    TokenAware { fallback: Box<PolicyConfig> },
    HealthWeighted {
        #[serde(default)]
        epsilon: Option<f64>,
    },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::RoundRobin
    }
}

#[derive(Debug)]
pub enum HostSelectionPolicy {
    RoundRobin(RoundRobin),
    DcAwareRoundRobin(DcAwareRoundRobin),
    TokenAware(TokenAware),
    HealthWeighted(HealthWeighted),
}

impl HostSelectionPolicy {
    pub fn round_robin() -> Self {
        HostSelectionPolicy::RoundRobin(RoundRobin::new())
    }

    pub fn dc_aware<S: Into<String>>(local_dc: S) -> Self {
        HostSelectionPolicy::DcAwareRoundRobin(DcAwareRoundRobin::new(local_dc))
    }

    pub fn token_aware(fallback: HostSelectionPolicy, log: &Logger) -> Self {
        HostSelectionPolicy::TokenAware(TokenAware::new(fallback, log))
    }

    pub fn health_weighted(epsilon: f64, random: RandomSource) -> Self {
        HostSelectionPolicy::HealthWeighted(HealthWeighted::new(epsilon, random))
    }

    pub fn from_config(cfg: &PolicyConfig, random: &RandomSource, log: &Logger) -> Self {
        match cfg {
            PolicyConfig::RoundRobin => Self::round_robin(),
            PolicyConfig::DcAwareRoundRobin { local_dc } => Self::dc_aware(local_dc.as_str()),
            PolicyConfig::TokenAware { fallback } => {
                Self::token_aware(Self::from_config(fallback, random, log), log)
            }
            PolicyConfig::HealthWeighted { epsilon } => {
                Self::health_weighted(epsilon.unwrap_or(DEFAULT_EPSILON), random.clone())
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostSelectionPolicy::RoundRobin(_) => "round-robin",
            HostSelectionPolicy::DcAwareRoundRobin(_) => "dc-aware-round-robin",
            HostSelectionPolicy::TokenAware(_) => "token-aware",
            HostSelectionPolicy::HealthWeighted(_) => "health-weighted",
        }
    }

    pub fn pick(&self, query: Option<&Query>) -> NextHost {
        match self {
            HostSelectionPolicy::RoundRobin(p) => p.pick(),
            HostSelectionPolicy::DcAwareRoundRobin(p) => p.pick(),
            HostSelectionPolicy::TokenAware(p) => p.pick(query),
            HostSelectionPolicy::HealthWeighted(p) => p.pick(),
        }
    }

    pub fn add_host(&self, host: &Host) {
        match self {
            HostSelectionPolicy::RoundRobin(p) => p.hosts.add(host),
            HostSelectionPolicy::DcAwareRoundRobin(p) => p.add_host(host),
            HostSelectionPolicy::TokenAware(p) => p.add_host(host),
            HostSelectionPolicy::HealthWeighted(p) => p.hosts.add(host),
        }
    }

    pub fn remove_host(&self, addr: &SocketAddr) {
        match self {
            HostSelectionPolicy::RoundRobin(p) => p.hosts.remove(addr),
            HostSelectionPolicy::DcAwareRoundRobin(p) => p.remove_host(addr),
            HostSelectionPolicy::TokenAware(p) => p.remove_host(addr),
            HostSelectionPolicy::HealthWeighted(p) => p.remove_host(addr),
        }
    }

    pub fn host_up(&self, host: &Host) {
        self.add_host(host)
    }

    pub fn host_down(&self, addr: &SocketAddr) {
        self.remove_host(addr)
    }

    /// Tell the policy which partitioner the cluster uses.
    pub fn set_partitioner(&self, partitioner: &str) {
        if let HostSelectionPolicy::TokenAware(p) = self {
            p.set_partitioner(partitioner);
        }
    }

    /// Report the outcome of one attempt on `host`.
    pub fn observe(&self, host: &Host, latency: Duration, err: Option<&Error>) {
        match self {
            HostSelectionPolicy::TokenAware(p) => p.fallback.observe(host, latency, err),
            HostSelectionPolicy::HealthWeighted(p) => p.observe(host, latency, err),
            _ => (),
        }
    }
}

// A copy-on-write host list. Writers serialize on the mutex and publish a new
// list; readers take a snapshot without locking.
#[derive(Debug)]
struct HostList {
    list: ArcSwap<Vec<Host>>,
    mu: Mutex<()>,
}

impl HostList {
    fn new() -> Self {
        HostList {
            list: ArcSwap::from_pointee(Vec::new()),
            mu: Mutex::new(()),
        }
    }

    fn get(&self) -> Arc<Vec<Host>> {
        self.list.load_full()
    }

    fn add(&self, host: &Host) {
        let _guard = self.lock();
        let current = self.list.load_full();
        if current.iter().any(|h| h == host) {
            return;
        }
        let mut next = (*current).clone();
        next.push(host.clone());
        self.list.store(Arc::new(next));
    }

    fn remove(&self, addr: &SocketAddr) {
        let _guard = self.lock();
        let current = self.list.load_full();
        if !current.iter().any(|h| h.connect_address() == *addr) {
            return;
        }
        let next: Vec<Host> = current
            .iter()
            .filter(|h| h.connect_address() != *addr)
            .cloned()
            .collect();
        self.list.store(Arc::new(next));
    }

    fn lock(&self) -> MutexGuard<()> {
        self.mu.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Every host of the snapshot exactly once, starting at `start`.
fn rotated(hosts: Arc<Vec<Host>>, start: usize) -> NextHost {
    let n = hosts.len();
    Box::new((0..n).map(move |i| hosts[(start + i) % n].clone()))
}

/// Spreads queries over all hosts in turn.
#[derive(Debug)]
pub struct RoundRobin {
    hosts: HostList,
    pos: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            hosts: HostList::new(),
            pos: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> NextHost {
        // The position moves on every pick, whichever candidate ends up used.
        let start = self.pos.fetch_add(1, Ordering::Relaxed);
        rotated(self.hosts.get(), start)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// Round-robin over the hosts of the local datacenter. Hosts elsewhere are
/// only used while no local host is known.
#[derive(Debug)]
pub struct DcAwareRoundRobin {
    local_dc: String,
    local: HostList,
    remote: HostList,
    pos: AtomicUsize,
}

impl DcAwareRoundRobin {
    pub fn new<S: Into<String>>(local_dc: S) -> Self {
        DcAwareRoundRobin {
            local_dc: local_dc.into(),
            local: HostList::new(),
            remote: HostList::new(),
            pos: AtomicUsize::new(0),
        }
    }

    fn add_host(&self, host: &Host) {
        if host.datacenter().as_ref() == Some(&self.local_dc) {
            self.local.add(host);
        } else {
            self.remote.add(host);
        }
    }

    fn remove_host(&self, addr: &SocketAddr) {
        self.local.remove(addr);
        self.remote.remove(addr);
    }

    fn pick(&self) -> NextHost {
        let start = self.pos.fetch_add(1, Ordering::Relaxed);
        let local = self.local.get();
        if local.is_empty() {
            rotated(self.remote.get(), start)
        } else {
            rotated(local, start)
        }
    }
}

/// Sends a query with a routing key to the host owning the key's token first,
/// then to the candidates of the fallback policy.
#[derive(Debug)]
pub struct TokenAware {
    fallback: Box<HostSelectionPolicy>,
    hosts: HostList,
    partitioner: Mutex<Option<String>>,
    ring: ArcSwapOption<TokenRing>,
    log: Logger,
}

impl TokenAware {
    pub fn new(fallback: HostSelectionPolicy, log: &Logger) -> Self {
        TokenAware {
            fallback: Box::new(fallback),
            hosts: HostList::new(),
            partitioner: Mutex::new(None),
            ring: ArcSwapOption::from(None),
            log: log.clone(),
        }
    }

    /// The ring currently used for lookups, if one could be built.
    pub fn ring(&self) -> Option<Arc<TokenRing>> {
        self.ring.load_full()
    }

    fn add_host(&self, host: &Host) {
        self.hosts.add(host);
        self.fallback.add_host(host);
        self.rebuild();
    }

    fn remove_host(&self, addr: &SocketAddr) {
        self.hosts.remove(addr);
        self.fallback.remove_host(addr);
        self.rebuild();
    }

    fn set_partitioner(&self, partitioner: &str) {
        {
            let mut current = self.partitioner.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().map(String::as_str) == Some(partitioner) {
                return;
            }
            *current = Some(partitioner.to_string());
        }
        self.fallback.set_partitioner(partitioner);
        self.rebuild();
    }

    // Build a new ring from the current host list and swap it in. Rebuilds
    // are serialized on the partitioner lock so the last one to run always
    // sees the latest hosts.
    fn rebuild(&self) {
        let partitioner = self.partitioner.lock().unwrap_or_else(|e| e.into_inner());
        let name = match partitioner.as_ref() {
            Some(name) => name,
            None => return,
        };
        match TokenRing::new(name, &self.hosts.get()) {
            Ok(ring) => {
                debug!(self.log, "rebuilt token ring"; "tokens" => ring.len());
                self.ring.store(Some(Arc::new(ring)));
            }
            Err(e) => {
                warn!(self.log, "unable to build token ring: {}", e);
                self.ring.store(None);
            }
        }
    }

    fn pick(&self, query: Option<&Query>) -> NextHost {
        let primary = match (query.and_then(Query::get_routing_key), self.ring.load_full()) {
            (Some(key), Some(ring)) => ring.host_for(key).filter(|h| h.is_up()),
            _ => None,
        };
        let rest = self.fallback.pick(query);
        match primary {
            Some(primary) => {
                let skip = primary.clone();
                Box::new(iter::once(primary).chain(rest.filter(move |h| *h != skip)))
            }
            None => rest,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct HealthStats {
    latency_ms: f64,
    failure_rate: f64,
    samples: u64,
}

impl HealthStats {
    // Lower is better. Hosts never tried score zero so they get explored.
    fn score(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.latency_ms.max(0.001) * (1.0 + FAILURE_PENALTY * self.failure_rate)
    }
}

/// Orders hosts by their recent latency and failure rate. With probability
/// `epsilon` a pick uses plain round-robin order instead, so hosts that fell
/// behind are tried again now and then.
#[derive(Debug)]
pub struct HealthWeighted {
    hosts: HostList,
    stats: RwLock<HashMap<SocketAddr, HealthStats>>,
    epsilon: f64,
    random: RandomSource,
    pos: AtomicUsize,
}

impl HealthWeighted {
    pub fn new(epsilon: f64, random: RandomSource) -> Self {
        HealthWeighted {
            hosts: HostList::new(),
            stats: RwLock::new(HashMap::new()),
            epsilon,
            random,
            pos: AtomicUsize::new(0),
        }
    }

    fn remove_host(&self, addr: &SocketAddr) {
        self.hosts.remove(addr);
        self.stats
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }

    fn observe(&self, host: &Host, latency: Duration, err: Option<&Error>) {
        // A busy host has not failed.
        let failed = match err {
            Some(e) if e.is_saturation() => return,
            Some(_) => 1.0,
            None => 0.0,
        };
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(host.connect_address()).or_default();
        if entry.samples == 0 {
            entry.latency_ms = latency_ms;
            entry.failure_rate = failed;
        } else {
            entry.latency_ms += EWMA_ALPHA * (latency_ms - entry.latency_ms);
            entry.failure_rate += EWMA_ALPHA * (failed - entry.failure_rate);
        }
        entry.samples += 1;
    }

    fn pick(&self) -> NextHost {
        let start = self.pos.fetch_add(1, Ordering::Relaxed);
        let hosts = self.hosts.get();
        if self.random.gen_bool(self.epsilon) {
            return rotated(hosts, start);
        }

        let n = hosts.len();
        let mut ordered: Vec<(f64, Host)> = {
            let stats = self.stats.read().unwrap_or_else(|e| e.into_inner());
            (0..n)
                .map(|i| {
                    let host = hosts[(start + i) % n].clone();
                    let score = stats
                        .get(&host.connect_address())
                        .map(HealthStats::score)
                        .unwrap_or(0.0);
                    (score, host)
                })
                .collect()
        };
        // Stable, so equal scores keep their round-robin order.
        ordered.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Box::new(ordered.into_iter().map(|(_, host)| host))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashSet;
    use std::thread;

    use quickcheck::{quickcheck, TestResult};
    use slog::o;

    use crate::host::{HostDetails, HostInfo};

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn host(port: u16) -> Host {
        Arc::new(HostInfo::new(SocketAddr::from(([127, 0, 0, 1], port))))
    }

    fn dc_host(port: u16, dc: &str) -> Host {
        Arc::new(HostInfo::with_details(
            SocketAddr::from(([127, 0, 0, 1], port)),
            HostDetails {
                datacenter: Some(dc.to_string()),
                ..HostDetails::default()
            },
        ))
    }

    fn token_host(port: u16, token: &str) -> Host {
        Arc::new(HostInfo::with_details(
            SocketAddr::from(([127, 0, 0, 1], port)),
            HostDetails {
                tokens: vec![token.to_string()],
                ..HostDetails::default()
            },
        ))
    }

    fn ports(hosts: NextHost) -> Vec<u16> {
        hosts.map(|h| h.connect_address().port()).collect()
    }

    #[test]
    fn round_robin_rotates() {
        let policy = HostSelectionPolicy::round_robin();
        for p in 1..=3 {
            policy.add_host(&host(p));
        }
        assert_eq!(ports(policy.pick(None)), vec![1, 2, 3]);
        assert_eq!(ports(policy.pick(None)), vec![2, 3, 1]);
        assert_eq!(ports(policy.pick(None)), vec![3, 1, 2]);

        policy.remove_host(&host(2).connect_address());
        let next = ports(policy.pick(None));
        assert_eq!(next.len(), 2);
        assert!(!next.contains(&2));

        assert_eq!(ports(HostSelectionPolicy::round_robin().pick(None)), Vec::<u16>::new());
    }

    #[test]
    fn picks_stay_finite_under_churn() {
        let policy = Arc::new(HostSelectionPolicy::round_robin());
        for p in 1..=50 {
            policy.add_host(&host(p));
        }
        let writer = {
            let policy = Arc::clone(&policy);
            thread::spawn(move || {
                for round in 0..200u16 {
                    let p = round % 50 + 1;
                    policy.remove_host(&host(p).connect_address());
                    policy.add_host(&host(p));
                }
            })
        };
        for _ in 0..200 {
            let picked = ports(policy.pick(None));
            let unique: HashSet<u16> = picked.iter().cloned().collect();
            assert!(picked.len() <= 50);
            assert_eq!(unique.len(), picked.len());
        }
        writer.join().unwrap();
    }

    #[test]
    fn dc_aware_prefers_local_hosts() {
        let policy = HostSelectionPolicy::dc_aware("east");
        policy.add_host(&dc_host(1, "west"));
        policy.add_host(&dc_host(2, "west"));
        let remote: HashSet<u16> = ports(policy.pick(None)).into_iter().collect();
        assert_eq!(remote, vec![1, 2].into_iter().collect());

        policy.add_host(&dc_host(3, "east"));
        policy.add_host(&dc_host(4, "east"));
        for _ in 0..4 {
            let local: HashSet<u16> = ports(policy.pick(None)).into_iter().collect();
            assert_eq!(local, vec![3, 4].into_iter().collect());
        }
    }

    #[test]
    fn token_aware_tries_owner_first() {
        let policy =
            HostSelectionPolicy::token_aware(HostSelectionPolicy::round_robin(), &logger());
        policy.add_host(&token_host(1, "g"));
        policy.add_host(&token_host(2, "p"));
        policy.add_host(&token_host(3, "x"));
        policy.set_partitioner("ByteOrderedPartitioner");

        let query = Query::new("SELECT").routing_key(b"h".to_vec());
        for _ in 0..3 {
            let picked = ports(policy.pick(Some(&query)));
            assert_eq!(picked[0], 2);
            assert_eq!(picked.len(), 3);
            let unique: HashSet<u16> = picked.iter().cloned().collect();
            assert_eq!(unique.len(), 3);
        }

        // without a routing key the fallback order is used
        let picked = ports(policy.pick(Some(&Query::new("SELECT"))));
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn token_aware_skips_down_owner() {
        let policy =
            HostSelectionPolicy::token_aware(HostSelectionPolicy::round_robin(), &logger());
        let owner = token_host(2, "p");
        policy.add_host(&token_host(1, "g"));
        policy.add_host(&owner);
        policy.set_partitioner("ByteOrderedPartitioner");
        owner.mark_down();

        let query = Query::new("SELECT").routing_key(b"h".to_vec());
        let picked = ports(policy.pick(Some(&query)));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn token_aware_without_ring_falls_back() {
        let inner = TokenAware::new(HostSelectionPolicy::round_robin(), &logger());
        inner.add_host(&token_host(1, "not-a-token"));
        inner.set_partitioner("Murmur3Partitioner");
        assert!(inner.ring().is_none());

        inner.set_partitioner("NoSuchPartitioner");
        assert!(inner.ring().is_none());

        let query = Query::new("SELECT").routing_key(b"k".to_vec());
        assert_eq!(ports(inner.pick(Some(&query))), vec![1]);
    }

    #[test]
    fn health_weighted_orders_by_score() {
        let policy = HostSelectionPolicy::health_weighted(0.0, RandomSource::seeded(9));
        let (a, b, c) = (host(1), host(2), host(3));
        for h in &[&a, &b, &c] {
            policy.add_host(h);
        }
        policy.observe(&a, Duration::from_millis(50), None);
        policy.observe(&b, Duration::from_millis(5), None);
        policy.observe(&c, Duration::from_millis(5), Some(&Error::Timeout));

        // saturation is not a failure
        policy.observe(&b, Duration::from_millis(5), Some(&Error::NoStreamsAvailable));

        // b: 5, a: 50, c: 5 * (1 + 10)
        assert_eq!(ports(policy.pick(None)), vec![2, 1, 3]);

        // untried hosts go first
        policy.add_host(&host(4));
        assert_eq!(ports(policy.pick(None))[0], 4);
    }

    #[test]
    fn policies_from_config() {
        let cfg = PolicyConfig::TokenAware {
            fallback: Box::new(PolicyConfig::DcAwareRoundRobin {
                local_dc: String::from("east"),
            }),
        };
        let policy = HostSelectionPolicy::from_config(&cfg, &RandomSource::seeded(1), &logger());
        assert_eq!(policy.name(), "token-aware");
        match policy {
            HostSelectionPolicy::TokenAware(t) => {
                assert_eq!(t.fallback.name(), "dc-aware-round-robin")
            }
            _ => panic!("wrong policy"),
        }
    }

    quickcheck! {
        fn prop_round_robin_yields_each_host_once(n: u8, picks: u8) -> TestResult {
            if n == 0 {
                return TestResult::discard();
            }
            let policy = HostSelectionPolicy::round_robin();
            for p in 0..u16::from(n) {
                policy.add_host(&host(p + 1));
            }
            for _ in 0..picks % 8 {
                let _ = policy.pick(None);
            }
            let mut picked = ports(policy.pick(None));
            picked.sort();
            let expected: Vec<u16> = (1..=u16::from(n)).collect();
            TestResult::from_bool(picked == expected)
        }
    }
}
