// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use shoal::connection_pool::types::ConnectionPoolOptions;
use shoal::connection_pool::ConnectionPool;
use shoal::error::{Error, ServerError};
use shoal::executor::QueryExecutor;
use shoal::host::{Host, HostInfo};
use shoal::policies::HostSelectionPolicy;
use shoal::prepared::PreparedCache;
use shoal::query::Query;
use shoal::retry::{NoRetryPolicy, RetryPolicy, SimpleRetryPolicy};
use shoal::shuffle::RandomSource;

use common::{addr, dummy_connector, echoed, log_from_env, DummyConnection, DummyNode};

struct Cluster {
    nodes: Vec<Arc<DummyNode>>,
    hosts: Vec<Host>,
    executor: QueryExecutor<DummyConnection>,
}

fn cluster(ports: &[u16], retry: Arc<dyn RetryPolicy>) -> Cluster {
    let log = log_from_env();
    let nodes: Vec<Arc<DummyNode>> = ports.iter().map(|p| DummyNode::new(addr(*p))).collect();
    let hosts: Vec<Host> = ports
        .iter()
        .map(|p| Arc::new(HostInfo::new(addr(*p))))
        .collect();

    let pool = ConnectionPool::new(
        ConnectionPoolOptions {
            num_conns: Some(1),
            log: Some(log.clone()),
            random: Some(RandomSource::seeded(3)),
        },
        dummy_connector(&nodes),
    );
    pool.set_hosts(&hosts);

    let policy = Arc::new(HostSelectionPolicy::round_robin());
    for host in &hosts {
        policy.add_host(host);
    }
    let executor = QueryExecutor::new(
        pool,
        policy,
        retry,
        Arc::new(PreparedCache::new(100)),
        &log,
    );
    Cluster {
        nodes,
        hosts,
        executor,
    }
}

#[test]
fn saturated_host_is_passed_over() {
    let c = cluster(&[10101, 10102], Arc::new(NoRetryPolicy));
    c.nodes[0].saturated.store(true, Ordering::SeqCst);

    // Whichever host the round-robin starts from, the idle one answers.
    for _ in 0..4 {
        let result = c.executor.execute(&Query::new("SELECT 1")).unwrap();
        assert_eq!(echoed(&result).1, addr(10102).to_string());
    }
    assert_eq!(c.nodes[0].queries.load(Ordering::SeqCst), 0);
    assert_eq!(c.nodes[1].queries.load(Ordering::SeqCst), 4);
}

#[test]
fn every_host_saturated() {
    let c = cluster(&[10111, 10112], Arc::new(NoRetryPolicy));
    for node in &c.nodes {
        node.saturated.store(true, Ordering::SeqCst);
    }
    match c.executor.execute(&Query::new("SELECT 1")) {
        Err(Error::NoConnections) => (),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn down_hosts_are_skipped() {
    let c = cluster(&[10121, 10122], Arc::new(NoRetryPolicy));
    c.hosts[0].mark_down();
    for _ in 0..4 {
        let result = c.executor.execute(&Query::new("SELECT 1")).unwrap();
        assert_eq!(echoed(&result).1, addr(10122).to_string());
    }

    c.hosts[1].mark_down();
    match c.executor.execute(&Query::new("SELECT 1")) {
        Err(Error::NoConnections) => (),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn no_retry_surfaces_the_first_error() {
    let c = cluster(&[10131, 10132], Arc::new(NoRetryPolicy));
    for node in &c.nodes {
        node.fail_with(ServerError::UNAVAILABLE);
    }
    match c.executor.execute(&Query::new("SELECT 1")) {
        Err(Error::Server(e)) => assert_eq!(e.code, ServerError::UNAVAILABLE),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn retry_moves_to_next_host() {
    let c = cluster(&[10141, 10142], Arc::new(SimpleRetryPolicy { num_retries: 2 }));
    c.nodes[0].fail_with(ServerError::UNAVAILABLE);

    for _ in 0..4 {
        let result = c.executor.execute(&Query::new("SELECT 1")).unwrap();
        assert_eq!(echoed(&result).1, addr(10142).to_string());
    }
}

#[test]
fn per_query_retry_policy_wins() {
    let c = cluster(&[10151, 10152], Arc::new(NoRetryPolicy));
    c.nodes[0].fail_with(ServerError::OVERLOADED);

    let query = Query::new("SELECT 1").retry_policy(Arc::new(SimpleRetryPolicy { num_retries: 1 }));
    for _ in 0..4 {
        let result = c.executor.execute(&query).unwrap();
        assert_eq!(echoed(&result).1, addr(10152).to_string());
    }
}

#[test]
fn syntax_errors_are_not_retried() {
    let c = cluster(&[10161, 10162], Arc::new(SimpleRetryPolicy { num_retries: 3 }));
    for node in &c.nodes {
        node.fail_with(ServerError::SYNTAX);
    }
    match c.executor.execute(&Query::new("SELEC 1")) {
        Err(Error::Server(e)) => assert_eq!(e.code, ServerError::SYNTAX),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn prepared_statements_are_cached_per_host() {
    let c = cluster(&[10171], Arc::new(NoRetryPolicy));
    let query = Query::new("SELECT * FROM t WHERE k = ?")
        .keyspace("ks")
        .bind(Some(vec![0, 0, 0, 1]))
        .prepared(true);

    for _ in 0..3 {
        let result = c.executor.execute(&query).unwrap();
        assert_eq!(echoed(&result).0, query.statement());
    }
    assert_eq!(c.nodes[0].prepares.load(Ordering::SeqCst), 1);
    assert_eq!(c.nodes[0].executes.load(Ordering::SeqCst), 3);
    assert_eq!(c.executor.prepared().len(), 1);
}

#[test]
fn unprepared_statement_is_prepared_again() {
    let c = cluster(&[10181], Arc::new(NoRetryPolicy));
    let query = Query::new("SELECT * FROM t").prepared(true);
    c.executor.execute(&query).unwrap();

    c.nodes[0].unprepare_next.store(true, Ordering::SeqCst);
    let result = c.executor.execute(&query).unwrap();
    assert_eq!(echoed(&result).0, "SELECT * FROM t");
    assert_eq!(c.nodes[0].prepares.load(Ordering::SeqCst), 2);
    assert_eq!(c.nodes[0].executes.load(Ordering::SeqCst), 3);
}

#[test]
fn health_weighted_policy_learns_from_failures() {
    let log = log_from_env();
    let nodes = vec![DummyNode::new(addr(10191)), DummyNode::new(addr(10192))];
    let hosts: Vec<Host> = nodes
        .iter()
        .map(|n| Arc::new(HostInfo::new(n.addr)))
        .collect();
    let pool = ConnectionPool::new(
        ConnectionPoolOptions {
            num_conns: Some(1),
            log: Some(log.clone()),
            random: None,
        },
        dummy_connector(&nodes),
    );
    pool.set_hosts(&hosts);
    // Never explore, so the ordering is purely by score.
    let policy = Arc::new(HostSelectionPolicy::health_weighted(0.0, RandomSource::seeded(1)));
    for host in &hosts {
        policy.add_host(host);
    }
    let executor = QueryExecutor::new(
        pool,
        Arc::clone(&policy),
        Arc::new(SimpleRetryPolicy { num_retries: 1 }),
        Arc::new(PreparedCache::new(10)),
        &log,
    );

    nodes[0].fail_with(ServerError::OVERLOADED);
    *nodes[0].delay.lock().unwrap() = Some(Duration::from_millis(20));
    for _ in 0..5 {
        executor.execute(&Query::new("SELECT 1")).unwrap();
    }

    let first = policy.pick(None).next().unwrap();
    assert_eq!(first.connect_address(), addr(10192));
}
