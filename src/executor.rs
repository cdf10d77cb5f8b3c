// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::time::Instant;

use slog::{debug, o, trace, Logger};

use crate::connection::Connection;
use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::frame::{QueryResult, Request};
use crate::host::Host;
use crate::policies::HostSelectionPolicy;
use crate::prepared::{PreparedCache, PreparedKey};
use crate::query::Query;
use crate::retry::{RetryPolicy, RetryState, RetryType};

/// Runs queries against the cluster.
///
/// For each query the host-selection policy supplies the candidate hosts. A
/// host is skipped when it is down or has no usable connection, and a
/// saturated host is passed over without counting as an attempt. Every other
/// failure is reported to the policy and handed to the retry policy, which
/// decides whether to try again on the same host, on the next candidate, or
/// not at all.
pub struct QueryExecutor<C: Connection> {
    pool: ConnectionPool<C>,
    policy: Arc<HostSelectionPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    prepared: Arc<PreparedCache>,
    log: Logger,
}

impl<C: Connection> QueryExecutor<C> {
    pub fn new(
        pool: ConnectionPool<C>,
        policy: Arc<HostSelectionPolicy>,
        retry_policy: Arc<dyn RetryPolicy>,
        prepared: Arc<PreparedCache>,
        log: &Logger,
    ) -> Self {
        QueryExecutor {
            pool,
            policy,
            retry_policy,
            prepared,
            log: log.new(o!("component" => "QueryExecutor")),
        }
    }

    pub fn policy(&self) -> &Arc<HostSelectionPolicy> {
        &self.policy
    }

    pub fn prepared(&self) -> &Arc<PreparedCache> {
        &self.prepared
    }

    pub fn execute(&self, query: &Query) -> Result<QueryResult, Error> {
        let retry = query
            .get_retry_policy()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.retry_policy));
        let mut state = RetryState::default();
        let mut last_error = None;

        'hosts: for host in self.policy.pick(Some(query)) {
            if !host.is_up() {
                trace!(self.log, "skipping down host"; "host" => %host.connect_address());
                continue;
            }
            let pool = match self.pool.get_pool(&host.connect_address()) {
                Some(pool) => pool,
                None => continue,
            };

            loop {
                let conn = match pool.pick() {
                    Some(conn) => conn,
                    None => continue 'hosts,
                };

                let started = Instant::now();
                let result = self.attempt(&*conn, &host, query);
                let latency = started.elapsed();
                self.policy.observe(&host, latency, result.as_ref().err());

                let err = match result {
                    Ok(result) => return Ok(result),
                    Err(e) => e,
                };
                if err.is_saturation() {
                    debug!(
                        self.log,
                        "host saturated, trying next";
                        "host" => %host.connect_address()
                    );
                    continue 'hosts;
                }

                state.attempts += 1;
                state.latency += latency;
                state.host = Some(host.clone());
                let retry_type = retry.retry_type(&err);
                debug!(
                    self.log,
                    "attempt failed: {}", err;
                    "host" => %host.connect_address(),
                    "attempts" => state.attempts
                );
                last_error = Some(err);

                if !retry.attempt(&state) {
                    break 'hosts;
                }
                match retry_type {
                    RetryType::Retry => continue,
                    RetryType::RetryNextHost => continue 'hosts,
                    RetryType::Ignore => return Ok(QueryResult::Void),
                    RetryType::Rethrow => break 'hosts,
                }
            }
        }

        Err(last_error.unwrap_or(Error::NoConnections))
    }

    fn attempt(&self, conn: &C, host: &Host, query: &Query) -> Result<QueryResult, Error> {
        if !query.is_prepared() {
            let request = Request::Query {
                statement: query.statement().to_string(),
                params: query.params(),
            };
            return conn.send(&request)?.into_result();
        }

        let key = PreparedKey::new(
            host.connect_address(),
            query.get_keyspace(),
            query.statement(),
        );
        let id = self.prepare(conn, &key)?;
        match self.execute_prepared(conn, id, query) {
            Err(Error::Server(ref e)) if e.is_unprepared() => {
                debug!(
                    self.log,
                    "statement no longer prepared, preparing again";
                    "host" => %host.connect_address()
                );
                self.prepared.remove(&key);
                let id = self.prepare(conn, &key)?;
                self.execute_prepared(conn, id, query)
            }
            other => other,
        }
    }

    fn prepare(&self, conn: &C, key: &PreparedKey) -> Result<Vec<u8>, Error> {
        if let Some(id) = self.prepared.get(key) {
            return Ok(id);
        }
        match conn.send(&Request::Prepare(key.statement.clone()))?.into_result()? {
            QueryResult::Prepared(id) => {
                self.prepared.insert(key.clone(), id.clone());
                Ok(id)
            }
            other => Err(Error::Protocol(format!(
                "unexpected result to PREPARE: {:?}",
                other
            ))),
        }
    }

    fn execute_prepared(&self, conn: &C, id: Vec<u8>, query: &Query) -> Result<QueryResult, Error> {
        let request = Request::Execute {
            id,
            params: query.params(),
        };
        conn.send(&request)?.into_result()
    }
}
