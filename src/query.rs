// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use crate::frame::QueryParams;
use crate::retry::RetryPolicy;

/// The consistency hint sent when a query does not set one.
pub const DEFAULT_CONSISTENCY: u16 = 0x0001;

/// A statement to run, with its already encoded values and routing hints.
///
/// ```rust,ignore
/// let query = Query::new("SELECT * FROM ks.users WHERE id = ?")
///     .bind(Some(id_bytes.clone()))
///     .routing_key(id_bytes)
///     .prepared(true);
/// let result = session.execute(&query)?;
/// ```
#[derive(Clone, Debug)]
pub struct Query {
    statement: String,
    values: Vec<Option<Vec<u8>>>,
    consistency: u16,
    routing_key: Option<Vec<u8>>,
    keyspace: Option<String>,
    prepared: bool,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Query {
    pub fn new<S: Into<String>>(statement: S) -> Self {
        Query {
            statement: statement.into(),
            values: Vec::new(),
            consistency: DEFAULT_CONSISTENCY,
            routing_key: None,
            keyspace: None,
            prepared: false,
            retry_policy: None,
        }
    }

    /// Append one encoded value; `None` binds null.
    pub fn bind(mut self, value: Option<Vec<u8>>) -> Self {
        self.values.push(value);
        self
    }

    pub fn values(mut self, values: Vec<Option<Vec<u8>>>) -> Self {
        self.values = values;
        self
    }

    pub fn consistency(mut self, consistency: u16) -> Self {
        self.consistency = consistency;
        self
    }

    /// The partition key bytes used for token-aware routing.
    pub fn routing_key(mut self, key: Vec<u8>) -> Self {
        self.routing_key = Some(key);
        self
    }

    pub fn keyspace<S: Into<String>>(mut self, keyspace: S) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// Run the statement through PREPARE/EXECUTE instead of QUERY.
    pub fn prepared(mut self, prepared: bool) -> Self {
        self.prepared = prepared;
        self
    }

    /// Override the session's retry policy for this query.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn get_routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_ref().map(Vec::as_slice)
    }

    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_ref().map(String::as_str)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry_policy.as_ref()
    }

    pub fn params(&self) -> QueryParams {
        QueryParams {
            consistency: self.consistency,
            values: self.values.clone(),
        }
    }
}
