// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

// Default maximum number of cached statement ids
pub const DEFAULT_MAX_PREPARED_STMTS: usize = 1000;

/// Statement ids are only valid on the host that issued them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PreparedKey {
    pub host: SocketAddr,
    pub keyspace: Option<String>,
    pub statement: String,
}

impl PreparedKey {
    pub fn new(host: SocketAddr, keyspace: Option<&str>, statement: &str) -> Self {
        PreparedKey {
            host,
            keyspace: keyspace.map(str::to_string),
            statement: statement.to_string(),
        }
    }
}

struct CacheEntry {
    id: Vec<u8>,
    tick: u64,
}

#[derive(Default)]
struct CacheData {
    entries: HashMap<PreparedKey, CacheEntry>,
    order: BTreeMap<u64, PreparedKey>,
    tick: u64,
}

impl CacheData {
    fn touch(&mut self, key: &PreparedKey) -> Option<Vec<u8>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(entry.id.clone())
    }

    fn remove(&mut self, key: &PreparedKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                true
            }
            None => false,
        }
    }

    fn retain<F: Fn(&PreparedKey) -> bool>(&mut self, keep: F) {
        let gone: Vec<PreparedKey> = self
            .entries
            .keys()
            .filter(|k| !keep(k))
            .cloned()
            .collect();
        for key in gone {
            self.remove(&key);
        }
    }
}

/// A bounded, least-recently-used cache of prepared statement ids.
pub struct PreparedCache {
    capacity: usize,
    data: Mutex<CacheData>,
}

impl PreparedCache {
    pub fn new(capacity: usize) -> Self {
        PreparedCache {
            capacity: capacity.max(1),
            data: Mutex::new(CacheData::default()),
        }
    }

    pub fn get(&self, key: &PreparedKey) -> Option<Vec<u8>> {
        self.lock().touch(key)
    }

    pub fn insert(&self, key: PreparedKey, id: Vec<u8>) {
        let mut data = self.lock();
        data.remove(&key);
        data.tick += 1;
        let tick = data.tick;
        data.order.insert(tick, key.clone());
        data.entries.insert(key, CacheEntry { id, tick });

        while data.entries.len() > self.capacity {
            let oldest = match data.order.keys().next() {
                Some(t) => *t,
                None => break,
            };
            if let Some(key) = data.order.remove(&oldest) {
                data.entries.remove(&key);
            }
        }
    }

    pub fn remove(&self, key: &PreparedKey) -> bool {
        self.lock().remove(key)
    }

    /// Forget every statement prepared against a keyspace.
    pub fn remove_keyspace(&self, keyspace: &str) {
        self.lock()
            .retain(|k| k.keyspace.as_ref().map(String::as_str) != Some(keyspace));
    }

    /// Forget every statement prepared on a host.
    pub fn remove_host(&self, host: &SocketAddr) {
        self.lock().retain(|k| k.host != *host);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<CacheData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PreparedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PreparedCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
