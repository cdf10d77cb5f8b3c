// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::{debug, info, o, warn, Logger};

use crate::connection::{Connection, Connector};
use crate::error::Error;
use crate::host::Host;
use crate::shuffle::RandomSource;

// Fill back-off bounds in milliseconds
const FILL_BACKOFF_INITIAL: u64 = 100;
const FILL_BACKOFF_MAX: u64 = 10_000;

/// The connections to a single host.
///
/// The pool never holds more than `size` connections. Only one fill runs at a
/// time; `pick` never blocks and starts a background fill whenever the pool is
/// short of connections.
pub struct HostConnPool<C: Connection>(Arc<HostPoolInner<C>>);

struct HostPoolInner<C: Connection> {
    host: Host,
    size: usize,
    connector: Connector<C>,
    conns: RwLock<Vec<Arc<C>>>,
    filling: AtomicBool,
    closed: AtomicBool,
    backoff: Mutex<ExponentialBackoff>,
    random: RandomSource,
    log: Logger,
}

impl<C: Connection> Clone for HostConnPool<C> {
    fn clone(&self) -> Self {
        HostConnPool(Arc::clone(&self.0))
    }
}

impl<C: Connection> HostConnPool<C> {
    pub fn new(
        host: Host,
        size: usize,
        connector: Connector<C>,
        random: RandomSource,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("host" => host.connect_address().to_string()));
        let backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(FILL_BACKOFF_INITIAL),
            initial_interval: Duration::from_millis(FILL_BACKOFF_INITIAL),
            max_interval: Duration::from_millis(FILL_BACKOFF_MAX),
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        HostConnPool(Arc::new(HostPoolInner {
            host,
            size,
            connector,
            conns: RwLock::new(Vec::with_capacity(size)),
            filling: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            backoff: Mutex::new(backoff),
            random,
            log,
        }))
    }

    pub fn host(&self) -> &Host {
        &self.0.host
    }

    /// Whether both handles refer to the same pool.
    pub fn ptr_eq(&self, other: &HostConnPool<C>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The target number of connections.
    pub fn capacity(&self) -> usize {
        self.0.size
    }

    /// The number of live connections.
    pub fn size(&self) -> usize {
        self.read().iter().filter(|c| !c.has_broken()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub fn is_filling(&self) -> bool {
        self.0.filling.load(Ordering::SeqCst)
    }

    /// The connection with the most free streams, if any. Broken connections
    /// are dropped from the pool along the way.
    pub fn pick(&self) -> Option<Arc<C>> {
        if self.is_closed() {
            return None;
        }

        let (best, live, broken) = {
            let conns = self.read();
            let best = conns
                .iter()
                .filter(|c| !c.has_broken())
                .max_by_key(|c| c.available_streams())
                .cloned();
            let broken = conns.iter().filter(|c| c.has_broken()).count();
            (best, conns.len() - broken, broken)
        };

        if broken > 0 {
            let mut conns = self.write();
            conns.retain(|c| !c.has_broken());
            debug!(self.0.log, "removed {} broken connections", broken);
        }

        if live < self.0.size && !self.is_filling() {
            let pool = self.clone();
            thread::spawn(move || pool.fill());
        }

        best
    }

    /// Bring the pool up to its target size. Returns without doing anything if
    /// another fill is already running. When the pool is empty the first
    /// connection is made on the calling thread and the rest in the
    /// background.
    pub fn fill(&self) {
        if self.is_closed() {
            return;
        }
        if self
            .0
            .filling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let current = self.read().iter().filter(|c| !c.has_broken()).count();
        let mut missing = self.0.size.saturating_sub(current);
        if missing == 0 {
            self.filling_stopped(None);
            return;
        }

        if current == 0 {
            if let Err(e) = self.connect() {
                warn!(self.0.log, "unable to connect: {}", e);
                self.0.host.mark_down();
                self.filling_stopped(Some(e));
                return;
            }
            missing -= 1;
            if missing == 0 {
                self.filling_stopped(None);
                return;
            }
        }

        let pool = self.clone();
        thread::spawn(move || {
            let mut result = None;
            for _ in 0..missing {
                if let Err(e) = pool.connect() {
                    result = Some(e);
                    break;
                }
            }
            pool.filling_stopped(result);
        });
    }

    /// Close every connection. Connections that finish dialing after this
    /// point are closed instead of added.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conns: Vec<Arc<C>> = self.write().drain(..).collect();
        info!(self.0.log, "closing {} connections", conns.len());
        for conn in conns {
            conn.close();
        }
    }

    fn connect(&self) -> Result<(), Error> {
        let conn = (self.0.connector)(&self.0.host)?;
        let mut conns = self.write();
        if self.is_closed() || conns.len() >= self.0.size {
            drop(conns);
            conn.close();
            return Ok(());
        }
        conns.push(conn);
        debug!(self.0.log, "added connection"; "size" => conns.len());
        Ok(())
    }

    // Release the filling flag. After a failure the flag is held for a
    // randomized, growing delay so a dead host is not redialed on every pick.
    fn filling_stopped(&self, err: Option<Error>) {
        let mut backoff = self.0.backoff.lock().unwrap_or_else(|e| e.into_inner());
        match err {
            None => {
                backoff.reset();
                drop(backoff);
                self.0.filling.store(false, Ordering::SeqCst);
            }
            Some(e) => {
                let base = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(FILL_BACKOFF_MAX));
                drop(backoff);
                let delay = base.mul_f64(0.5 + self.0.random.gen_f64());
                debug!(
                    self.0.log,
                    "fill failed, backing off for {:?}: {}", delay, e
                );
                let pool = self.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    pool.0.filling.store(false, Ordering::SeqCst);
                });
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<Vec<Arc<C>>> {
        self.0.conns.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<Vec<Arc<C>>> {
        self.0.conns.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Connection> fmt::Debug for HostConnPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostConnPool")
            .field("host", &self.0.host.connect_address())
            .field("size", &self.0.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use slog::o;

    use crate::frame::{Request, Response};
    use crate::host::HostInfo;

    #[derive(Debug)]
    struct FakeConn {
        addr: SocketAddr,
        streams: usize,
        broken: AtomicBool,
    }

    impl Connection for FakeConn {
        fn send(&self, _request: &Request) -> Result<Response, Error> {
            Ok(Response::Ready)
        }
        fn available_streams(&self) -> usize {
            self.streams
        }
        fn has_broken(&self) -> bool {
            self.broken.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.broken.store(true, Ordering::SeqCst)
        }
        fn address(&self) -> SocketAddr {
            self.addr
        }
    }

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn host() -> Host {
        Arc::new(HostInfo::new(SocketAddr::from(([127, 0, 0, 1], 9042))))
    }

    fn counting_connector(dialed: Arc<AtomicUsize>) -> Connector<FakeConn> {
        Arc::new(move |h: &Host| {
            let n = dialed.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeConn {
                addr: h.connect_address(),
                streams: 10 + n,
                broken: AtomicBool::new(false),
            }))
        })
    }

    fn wait_for<F: Fn() -> bool>(f: F) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn fill_reaches_target_size() {
        let dialed = Arc::new(AtomicUsize::new(0));
        let pool = HostConnPool::new(
            host(),
            3,
            counting_connector(dialed),
            RandomSource::seeded(1),
            &logger(),
        );
        pool.fill();
        assert!(pool.size() >= 1);
        assert!(wait_for(|| pool.size() == 3));

        // least busy is the one with the most free streams
        let best = pool.pick().unwrap();
        assert_eq!(best.available_streams(), 12);
    }

    #[test]
    fn failed_first_connection_marks_host_down() {
        let h = host();
        let connector: Connector<FakeConn> =
            Arc::new(|_h: &Host| Err(Error::ConnectionClosed));
        let pool = HostConnPool::new(h.clone(), 2, connector, RandomSource::seeded(1), &logger());
        pool.fill();
        assert_eq!(pool.size(), 0);
        assert!(!h.is_up());
        // the flag stays held during back-off
        assert!(pool.is_filling());
        assert!(pool.pick().is_none());
    }

    #[test]
    fn broken_connections_are_pruned() {
        let dialed = Arc::new(AtomicUsize::new(0));
        let pool = HostConnPool::new(
            host(),
            1,
            counting_connector(dialed.clone()),
            RandomSource::seeded(1),
            &logger(),
        );
        pool.fill();
        let conn = pool.pick().unwrap();
        conn.close();
        assert_eq!(pool.size(), 0);
        // pick prunes and refills in the background
        let _ = pool.pick();
        assert!(wait_for(|| pool.size() == 1));
        assert_eq!(dialed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let dialed = Arc::new(AtomicUsize::new(0));
        let pool = HostConnPool::new(
            host(),
            1,
            counting_connector(dialed),
            RandomSource::seeded(1),
            &logger(),
        );
        pool.fill();
        let conn = pool.pick().unwrap();
        pool.close();
        pool.close();
        assert!(conn.has_broken());
        assert!(pool.pick().is_none());
        pool.fill();
        assert_eq!(pool.size(), 0);
    }
}
