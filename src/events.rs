// Copyright 2020 Joyent, Inc.

//! Coalescing of server-pushed events.
//!
//! Bursts of events (a rack restarting, a node flapping) are collected until
//! no new event has arrived for the quiet period, then handed to the handler
//! as one batch. The buffer is bounded; events arriving while it is full are
//! dropped and logged rather than queued without limit.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::{debug, o, warn, Logger};

// Default quiet period in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
// Default maximum number of buffered events
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

struct DebounceState<E> {
    events: Vec<E>,
    last_event: Option<Instant>,
    dropped: usize,
    stopped: bool,
}

struct Shared<E> {
    state: Mutex<DebounceState<E>>,
    cond: Condvar,
    quiet: Duration,
    capacity: usize,
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<DebounceState<E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct EventDebouncer<E: Send + 'static> {
    shared: Arc<Shared<E>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl<E: Send + 'static> EventDebouncer<E> {
    /// Start a debouncer whose flusher thread calls `handler` with each batch.
    pub fn new<F>(
        name: &str,
        quiet: Duration,
        capacity: usize,
        handler: F,
        log: &Logger,
    ) -> Self
    where
        F: FnMut(Vec<E>) + Send + 'static,
    {
        let log = log.new(o!("component" => "EventDebouncer", "name" => name.to_string()));
        let shared = Arc::new(Shared {
            state: Mutex::new(DebounceState {
                events: Vec::new(),
                last_event: None,
                dropped: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
            quiet,
            capacity,
        });

        let flusher_shared = Arc::clone(&shared);
        let flusher_log = log.clone();
        let flusher = thread::spawn(move || flush_loop(flusher_shared, handler, flusher_log));

        EventDebouncer {
            shared,
            flusher: Mutex::new(Some(flusher)),
            log,
        }
    }

    /// Queue an event without blocking. Returns `false` if the event was
    /// dropped because the buffer is full or the debouncer is stopped.
    pub fn submit(&self, event: E) -> bool {
        let mut state = self.shared.lock();
        if state.stopped {
            return false;
        }
        if state.events.len() >= self.shared.capacity {
            state.dropped += 1;
            let dropped = state.dropped;
            drop(state);
            warn!(self.log, "event buffer full, dropping event"; "dropped" => dropped);
            return false;
        }
        state.events.push(event);
        state.last_event = Some(Instant::now());
        drop(state);
        self.shared.cond.notify_one();
        true
    }

    /// The number of events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.lock().events.len()
    }

    /// Stop the flusher. Buffered events are discarded. Later calls do
    /// nothing.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.cond.notify_all();

        let handle = self
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            // A handler stopping its own debouncer must not wait for itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!(self.log, "stopped");
    }
}

impl<E: Send + 'static> Drop for EventDebouncer<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_loop<E, F>(shared: Arc<Shared<E>>, mut handler: F, log: Logger)
where
    F: FnMut(Vec<E>),
{
    let mut state = shared.lock();
    loop {
        if state.stopped {
            break;
        }
        let last = match state.last_event {
            Some(last) => last,
            None => {
                state = shared.cond.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            }
        };

        let elapsed = last.elapsed();
        if elapsed < shared.quiet {
            state = shared
                .cond
                .wait_timeout(state, shared.quiet - elapsed)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            continue;
        }

        let batch = mem::replace(&mut state.events, Vec::new());
        let dropped = mem::replace(&mut state.dropped, 0);
        state.last_event = None;
        drop(state);

        if dropped > 0 {
            warn!(log, "dropped {} events since the last flush", dropped);
        }
        debug!(log, "flushing {} events", batch.len());
        handler(batch);

        state = shared.lock();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::mpsc::{channel, Receiver};

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn debouncer(quiet_ms: u64, capacity: usize) -> (EventDebouncer<u32>, Receiver<Vec<u32>>) {
        let (tx, rx) = channel();
        let d = EventDebouncer::new(
            "test",
            Duration::from_millis(quiet_ms),
            capacity,
            move |batch| {
                let _ = tx.send(batch);
            },
            &logger(),
        );
        (d, rx)
    }

    #[test]
    fn burst_is_flushed_once() {
        let (d, rx) = debouncer(200, 1000);
        for i in 0..100 {
            assert!(d.submit(i));
        }
        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, (0..100).collect::<Vec<u32>>());
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn overflow_is_dropped() {
        let (d, rx) = debouncer(200, 10);
        let accepted = (0..15).filter(|i| d.submit(*i)).count();
        assert_eq!(accepted, 10);
        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn separate_bursts_flush_separately() {
        let (d, rx) = debouncer(50, 100);
        d.submit(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![1]);
        d.submit(2);
        d.submit(3);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![2, 3]);
    }

    #[test]
    fn stop_is_idempotent() {
        let (d, rx) = debouncer(50, 100);
        d.stop();
        d.stop();
        assert!(!d.submit(1));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
