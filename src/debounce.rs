//! Coalesces bursts of OS property-change notifications into a single
//! deferred callback, fired after the burst goes quiet for `delay`.
//!
//! Implemented as a monotonic deadline plus a single worker thread parked on
//! a condvar, not a recurring timer — each `arm()` just pushes the deadline
//! forward and wakes the worker, mirroring the shared-condvar bridge
//! `maolan-maolan`'s `hw/coreaudio/ioproc.rs` uses to hand realtime-thread
//! events to a plain worker thread.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Shared {
    deadline: Mutex<Option<Instant>>,
    condvar: Condvar,
    shutdown: Mutex<bool>,
}

/// A debounced single-shot callback. Dropping it stops the worker thread.
pub struct Debouncer {
    shared: Arc<Shared>,
    delay: Duration,
    handle: Option<thread::JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration, on_fire: impl Fn() + Send + Sync + 'static) -> Self {
        let shared = Arc::new(Shared {
            deadline: Mutex::new(None),
            condvar: Condvar::new(),
            shutdown: Mutex::new(false),
        });
        let worker_shared = shared.clone();
        let handle = thread::spawn(move || worker_loop(worker_shared, on_fire));
        Debouncer {
            shared,
            delay,
            handle: Some(handle),
        }
    }

    /// Pushes the fire deadline `delay` forward from now and wakes the
    /// worker. Safe to call from any thread, including an OS notification
    /// callback thread; never blocks on audio I/O.
    pub fn arm(&self) {
        let mut deadline = self.shared.deadline.lock();
        *deadline = Some(Instant::now() + self.delay);
        self.shared.condvar.notify_one();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.condvar.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, on_fire: impl Fn() + Send + Sync) {
    loop {
        let mut deadline_guard = shared.deadline.lock();
        loop {
            if *shared.shutdown.lock() {
                return;
            }
            match *deadline_guard {
                None => {
                    shared.condvar.wait(&mut deadline_guard);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    shared
                        .condvar
                        .wait_for(&mut deadline_guard, deadline - now);
                }
            }
        }
        if *shared.shutdown.lock() {
            return;
        }
        *deadline_guard = None;
        drop(deadline_guard);
        on_fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn a_burst_of_arms_fires_only_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let debouncer = Debouncer::new(Duration::from_millis(40), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..5 {
            debouncer.arm();
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(120));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
