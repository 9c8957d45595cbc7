#![deny(unsafe_code)]

//! Process-wide one-shot timer queue.
//!
//! Callers schedule a callback with [`TimerService::start`] and get back a
//! cancellable [`TimerHandle`]. Expired entries are fired either by the
//! dedicated worker thread (brought up with [`TimerService::init`]) or, in
//! single-threaded deployments, by calling [`TimerService::poll`] from the
//! event loop's tick.
//!
//! Cancellation races are part of the API contract: [`TimerService::stop`]
//! reports [`StopResult::NotFound`] for an entry that already expired or is
//! currently firing, in which case the callback may still run and the caller
//! must not release any state the callback touches.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Worker granularity. The worker never sleeps longer than this, so entries
/// scheduled from other threads are picked up promptly.
const MAX_WORKER_SLEEP: Duration = Duration::from_millis(10);

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled timer entry.
///
/// The handle does not own the entry. Dropping it leaves the timer armed.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
}

impl TimerHandle {
    /// A handle that refers to no entry. [`TimerService::stop`] returns
    /// [`StopResult::Invalid`] for it.
    pub const fn null() -> Self {
        TimerHandle { id: 0 }
    }

    /// Returns true if this handle no longer refers to an entry
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

/// Outcome of [`TimerService::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// The entry was removed from the queue; the callback will not run.
    Removed,
    /// The entry is not queued anymore; it expired or its callback is
    /// currently running. The caller must assume the callback still runs.
    NotFound,
    /// The handle was null.
    Invalid,
}

struct Entry {
    id: u64,
    deadline: Instant,
    callback: Callback,
}

#[derive(Default)]
struct Queue {
    /// Sorted by deadline, earliest first
    entries: Vec<Entry>,
    next_id: u64,
}

impl Queue {
    fn insert(&mut self, deadline: Instant, callback: Callback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;

        let at = self
            .entries
            .partition_point(|entry| entry.deadline <= deadline);

        self.entries.insert(
            at,
            Entry {
                id,
                deadline,
                callback,
            },
        );

        id
    }

    fn detach_due(&mut self, now: Instant) -> Option<Entry> {
        if self.entries.first()?.deadline <= now {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }
}

struct Inner {
    queue: Mutex<Queue>,
    worker_shutdown: AtomicBool,
}

/// Cloneable handle to the timer queue
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    /// Create a timer service without a worker thread. Entries only fire
    /// through [`poll`](TimerService::poll) until [`init`](TimerService::init)
    /// is called.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue::default()),
                worker_shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Bring up the worker thread. The returned [`TimerWorker`] tears the
    /// worker down (without firing pending entries) when shut down or dropped.
    pub fn init(&self) -> TimerWorker {
        self.inner.worker_shutdown.store(false, Ordering::Release);

        let inner = self.inner.clone();

        let handle = std::thread::Builder::new()
            .name("lark-timer".into())
            .spawn(move || worker_loop(inner))
            .expect("failed to spawn timer worker");

        TimerWorker {
            service: self.clone(),
            handle: Some(handle),
        }
    }

    /// Schedule `callback` to run once, `delay` from now.
    pub fn start<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;

        let id = self
            .inner
            .queue
            .lock()
            .insert(deadline, Box::new(callback));

        TimerHandle { id }
    }

    /// Cancel a scheduled entry. The handle is nulled on return regardless of
    /// the outcome, see [`StopResult`] for the race semantics.
    pub fn stop(&self, handle: &mut TimerHandle) -> StopResult {
        if handle.is_null() {
            return StopResult::Invalid;
        }

        let id = std::mem::replace(&mut handle.id, 0);

        let mut queue = self.inner.queue.lock();

        match queue.entries.iter().position(|entry| entry.id == id) {
            Some(at) => {
                queue.entries.remove(at);
                StopResult::Removed
            }
            None => StopResult::NotFound,
        }
    }

    /// Fire every entry that is due at `now`. Used instead of the worker when
    /// the timer tick is folded into the host's event loop.
    ///
    /// Callbacks are invoked without holding the queue lock, so they may
    /// schedule or stop other timers.
    pub fn poll(&self, now: Instant) -> usize {
        let mut fired = 0;

        loop {
            let entry = { self.inner.queue.lock().detach_due(now) };

            match entry {
                Some(entry) => {
                    (entry.callback)();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Deadline of the earliest queued entry
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .queue
            .lock()
            .entries
            .first()
            .map(|entry| entry.deadline)
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owner of the worker thread created by [`TimerService::init`]
pub struct TimerWorker {
    service: TimerService,
    handle: Option<JoinHandle<()>>,
}

impl TimerWorker {
    /// Stop the worker and drain the queue without firing pending entries
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.service
            .inner
            .worker_shutdown
            .store(true, Ordering::Release);

        if handle.join().is_err() {
            log::error!("timer worker panicked");
        }

        let drained = {
            let mut queue = self.service.inner.queue.lock();
            std::mem::take(&mut queue.entries)
        };

        if !drained.is_empty() {
            log::debug!("timer shutdown dropped {} pending entries", drained.len());
        }
    }
}

impl Drop for TimerWorker {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    while !inner.worker_shutdown.load(Ordering::Acquire) {
        let now = Instant::now();

        loop {
            let entry = { inner.queue.lock().detach_due(now) };

            match entry {
                Some(entry) => (entry.callback)(),
                None => break,
            }
        }

        let until_next = {
            inner
                .queue
                .lock()
                .entries
                .first()
                .map(|entry| entry.deadline.saturating_duration_since(now))
        };

        let sleep = until_next
            .unwrap_or(MAX_WORKER_SLEEP)
            .min(MAX_WORKER_SLEEP);

        std::thread::sleep(sleep);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn poll_fires_due_entries_in_order() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        timers.start(Duration::from_millis(20), move || tx2.send(2).unwrap());
        timers.start(Duration::ZERO, move || tx.send(1).unwrap());

        assert_eq!(timers.poll(Instant::now()), 1);
        assert_eq!(rx.try_recv().unwrap(), 1);

        assert_eq!(timers.poll(Instant::now() + Duration::from_millis(50)), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);

        assert!(timers.is_empty());
    }

    #[test]
    fn stop_removes_pending_entry() {
        let timers = TimerService::new();

        let mut handle = timers.start(Duration::from_secs(60), || panic!("must not fire"));

        assert_eq!(timers.stop(&mut handle), StopResult::Removed);
        assert!(handle.is_null());
        assert_eq!(timers.poll(Instant::now() + Duration::from_secs(120)), 0);
    }

    #[test]
    fn stop_after_fire_reports_not_found() {
        let timers = TimerService::new();

        let mut handle = timers.start(Duration::ZERO, || {});
        timers.poll(Instant::now());

        assert_eq!(timers.stop(&mut handle), StopResult::NotFound);
        // handle is nulled, a second stop is invalid
        assert_eq!(timers.stop(&mut handle), StopResult::Invalid);
    }

    #[test]
    fn callbacks_may_start_timers() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();

        let inner = timers.clone();
        timers.start(Duration::ZERO, move || {
            inner.start(Duration::ZERO, move || tx.send(()).unwrap());
        });

        timers.poll(Instant::now());
        timers.poll(Instant::now());

        rx.try_recv().unwrap();
    }

    #[test]
    fn worker_fires_entries() {
        let timers = TimerService::new();
        let worker = timers.init();

        let (tx, rx) = mpsc::channel();
        timers.start(Duration::from_millis(10), move || tx.send(()).unwrap());

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        worker.shutdown();
    }

    #[test]
    fn shutdown_drains_without_firing() {
        let timers = TimerService::new();
        let worker = timers.init();

        timers.start(Duration::from_secs(3600), || panic!("must not fire"));
        worker.shutdown();

        assert!(timers.is_empty());
    }
}
