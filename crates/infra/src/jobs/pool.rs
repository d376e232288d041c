//! Fixed-size worker pool with non-blocking submission.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

/// Unit of work executed by the pool.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// What happened to a submitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Enqueued; a pool worker will run it.
    Queued,
    /// Queue full; running on a dedicated overflow thread.
    Overflow,
    /// Pool closed; dropped without running.
    Rejected,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: u64,
    pub overflow: u64,
    pub rejected: u64,
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    overflow: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl Counters {
    fn run(&self, name: &str, work: Work) {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker = name, reason = %reason, "unit of work panicked");
            }
        }
    }
}

/// Fixed set of long-lived worker threads reading a bounded queue.
///
/// - `submit` never blocks: when the queue (capacity `2 * workers`) is full
///   the work runs on a new thread outside the pool instead
/// - no ordering across workers beyond FIFO dequeue
/// - `close` drains the queue and joins every thread; running work is never
///   interrupted
pub struct WorkerPool {
    name: String,
    workers: usize,
    queue_capacity: usize,
    sender: Mutex<Option<SyncSender<Work>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    overflow: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerPool {
    /// Start `workers` threads (at least one) named `<name>-<i>`.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        Self::named("fleetops-worker", workers)
    }

    pub fn named(name: impl Into<String>, workers: usize) -> std::io::Result<Self> {
        let name = name.into();
        let workers = workers.max(1);
        let queue_capacity = workers * 2;
        let (tx, rx) = mpsc::sync_channel::<Work>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let thread_name = format!("{name}-{i}");
            let rx = rx.clone();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, &rx, &counters))?;
            handles.push(handle);
        }

        info!(pool = %name, workers, queue_capacity, "worker pool started");

        Ok(Self {
            name,
            workers,
            queue_capacity,
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            overflow: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            counters,
        })
    }

    /// Hand a unit of work to the pool without blocking.
    pub fn submit<F>(&self, work: F) -> Submission
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return self.reject();
        }

        let work: Work = Box::new(work);
        let outcome = {
            let sender = lock(&self.sender);
            match sender.as_ref() {
                Some(tx) => tx.try_send(work),
                None => return self.reject(),
            }
        };

        match outcome {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Submission::Queued
            }
            Err(TrySendError::Full(work)) => self.spawn_overflow(work),
            Err(TrySendError::Disconnected(_)) => self.reject(),
        }
    }

    fn reject(&self) -> Submission {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, "submission after close dropped");
        Submission::Rejected
    }

    fn spawn_overflow(&self, work: Work) -> Submission {
        // `close` sets `closed` before draining `overflow` under this lock, so
        // a handle pushed while we hold it is always joined.
        let mut overflow = lock(&self.overflow);
        if self.closed.load(Ordering::Acquire) {
            drop(overflow);
            return self.reject();
        }

        let seq = self.counters.overflow.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("{}-overflow-{seq}", self.name);
        let counters = self.counters.clone();

        // `spawn` drops the closure when it fails, so park the work in a slot
        // the thread takes from; on failure it is still there to run inline.
        let slot = Arc::new(Mutex::new(Some(work)));
        let thread_slot = slot.clone();
        let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            if let Some(work) = lock(&thread_slot).take() {
                counters.run(&thread_name, work);
            }
        });

        match spawned {
            Ok(handle) => {
                warn!(pool = %self.name, queue_capacity = self.queue_capacity, "queue full, work spawned outside the pool");
                overflow.retain(|h| !h.is_finished());
                overflow.push(handle);
            }
            Err(e) => {
                drop(overflow);
                error!(pool = %self.name, error = %e, "failed to spawn overflow thread, running inline");
                if let Some(work) = lock(&slot).take() {
                    self.counters.run(&self.name, work);
                }
            }
        }
        Submission::Overflow
    }

    /// Stop accepting work, drain the queue and wait for every thread.
    ///
    /// Idempotent. Does not interrupt work that is already running. When
    /// called from a pool thread, that thread is not waited for.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender lets workers drain the queue and then exit.
        lock(&self.sender).take();

        let current = thread::current().id();
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                debug!(pool = %self.name, "close called from a pool worker, not joining it");
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.name, "worker thread exited abnormally");
            }
        }

        let overflow: Vec<_> = lock(&self.overflow).drain(..).collect();
        for handle in overflow {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        info!(pool = %self.name, "worker pool stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            queued: self.counters.queued.load(Ordering::Relaxed),
            overflow: self.counters.overflow.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(name: &str, rx: &Mutex<Receiver<Work>>, counters: &Counters) {
    debug!(worker = name, "worker started");
    loop {
        // Hold the receiver lock only while dequeuing.
        let next = lock(rx).recv();
        match next {
            Ok(work) => counters.run(name, work),
            Err(_) => break,
        }
    }
    debug!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn runs_every_unit_exactly_once() {
        let pool = WorkerPool::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let n = 200;

        for _ in 0..n {
            let counter = counter.clone();
            let submission = pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_ne!(submission, Submission::Rejected);
        }

        pool.close();
        assert_eq!(counter.load(Ordering::SeqCst), n);

        let stats = pool.stats();
        assert_eq!(stats.completed, n as u64);
        assert_eq!(stats.queued + stats.overflow, n as u64);
    }

    #[test]
    fn full_queue_spawns_instead_of_blocking() {
        let pool = WorkerPool::new(1).unwrap();
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (started_tx, started_rx) = channel::<()>();

        // Occupy the only worker.
        {
            let release_rx = release_rx.clone();
            let started_tx = started_tx.clone();
            pool.submit(move || {
                let _ = started_tx.send(());
                let _ = lock(&release_rx).recv();
            });
        }
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fill the queue (capacity 2).
        assert_eq!(pool.submit(|| {}), Submission::Queued);
        assert_eq!(pool.submit(|| {}), Submission::Queued);

        // Next one must not block the caller.
        let (done_tx, done_rx) = channel::<()>();
        let before = Instant::now();
        let submission = pool.submit(move || {
            let _ = done_tx.send(());
        });
        assert_eq!(submission, Submission::Overflow);
        assert!(before.elapsed() < Duration::from_secs(1));

        // Runs even though the worker is still busy.
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        release_tx.send(()).unwrap();
        pool.close();
        assert_eq!(pool.stats().overflow, 1);
    }

    #[test]
    fn close_waits_for_in_flight_work() {
        let pool = WorkerPool::new(2).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let finished = finished.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(50));
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.close();
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn submit_after_close_is_a_silent_no_op() {
        let pool = WorkerPool::new(2).unwrap();
        pool.close();
        pool.close();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let submission = pool.submit(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(submission, Submission::Rejected);
        thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(pool.is_closed());
        assert_eq!(pool.stats().rejected, 1);
    }

    #[test]
    fn panicking_work_does_not_kill_the_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom"));
        for _ in 0..2 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.close();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn close_joins_every_accepted_overflow_unit() {
        for _ in 0..50 {
            let pool = Arc::new(WorkerPool::new(1).unwrap());
            let ran = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(std::sync::Barrier::new(5));

            let submitters: Vec<_> = (0..4)
                .map(|_| {
                    let pool = pool.clone();
                    let ran = ran.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let mut accepted = 0;
                        for _ in 0..20 {
                            let ran = ran.clone();
                            let submission = pool.submit(move || {
                                thread::sleep(Duration::from_micros(200));
                                ran.fetch_add(1, Ordering::SeqCst);
                            });
                            if submission != Submission::Rejected {
                                accepted += 1;
                            }
                        }
                        accepted
                    })
                })
                .collect();

            barrier.wait();
            thread::sleep(Duration::from_micros(500));
            pool.close();
            let ran_by_close = ran.load(Ordering::SeqCst);

            let accepted: usize = submitters.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(ran_by_close, accepted);
            assert_eq!(ran.load(Ordering::SeqCst), accepted);
        }
    }

    #[test]
    fn close_from_inside_a_worker_does_not_join_itself() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let (tx, rx) = channel::<bool>();

        let inner = pool.clone();
        pool.submit(move || {
            let closed = panic::catch_unwind(AssertUnwindSafe(|| inner.close()));
            let _ = tx.send(closed.is_ok());
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(pool.is_closed());
        assert_eq!(pool.submit(|| {}), Submission::Rejected);
    }

    #[test]
    fn zero_workers_still_gets_one() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.queue_capacity(), 2);
    }
}
