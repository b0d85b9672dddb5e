//! Worker pool with a priority lane.
//!
//! A [`WorkerPool`] runs a single job function over submitted job payloads on a set of OS
//! threads. It keeps two kinds of workers:
//!
//! - regular workers take jobs from the head of the queue, in submission order. The pool
//!   starts `min_workers` of them and adds one whenever a job is submitted while no idle
//!   worker is left for it, up to `max_workers`.
//! - priority workers only take jobs submitted with `priority = true`, so latency sensitive
//!   calls are served even while every regular worker is busy.
//!
//! Workers are never retired before the pool shuts down. Shutdown waits for jobs that are
//! already running and discards the ones still queued.
//!
//! # Example
//! ```rust
//! use std::sync::mpsc;
//! use virtrpc::thread::{PoolConfig, WorkerPool};
//!
//! let (tx, rx) = mpsc::channel();
//! let tx = std::sync::Mutex::new(tx);
//! let pool = WorkerPool::new(PoolConfig::default(), move |n: u32| {
//!     tx.lock().unwrap().send(n * 2).unwrap();
//! })
//! .unwrap();
//!
//! pool.submit(false, 21).unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```
use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
};

use log::{debug, error, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("failed to create worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("invalid worker limits: min {min} is greater than max {max}")]
    InvalidLimits { min: usize, max: usize },
}

/// Sizing of a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Prefix of worker thread names.
    pub name: String,
    pub min_workers: usize,
    pub max_workers: usize,
    pub priority_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::from("worker"),
            min_workers: 5,
            max_workers: 20,
            priority_workers: 5,
        }
    }
}

struct QueuedJob<T> {
    priority: bool,
    data: T,
}

/// FIFO of jobs plus the sequence numbers of the queued priority jobs.
///
/// Slot `i` of `jobs` holds the job with sequence number `head_seq + i`, so a
/// priority job is found by subtraction. Taking it leaves an empty slot that
/// is dropped once it reaches the head.
struct JobQueue<T> {
    jobs: VecDeque<Option<QueuedJob<T>>>,
    priority: VecDeque<u64>,
    head_seq: u64,
    live: usize,
}

impl<T> JobQueue<T> {
    fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            priority: VecDeque::new(),
            head_seq: 0,
            live: 0,
        }
    }

    fn push(&mut self, priority: bool, data: T) {
        if priority {
            let seq = self.head_seq + self.jobs.len() as u64;
            self.priority.push_back(seq);
        }
        self.jobs.push_back(Some(QueuedJob { priority, data }));
        self.live += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        self.trim();
        let job = self.jobs.pop_front()??;
        self.head_seq += 1;
        self.live -= 1;
        if job.priority {
            // Slots are ordered by seq, so the head is also the first priority job.
            self.priority.pop_front();
        }
        Some(job.data)
    }

    fn pop_priority(&mut self) -> Option<T> {
        let seq = self.priority.pop_front()?;
        let index = usize::try_from(seq - self.head_seq).ok()?;
        let job = self.jobs.get_mut(index)?.take()?;
        self.live -= 1;
        self.trim();
        Some(job.data)
    }

    /// Drops empty slots at the head.
    fn trim(&mut self) {
        while let Some(None) = self.jobs.front() {
            self.jobs.pop_front();
            self.head_seq += 1;
        }
    }

    fn has_job(&self, priority: bool) -> bool {
        if priority {
            !self.priority.is_empty()
        } else {
            self.live > 0
        }
    }

    fn len(&self) -> usize {
        self.live
    }
}

struct State<T> {
    quit: bool,
    queue: JobQueue<T>,
    min_workers: usize,
    max_workers: usize,
    /// Live regular workers.
    workers: usize,
    /// Regular workers waiting for a job.
    free_workers: usize,
    max_priority_workers: usize,
    priority_workers: usize,
    spawned: usize,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    cond: Condvar,
    priority_cond: Condvar,
    quit_cond: Condvar,
    job: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Generic job-execution engine. See the [module documentation](self).
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts the pool with `min_workers` (clamped to `max_workers`) regular
    /// workers and `priority_workers` priority workers. Every submitted job
    /// is handed to `job`.
    pub fn new<F>(config: PoolConfig, job: F) -> Result<Self, PoolError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let min_workers = config.min_workers.min(config.max_workers);
        let pool = Self {
            shared: Arc::new(Shared {
                name: config.name,
                state: Mutex::new(State {
                    quit: false,
                    queue: JobQueue::new(),
                    min_workers,
                    max_workers: config.max_workers,
                    workers: 0,
                    free_workers: 0,
                    max_priority_workers: config.priority_workers,
                    priority_workers: 0,
                    spawned: 0,
                }),
                cond: Condvar::new(),
                priority_cond: Condvar::new(),
                quit_cond: Condvar::new(),
                job: Box::new(job),
            }),
        };

        // On error the partially started pool is shut down by Drop.
        {
            let mut state = pool.shared.lock();
            pool.expand(&mut state, min_workers, false)?;
            pool.expand(&mut state, config.priority_workers, true)?;
        }

        Ok(pool)
    }

    /// Queues `job`. Grows the regular workers by one first if no idle worker
    /// is left for it. On error the job is dropped without running.
    pub fn submit(&self, priority: bool, job: T) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        if state.quit {
            return Err(PoolError::ShuttingDown);
        }

        if state.free_workers <= state.queue.len() && state.workers < state.max_workers {
            let target = state.workers + 1;
            self.expand(&mut state, target, false)?;
        }

        state.queue.push(priority, job);

        self.shared.cond.notify_one();
        if priority {
            self.shared.priority_cond.notify_one();
        }
        Ok(())
    }

    /// Updates the worker limits. Workers are only ever added: lowering a
    /// limit stops further growth but never terminates a running worker.
    pub fn set_parameters(
        &self,
        min_workers: usize,
        max_workers: usize,
        priority_workers: usize,
    ) -> Result<(), PoolError> {
        if min_workers > max_workers {
            return Err(PoolError::InvalidLimits {
                min: min_workers,
                max: max_workers,
            });
        }

        let mut state = self.shared.lock();
        if state.quit {
            return Err(PoolError::ShuttingDown);
        }

        state.min_workers = min_workers;
        state.max_workers = max_workers;
        state.max_priority_workers = priority_workers;
        self.expand(&mut state, min_workers, false)?;
        self.expand(&mut state, priority_workers, true)
    }

    /// Stops every worker and drops the jobs still queued without running
    /// them. Waits for running jobs to return, so it must not be called from
    /// inside the job function.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if !state.quit {
            debug!("shutting down {} pool", self.shared.name);
            state.quit = true;
        }

        self.shared.cond.notify_all();
        self.shared.priority_cond.notify_all();
        while state.workers > 0 || state.priority_workers > 0 {
            state = self
                .shared
                .quit_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let queue = std::mem::replace(&mut state.queue, JobQueue::new());
        drop(state);

        let discarded = queue.len();
        if discarded > 0 {
            debug!("discarding {discarded} queued jobs");
        }
    }

    pub fn min_workers(&self) -> usize {
        self.shared.lock().min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.shared.lock().max_workers
    }

    pub fn priority_workers(&self) -> usize {
        self.shared.lock().max_priority_workers
    }

    pub fn current_workers(&self) -> usize {
        self.shared.lock().workers
    }

    pub fn current_priority_workers(&self) -> usize {
        self.shared.lock().priority_workers
    }

    pub fn free_workers(&self) -> usize {
        self.shared.lock().free_workers
    }

    pub fn job_queue_depth(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Spawns workers of one lane until that lane has `target` live workers.
    fn expand(
        &self,
        state: &mut State<T>,
        target: usize,
        priority: bool,
    ) -> Result<(), PoolError> {
        loop {
            let count = if priority {
                &mut state.priority_workers
            } else {
                &mut state.workers
            };
            if *count >= target {
                return Ok(());
            }
            *count += 1;

            let name = if priority {
                format!("{}-prio-{}", self.shared.name, state.spawned)
            } else {
                format!("{}-{}", self.shared.name, state.spawned)
            };
            state.spawned += 1;

            let shared = Arc::clone(&self.shared);
            let res = thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(shared, priority));

            if let Err(e) = res {
                warn!("failed to create {} worker: {e}", self.shared.name);
                if priority {
                    state.priority_workers -= 1;
                } else {
                    state.workers -= 1;
                }
                return Err(e.into());
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T>(shared: Arc<Shared<T>>, priority: bool) {
    let cond = if priority {
        &shared.priority_cond
    } else {
        &shared.cond
    };
    let name = thread::current().name().unwrap_or_default().to_string();
    debug!("worker {name} started");

    let mut state = shared.lock();
    loop {
        while !state.quit && !state.queue.has_job(priority) {
            if !priority {
                state.free_workers += 1;
            }
            state = cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            if !priority {
                state.free_workers -= 1;
            }
        }

        if state.quit {
            break;
        }

        let job = if priority {
            state.queue.pop_priority()
        } else {
            state.queue.pop_front()
        };
        let Some(job) = job else {
            continue;
        };

        drop(state);
        if panic::catch_unwind(AssertUnwindSafe(|| (shared.job)(job))).is_err() {
            error!("job panicked on worker {name}");
        }
        state = shared.lock();
    }

    if priority {
        state.priority_workers -= 1;
    } else {
        state.workers -= 1;
    }
    if state.workers == 0 && state.priority_workers == 0 {
        shared.quit_cond.notify_all();
    }
    drop(state);
    debug!("worker {name} exiting");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;

    type Job = Box<dyn FnOnce() + Send + 'static>;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn pool(min_workers: usize, max_workers: usize, priority_workers: usize) -> WorkerPool<Job> {
        let config = PoolConfig {
            name: String::from("test"),
            min_workers,
            max_workers,
            priority_workers,
        };
        WorkerPool::new(config, |job: Job| job()).unwrap()
    }

    /// Blocks jobs until opened.
    #[derive(Clone, Default)]
    struct Gate(Arc<(Mutex<bool>, Condvar)>);

    impl Gate {
        fn wait(&self) {
            let (open, cond) = &*self.0;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
        }

        fn open(&self) {
            let (open, cond) = &*self.0;
            *open.lock().unwrap() = true;
            cond.notify_all();
        }
    }

    #[test]
    fn queue_fifo() {
        let mut queue = JobQueue::new();
        queue.push(false, 1);
        queue.push(true, 2);
        queue.push(false, 3);

        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert!(!queue.has_job(true));
        assert_eq!(queue.pop_front(), Some(3));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn queue_priority_skips_regular_jobs() {
        let mut queue = JobQueue::new();
        queue.push(false, 1);
        queue.push(false, 2);
        queue.push(true, 3);
        queue.push(false, 4);
        queue.push(true, 5);

        assert_eq!(queue.pop_priority(), Some(3));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_priority(), Some(5));
        assert_eq!(queue.pop_priority(), None);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.pop_front(), Some(4));
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn queue_priority_taken_from_middle() {
        let mut queue = JobQueue::new();
        for n in 0..10 {
            queue.push(n == 4 || n == 7, n);
        }

        assert_eq!(queue.pop_priority(), Some(4));
        assert_eq!(queue.len(), 9);
        assert_eq!(queue.jobs.len(), 10);

        for expected in [0, 1, 2, 3, 5] {
            assert_eq!(queue.pop_front(), Some(expected));
        }
        // The empty slot left at 4 was skipped.
        assert_eq!(queue.head_seq, 6);
        assert_eq!(queue.len(), 4);

        assert_eq!(queue.pop_front(), Some(6));
        assert!(queue.has_job(true));
        assert_eq!(queue.pop_front(), Some(7));
        assert!(!queue.has_job(true));
        assert_eq!(queue.pop_priority(), None);

        queue.push(true, 10);
        assert_eq!(queue.pop_priority(), Some(10));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front(), Some(8));
        assert_eq!(queue.pop_front(), Some(9));
        assert_eq!(queue.pop_front(), None);
        assert!(queue.jobs.is_empty());
    }

    #[test]
    fn min_clamped_to_max() {
        let pool = pool(8, 2, 1);

        assert_eq!(pool.min_workers(), 2);
        assert_eq!(pool.current_workers(), 2);
        assert_eq!(pool.current_priority_workers(), 1);
    }

    #[test]
    fn every_job_runs_once() {
        let pool = pool(1, 4, 0);
        let (tx, rx) = mpsc::channel();

        for id in 0..4 {
            let tx = tx.clone();
            pool.submit(false, Box::new(move || tx.send(id).unwrap()))
                .unwrap();
        }

        let mut seen: Vec<i32> = (0..4).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        pool.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn growth_stops_at_max() {
        let pool = pool(2, 4, 0);
        let gate = Gate::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..5 {
            let gate = gate.clone();
            let runs = Arc::clone(&runs);
            let tx = tx.clone();
            pool.submit(
                false,
                Box::new(move || {
                    gate.wait();
                    runs.fetch_add(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();
        }

        // Every job blocks, so each submit past the idle workers adds one.
        assert_eq!(pool.current_workers(), 4);

        gate.open();
        for _ in 0..5 {
            rx.recv_timeout(TIMEOUT).unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(pool.current_workers(), 4);
    }

    #[test]
    fn submit_grows_empty_pool() {
        let pool = pool(0, 2, 0);
        assert_eq!(pool.current_workers(), 0);

        let (tx, rx) = mpsc::channel();
        pool.submit(false, Box::new(move || tx.send(7).unwrap()))
            .unwrap();

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 7);
        assert_eq!(pool.current_workers(), 1);
    }

    #[test]
    fn priority_job_bypasses_busy_workers() {
        let pool = pool(1, 1, 1);
        let gate = Gate::default();
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let blocker = gate.clone();
        pool.submit(
            false,
            Box::new(move || {
                started_tx.send(()).unwrap();
                blocker.wait();
            }),
        )
        .unwrap();
        started_rx.recv_timeout(TIMEOUT).unwrap();

        let regular = done_tx.clone();
        pool.submit(false, Box::new(move || regular.send(None).unwrap()))
            .unwrap();
        pool.submit(
            true,
            Box::new(move || {
                let name = thread::current().name().map(String::from);
                done_tx.send(name).unwrap();
            }),
        )
        .unwrap();

        let first = done_rx.recv_timeout(TIMEOUT).unwrap();
        assert!(first.unwrap().starts_with("test-prio-"));
        assert_eq!(pool.job_queue_depth(), 1);
        assert_eq!(pool.current_workers(), 1);

        gate.open();
        assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), None);
    }

    #[test]
    fn shutdown_discards_queued_jobs() {
        let pool = pool(0, 0, 0);
        let runs = Arc::new(AtomicUsize::new(0));
        let payload = Arc::new(());

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            let payload = Arc::clone(&payload);
            pool.submit(
                false,
                Box::new(move || {
                    let _payload = payload;
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }
        assert_eq!(pool.job_queue_depth(), 3);

        pool.shutdown();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&payload), 1);
        assert_eq!(pool.job_queue_depth(), 0);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = pool(1, 1, 0);
        pool.shutdown();

        assert!(matches!(
            pool.submit(false, Box::new(|| {})),
            Err(PoolError::ShuttingDown)
        ));
        assert_eq!(pool.current_workers(), 0);
    }

    #[test]
    fn set_parameters_only_grows() {
        let pool = pool(1, 1, 0);

        pool.set_parameters(3, 6, 2).unwrap();
        assert_eq!(pool.current_workers(), 3);
        assert_eq!(pool.current_priority_workers(), 2);

        pool.set_parameters(1, 2, 0).unwrap();
        assert_eq!(pool.current_workers(), 3);
        assert_eq!(pool.current_priority_workers(), 2);
        assert_eq!(pool.max_workers(), 2);

        assert!(matches!(
            pool.set_parameters(3, 2, 0),
            Err(PoolError::InvalidLimits { min: 3, max: 2 })
        ));
    }

    #[test]
    fn panicking_job_keeps_worker() {
        let pool = pool(1, 1, 0);
        let (tx, rx) = mpsc::channel();

        pool.submit(false, Box::new(|| panic!("job failed"))).unwrap();
        pool.submit(false, Box::new(move || tx.send(()).unwrap()))
            .unwrap();

        rx.recv_timeout(TIMEOUT).unwrap();
        pool.shutdown();
        assert_eq!(pool.current_workers(), 0);
    }
}
