//! Fixed worker pool coordinated by a single dispatcher thread.
//!
//! The dispatcher runs a two-phase match: first wait until a job is pending,
//! then wait until a worker is idle, then hand the job over. A worker only ever
//! holds one job, so the pool never runs more jobs than it has workers.
//!
//! Synchronization:
//! - the dispatcher parks on `job_ready` (signalled by [`ThreadPool::submit`])
//!   and on `worker_ready` (signalled by a worker after finishing a job);
//! - each worker parks on its own condition until it is assigned a job;
//! - [`ThreadPool::stop`] flips every state to `Stopped` and signals every
//!   condition, so no thread stays parked.
//!
//! Lock order is `worker_ready` before a worker's own mutex. Workers never take
//! `worker_ready` while holding their own mutex.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::queue::QueueFull;
use crate::session::{Job, SessionPool};

/// Lifecycle shared by the dispatcher and the workers. `Stopped` is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    None = 0,
    Running = 1,
    Stopped = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::None,
        }
    }
}

/// Work executed by a worker against one slot's payload.
pub trait JobHandler<S>: Send + Sync + 'static {
    fn run(&self, payload: &mut S);

    /// Called before the slot goes back on the free list, even if `run` panicked.
    fn recycle(&self, _payload: &mut S) {}
}

impl<S, F> JobHandler<S> for F
where
    F: Fn(&mut S) + Send + Sync + 'static,
{
    fn run(&self, payload: &mut S) {
        self(payload)
    }
}

/// A condition variable paired with the mutex it waits on.
#[derive(Default)]
struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    // Taking the lock orders the notify after any waiter's predicate check.
    fn notify_one(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

struct Manager {
    state: AtomicU8,
    job_ready: Signal,
    worker_ready: Signal,
}

impl Manager {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.state() == State::Stopped
    }
}

enum Assignment<S> {
    Idle,
    Assigned(Job<S>),
    Busy,
}

struct WorkerInner<S> {
    state: State,
    assignment: Assignment<S>,
}

struct Worker<S> {
    id: usize,
    inner: Mutex<WorkerInner<S>>,
    ready: Condvar,
}

impl<S> Worker<S> {
    fn new(id: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(WorkerInner {
                state: State::None,
                assignment: Assignment::Idle,
            }),
            ready: Condvar::new(),
        }
    }

    fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == State::Running && matches!(inner.assignment, Assignment::Idle)
    }

    /// Hand `job` to this worker. Gives it back if the worker is no longer
    /// running or already holds a job.
    fn assign(&self, job: Job<S>) -> core::result::Result<(), Job<S>> {
        let mut inner = self.inner.lock();
        if inner.state != State::Running || !matches!(inner.assignment, Assignment::Idle) {
            return Err(job);
        }
        inner.assignment = Assignment::Assigned(job);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    fn set_state(&self, state: State) {
        self.inner.lock().state = state;
        self.ready.notify_all();
    }

    /// Park until a job is assigned. `None` once the worker has been stopped.
    fn wait_for_job(&self) -> Option<Job<S>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state != State::Running {
                return None;
            }
            match mem::replace(&mut inner.assignment, Assignment::Busy) {
                Assignment::Assigned(job) => return Some(job),
                previous => inner.assignment = previous,
            }
            self.ready.wait(&mut inner);
        }
    }

    fn finish(&self) {
        self.inner.lock().assignment = Assignment::Idle;
    }
}

struct Shared<S> {
    sessions: SessionPool<S>,
    workers: Box<[Worker<S>]>,
    manager: Manager,
    handler: Box<dyn JobHandler<S>>,
}

impl<S: 'static> Shared<S> {
    /// Phase one: wait for a pending job.
    fn next_job(&self) -> Option<Job<S>> {
        let signal = &self.manager.job_ready;
        let mut guard = signal.lock.lock();
        loop {
            if self.manager.is_stopped() {
                return None;
            }
            if let Some(job) = self.sessions.next_pending() {
                return Some(job);
            }
            signal.cond.wait(&mut guard);
        }
    }

    /// Phase two: wait for the lowest-index idle worker.
    fn idle_worker(&self) -> Option<&Worker<S>> {
        let signal = &self.manager.worker_ready;
        let mut guard = signal.lock.lock();
        loop {
            if self.manager.is_stopped() {
                return None;
            }
            if let Some(worker) = self.workers.iter().find(|w| w.is_idle()) {
                return Some(worker);
            }
            signal.cond.wait(&mut guard);
        }
    }

    fn dispatch_loop(&self) {
        debug!("Dispatcher started");
        while self.manager.state() == State::Running {
            let Some(job) = self.next_job() else {
                break;
            };
            let Some(worker) = self.idle_worker() else {
                drop_at_shutdown(job);
                break;
            };
            if self.manager.is_stopped() {
                drop_at_shutdown(job);
                break;
            }
            trace!("Dispatching job {} to worker {}", job.id(), worker.id);
            match worker.assign(job) {
                Ok(()) => metrics::inc_jobs_dispatched(),
                Err(job) => {
                    // Only a stop can take an idle worker out of Running.
                    drop_at_shutdown(job);
                    break;
                }
            }
        }
        debug!("Dispatcher stopped");
    }

    fn work_loop(&self, worker: &Worker<S>) {
        trace!("Worker {} started", worker.id);
        while let Some(mut job) = worker.wait_for_job() {
            let id = job.id();
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| self.handler.run(job.payload_mut())));
            if outcome.is_err() {
                metrics::inc_job_panics();
                error!("Job {id} panicked on worker {}", worker.id);
            }
            self.handler.recycle(job.payload_mut());
            worker.finish();
            self.sessions.recycle(job);
            metrics::inc_jobs_completed();
            self.manager.worker_ready.notify_one();
        }
        trace!("Worker {} stopped", worker.id);
    }
}

// A job held by the dispatcher when the pool stops is not re-queued; dropping
// it drops the payload (for a session, its socket is closed).
fn drop_at_shutdown<S>(job: Job<S>) {
    warn!("Dropping job {} picked up during shutdown", job.id());
}

/// Slot counts taken with both queues and every worker locked at once.
///
/// Slots in transit (held by the acceptor, by the dispatcher, or by a worker
/// between finishing and recycling) are not counted, so under load
/// `free + pending + running <= capacity`; at quiescence it is equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub pending: usize,
    pub running: usize,
}

/// A fixed number of worker threads plus one dispatcher, sharing a
/// pre-allocated [`SessionPool`].
pub struct ThreadPool<S: Send + 'static> {
    shared: Arc<Shared<S>>,
    threads: Vec<JoinHandle<()>>,
}

impl<S: Send + 'static> ThreadPool<S> {
    /// Build a pool in the `None` state. No thread runs until [`start`](Self::start).
    ///
    /// # Errors
    /// `Error::InvalidWorkerCount` if `workers` is zero.
    pub fn new(
        workers: usize,
        sessions: SessionPool<S>,
        handler: impl JobHandler<S>,
    ) -> Result<Self> {
        if workers < 1 {
            return Err(Error::InvalidWorkerCount(workers));
        }
        let shared = Shared {
            sessions,
            workers: (0..workers).map(Worker::new).collect(),
            manager: Manager {
                state: AtomicU8::new(State::None as u8),
                job_ready: Signal::default(),
                worker_ready: Signal::default(),
            },
            handler: Box::new(handler),
        };
        Ok(Self {
            shared: Arc::new(shared),
            threads: Vec::with_capacity(workers + 1),
        })
    }

    /// Spawn the workers and the dispatcher. A no-op unless the pool is new.
    ///
    /// # Errors
    /// `Error::ThreadSpawn` if a thread cannot be created; threads already
    /// started are stopped again before returning.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != State::None {
            return Ok(());
        }
        self.shared.manager.set_state(State::Running);
        for worker in self.shared.workers.iter() {
            worker.set_state(State::Running);
        }

        if let Err(e) = self.spawn_threads() {
            self.stop();
            return Err(e);
        }
        debug!("Thread pool started with {} workers", self.shared.workers.len());
        Ok(())
    }

    fn spawn_threads(&mut self) -> Result<()> {
        for index in 0..self.shared.workers.len() {
            let shared = Arc::clone(&self.shared);
            let handle = spawn_named(format!("worker-{index}"), move || {
                shared.work_loop(&shared.workers[index])
            })?;
            self.threads.push(handle);
        }
        let shared = Arc::clone(&self.shared);
        let handle = spawn_named("dispatcher".to_string(), move || shared.dispatch_loop())?;
        self.threads.push(handle);
        Ok(())
    }

    /// Take a free slot to populate. `None` when every slot is in use.
    pub fn acquire(&self) -> Option<Job<S>> {
        self.shared.sessions.acquire()
    }

    /// Publish a populated slot and wake the dispatcher.
    pub fn submit(&self, job: Job<S>) -> core::result::Result<(), QueueFull<Job<S>>> {
        self.shared.sessions.publish(job)?;
        self.shared.manager.job_ready.notify_one();
        Ok(())
    }

    /// Stop the dispatcher and every worker, then join them. A worker in the
    /// middle of a job finishes it first. Idempotent.
    pub fn stop(&mut self) {
        let manager = &self.shared.manager;
        if manager.state() != State::Stopped {
            manager.set_state(State::Stopped);
            manager.job_ready.notify_all();
            manager.worker_ready.notify_all();
            for worker in self.shared.workers.iter() {
                worker.set_state(State::Stopped);
            }
        }
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                error!("Thread {name} panicked");
            }
        }
    }

    pub fn state(&self) -> State {
        self.shared.manager.state()
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        let sessions = &self.shared.sessions;
        // Order: pending, finished, workers. Nothing else holds a worker lock
        // while taking a queue lock.
        sessions.with_counts(|free, pending| {
            let workers: Vec<_> = self.shared.workers.iter().map(|w| w.inner.lock()).collect();
            let running = workers
                .iter()
                .filter(|inner| !matches!(inner.assignment, Assignment::Idle))
                .count();
            PoolStats {
                capacity: sessions.capacity(),
                free,
                pending,
                running,
            }
        })
    }
}

impl<S: Send + 'static> Drop for ThreadPool<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: Send + 'static> fmt::Debug for ThreadPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("state", &self.state())
            .field("workers", &self.workers())
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| Error::ThreadSpawn { name, source })
}
