use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

use crate::Error;

pub const MIN_THREADS: usize = 2;

#[derive(Debug, ThisError)]
pub enum PoolError {
    #[error("pool error; at least 2 worker threads are required, got {0}")]
    InvalidThreadCount(usize),
    #[error("pool error; the pool is shutting down")]
    ShuttingDown,
    #[error("pool error; failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("pool error; job panicked")]
    JobPanicked,
    #[error("pool error; {failed} worker thread(s) could not be joined")]
    Join { failed: usize },
}

/// A unit of work for the pool: `work` runs against the argument, then `cleanup` consumes it.
///
/// `cleanup` runs exactly once per job, whether `work` succeeded, failed, panicked, or never ran
/// because the job was discarded at shutdown.
pub struct Job {
    task: Box<dyn Task>,
}

impl Job {
    pub fn new<A, W, C>(work: W, cleanup: C, argument: A) -> Self
    where
        A: Send + 'static,
        W: FnOnce(&mut A) -> Result<(), Error> + Send + 'static,
        C: FnOnce(A) + Send + 'static,
    {
        Job {
            task: Box::new(Unit {
                argument,
                work,
                cleanup,
            }),
        }
    }

    fn run(self) -> Result<(), Error> {
        self.task.run()
    }

    fn discard(self) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.task.discard())).is_err() {
            error!("Cleanup of a discarded job panicked");
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").finish_non_exhaustive()
    }
}

trait Task: Send {
    fn run(self: Box<Self>) -> Result<(), Error>;
    fn discard(self: Box<Self>);
}

struct Unit<A, W, C> {
    argument: A,
    work: W,
    cleanup: C,
}

impl<A, W, C> Task for Unit<A, W, C>
where
    A: Send,
    W: FnOnce(&mut A) -> Result<(), Error> + Send,
    C: FnOnce(A) + Send,
{
    fn run(self: Box<Self>) -> Result<(), Error> {
        let Unit {
            mut argument,
            work,
            cleanup,
        } = *self;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut argument)));
        cleanup(argument);

        match outcome {
            Ok(result) => result,
            Err(_) => Err(PoolError::JobPanicked.into()),
        }
    }

    fn discard(self: Box<Self>) {
        let Unit {
            argument, cleanup, ..
        } = *self;
        cleanup(argument);
    }
}

/// Outcome of a pool shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs that were still queued when shutdown began. Their cleanup ran, their work did not.
    pub discarded: usize,
}

/// A fixed set of worker threads consuming jobs from a shared FIFO queue.
///
/// At most `thread_count` jobs execute at any time; extra submissions wait in the queue. Once
/// shutdown begins the workers finish their current job and stop dequeuing.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    queue: VecDeque<Job>,
    shutdown: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Result<WorkerPool, PoolError> {
        if thread_count < MIN_THREADS {
            return Err(PoolError::InvalidThreadCount(thread_count));
        }

        let mut pool = WorkerPool {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                available: Condvar::new(),
            }),
            workers: Vec::with_capacity(thread_count),
        };

        for id in 0..thread_count {
            let shared = pool.shared.clone();
            // On failure the partial pool is dropped, joining the workers started so far.
            let handle = thread::Builder::new()
                .name(format!("rcmd-worker-{id}"))
                .spawn(move || worker_loop(id, shared))
                .map_err(PoolError::Spawn)?;
            pool.workers.push(handle);
        }

        info!(threads = thread_count, "Worker pool started");

        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn submit<A, W, C>(&self, work: W, cleanup: C, argument: A) -> Result<(), PoolError>
    where
        A: Send + 'static,
        W: FnOnce(&mut A) -> Result<(), Error> + Send + 'static,
        C: FnOnce(A) + Send + 'static,
    {
        self.submit_job(Job::new(work, cleanup, argument))
    }

    /// Queues a job. If the pool is already shutting down the job's cleanup runs before the error
    /// is returned.
    pub fn submit_job(&self, job: Job) -> Result<(), PoolError> {
        let mut state = self.shared.lock();

        if state.shutdown {
            drop(state);
            job.discard();
            return Err(PoolError::ShuttingDown);
        }

        state.queue.push_back(job);
        drop(state);
        self.shared.available.notify_one();

        Ok(())
    }

    /// Stops the pool: sets the shutdown flag, wakes every worker, discards the jobs still queued
    /// and joins all workers. A worker that cannot be joined is reported after the others have
    /// been joined.
    pub fn destroy(mut self) -> Result<ShutdownReport, PoolError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<ShutdownReport, PoolError> {
        let discarded: Vec<Job> = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.queue.drain(..).collect()
        };
        self.shared.available.notify_all();

        let report = ShutdownReport {
            discarded: discarded.len(),
        };
        if report.discarded > 0 {
            warn!(discarded = report.discarded, "Discarding queued jobs");
        }
        for job in discarded {
            job.discard();
        }

        let mut failed = 0;
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "Failed to join worker thread");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(PoolError::Join { failed });
        }

        info!(discarded = report.discarded, "Worker pool stopped");
        Ok(report)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        if let Err(e) = self.shutdown() {
            error!("Worker pool shutdown failed: {}", e);
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.shutdown {
                    debug!(worker = id, "Worker exiting");
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        // The job isolates panics in `work`; this catches one raised by `cleanup` so the worker
        // survives it.
        match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(Ok(())) => debug!(worker = id, "Job finished"),
            Ok(Err(e)) => warn!(worker = id, "Job failed: {}", e),
            Err(_) => error!(worker = id, "Job cleanup panicked"),
        }
    }
}
