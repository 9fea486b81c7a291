//! Fixed-size worker pools for the pipeline stages.
//!
//! Each pool owns a FIFO queue of jobs behind a mutex and a condition
//! variable; idle workers sleep on the condvar and `submit` wakes exactly
//! one. The pool makes no ordering promises across workers. Per-connection
//! serialization comes from the orchestrator's stage-set bookkeeping, never
//! from here.
//!
//! A job reports an `i32` status: non-negative means it ran to completion,
//! negative means it failed fatally for whatever it was working on. The pool
//! logs failures and moves on; it never interprets specific codes.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

pub type JobStatus = i32;

type Job = Box<dyn FnOnce() -> JobStatus + Send + 'static>;

pub struct ThreadPool {
    name: &'static str,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    draining: AtomicBool,
}

impl ThreadPool {
    /// Spawns `workers` named threads blocking on the queue.
    pub fn new(name: &'static str, workers: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            draining: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&shared))?;
            handles.push(handle);
        }

        Ok(Self {
            name,
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Appends a job and wakes one worker. Jobs submitted to a draining pool
    /// are dropped.
    pub fn submit(&self, job: impl FnOnce() -> JobStatus + Send + 'static) {
        if self.shared.draining.load(Ordering::Acquire) {
            trace!(pool = self.name, "dropping job submitted while draining");
            return;
        }
        self.shared.queue.lock().push_back(Box::new(job));
        self.shared.available.notify_one();
    }

    /// Drains the pool: pending jobs are discarded, in-flight jobs run to
    /// completion, and every worker is joined. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.draining.swap(true, Ordering::AcqRel) {
            return;
        }

        let discarded = {
            let mut queue = self.shared.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if discarded > 0 {
            debug!(pool = self.name, discarded, "discarded pending jobs");
        }
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        debug!(pool = self.name, "pool drained");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.draining.load(Ordering::Acquire) {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        let status = job();
        if status < 0 {
            trace!(status, "job reported failure");
        }
    }
}
