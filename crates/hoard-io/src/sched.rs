//! One-shot job scheduling.
//!
//! The engine hands short jobs (disk sync, write-queue drain) to a
//! [`Scheduler`]; each job runs exactly once on a worker thread.
//! [`ThreadScheduler`] is the bundled worker pool; [`InlineScheduler`] runs
//! jobs on the calling thread for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use hoard_error::{CacheError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// A unit of deferred work. Runs exactly once.
pub trait Job: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send + 'static> Job for F {
    fn run(self: Box<Self>) {
        (*self)();
    }
}

/// Accepts one-shot jobs for execution on a worker thread.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Box<dyn Job>);
}

/// Runs each job on the calling thread at `schedule` time.
#[derive(Debug, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, job: Box<dyn Job>) {
        job.run();
    }
}

#[derive(Default)]
struct SchedQueue {
    jobs: VecDeque<Box<dyn Job>>,
}

struct SchedShared {
    queue: Mutex<SchedQueue>,
    cond: Condvar,
    stop: AtomicBool,
}

/// Worker-pool [`Scheduler`].
///
/// Jobs queue FIFO and are taken by the first free worker. On shutdown the
/// workers drain jobs already queued, then exit; jobs scheduled after the
/// stop flag is raised may never run.
pub struct ThreadScheduler {
    shared: Arc<SchedShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadScheduler {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(CacheError::Config(
                "scheduler worker count must be > 0".to_owned(),
            ));
        }

        let shared = Arc::new(SchedShared {
            queue: Mutex::new(SchedQueue::default()),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let handles = (0..workers)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("hoard-sched-{worker}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(CacheError::Io)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            shared,
            workers: handles,
        })
    }

    /// Request shutdown and block until every worker exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        for join in self.workers.drain(..) {
            let _ = join.join();
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, job: Box<dyn Job>) {
        let mut queue = self.shared.queue.lock();
        queue.jobs.push_back(job);
        trace!(event = "job_scheduled", queued = queue.jobs.len());
        drop(queue);
        self.shared.cond.notify_one();
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop(shared: &SchedShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                shared.cond.wait(&mut queue);
            }
        };
        job.run();
    }
}
