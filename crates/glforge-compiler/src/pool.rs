//! Compiler thread pool: compile jobs on worker threads, two priorities.
//!
//! Two explicit FIFO queues under one lock, never a priority heap: the high
//! queue is always drained before the low one, and submission order is
//! preserved within each. Each worker owns a driver context that shares GPU
//! objects with the primary context, so the programs it builds are usable
//! on the driving thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use glforge_common::{CompilerError, GlContext, GlDriver, Priority};

use crate::token::TokenCore;

/// A unit of compile work, run against the worker's own context.
pub(crate) type Job = Box<dyn FnOnce(&dyn GlContext) + Send>;

struct QueuedJob {
    token: Arc<TokenCore>,
    job: Job,
}

struct JobQueues {
    exit_requested: bool,
    /// Index 0 is `Priority::High`, 1 is `Priority::Low`.
    by_priority: [VecDeque<QueuedJob>; 2],
}

impl JobQueues {
    fn pop_next(&mut self) -> Option<QueuedJob> {
        self.by_priority.iter_mut().find_map(|q| q.pop_front())
    }
}

struct PoolShared {
    queues: Mutex<JobQueues>,
    work_available: Condvar,
}

pub(crate) struct CompilerThreadPool {
    threads: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl CompilerThreadPool {
    pub fn new() -> Self {
        Self {
            threads: Vec::new(),
            shared: Arc::new(PoolShared {
                queues: Mutex::new(JobQueues {
                    exit_requested: false,
                    by_priority: [VecDeque::new(), VecDeque::new()],
                }),
                work_available: Condvar::new(),
            }),
        }
    }

    /// Start `thread_count` workers, each with its own shared context.
    pub fn init(
        &mut self,
        thread_count: usize,
        driver: &Arc<dyn GlDriver>,
    ) -> Result<(), CompilerError> {
        debug_assert!(self.threads.is_empty());
        for i in 0..thread_count {
            let context = driver.create_shared_context()?;
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("shaderc-{}", i))
                .spawn(move || worker_loop(shared, context))
                .map_err(|e| {
                    CompilerError::Other(format!("failed to spawn compiler thread: {}", e))
                })?;
            self.threads.push(handle);
        }
        debug!("compiler pool: {} worker(s) started", thread_count);
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Append a job and wake one idle worker.
    pub fn queue(&self, priority: Priority, token: Arc<TokenCore>, job: Job) {
        {
            let mut queues = self.shared.queues.lock();
            queues.by_priority[priority as usize].push_back(QueuedJob { token, job });
        }
        self.shared.work_available.notify_one();
    }

    /// Remove a still-queued job for this token. `None` means a worker
    /// already picked it up (or it was never queued); the caller then
    /// relies on the token's cancelled flag to discard the result.
    pub fn dequeue(&self, token: &Arc<TokenCore>) -> Option<Job> {
        let mut queues = self.shared.queues.lock();
        for q in queues.by_priority.iter_mut() {
            if let Some(pos) = q.iter().position(|e| Arc::ptr_eq(&e.token, token)) {
                return q.remove(pos).map(|e| e.job);
            }
        }
        None
    }

    /// Request shutdown, drop everything still queued, and join the workers.
    pub fn terminate(&mut self) {
        {
            let mut queues = self.shared.queues.lock();
            queues.exit_requested = true;
            for q in queues.by_priority.iter_mut() {
                q.clear();
            }
        }
        self.shared.work_available.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CompilerThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(shared: Arc<PoolShared>, context: Box<dyn GlContext + Send>) {
    loop {
        let entry = {
            let mut queues = shared.queues.lock();
            loop {
                if queues.exit_requested {
                    return;
                }
                if let Some(entry) = queues.pop_next() {
                    break entry;
                }
                shared.work_available.wait(&mut queues);
            }
        };
        trace!("worker picked up '{}'", entry.token.name());
        (entry.job)(context.as_ref());
    }
}
