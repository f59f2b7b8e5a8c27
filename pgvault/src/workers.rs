//! Bounded worker pool for fan-out inside workflow stages.
//!
//! N OS threads drain a single FIFO queue of boxed closures. Tasks own
//! everything they touch and perform one unit of work (an I/O copy, a
//! hash); they never call back into the workflow engine. A task failure
//! does not cancel its siblings: it clears the shared outcome flag,
//! which the stage inspects after [`WorkerPool::wait`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::*;

use crate::error::Result;

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Wakes workers when tasks arrive or shutdown is requested.
    work_ready: Condvar,
    /// Wakes `wait()` when the queue is empty and all workers idle.
    all_idle: Condvar,
    /// Cleared by the first failing task.
    outcome: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads; the caller clamps to its configuration,
    /// this clamps to at least one.
    pub fn new(workers: usize) -> WorkerPool {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            all_idle: Condvar::new(),
            outcome: AtomicBool::new(true),
        });
        let handles = (0..workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { shared, handles }
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        assert!(!state.shutdown, "submit after shutdown");
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.work_ready.notify_one();
    }

    /// Block until the queue is drained and every worker is idle.
    /// Returns the aggregate outcome and resets it for the next batch.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.active == 0) {
            self.shared.all_idle.wait(&mut state);
        }
        drop(state);
        self.shared.outcome.swap(true, Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_ready.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.active += 1;
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        if let Err(e) = task() {
            error!("worker task failed: {e}");
            shared.outcome.store(false, Ordering::SeqCst);
        }

        let mut state = shared.state.lock();
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            shared.all_idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_all_tasks_and_reports_success() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert!(pool.wait());
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn failure_does_not_cancel_siblings() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if i == 3 {
                    Err(Error::NotFound("synthetic".into()))
                } else {
                    Ok(())
                }
            });
        }
        assert!(!pool.wait());
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        // the outcome resets after wait
        pool.submit(|| Ok(()));
        assert!(pool.wait());
    }

    #[test]
    fn wait_on_empty_pool_returns_immediately() {
        let pool = WorkerPool::new(1);
        assert!(pool.wait());
    }
}
