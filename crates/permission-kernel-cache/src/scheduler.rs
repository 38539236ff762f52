use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// Unit of background work submitted by a cache manager.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Execution facility for asynchronous recomputation. The cache never owns threads.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

/// Runs tasks on a tokio runtime's blocking pool; recomputation is synchronous
/// CPU work and must stay off the async workers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling context, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }
}

/// Queues tasks until the owner drains them. Used to step cache state machines
/// deterministically.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler").field("pending", &self.pending()).finish()
    }
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the oldest queued task; false when the queue was empty.
    pub fn run_next(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs queued tasks, including ones scheduled while draining, until none remain.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn manual_scheduler_runs_in_submission_order() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let log = Arc::clone(&log);
            scheduler.schedule(Box::new(move || log.lock().push(index)));
        }
        assert_eq!(scheduler.pending(), 3);
        assert_eq!(scheduler.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(!scheduler.run_next());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokio_scheduler_runs_on_blocking_pool() {
        let Some(scheduler) = TokioScheduler::current() else {
            panic!("test runs inside a runtime");
        };
        let hits = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let counter = Arc::clone(&hits);
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        }));
        assert!(done_rx.await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
