//! Fixed-size worker pool draining a bounded queue of cache tasks.
//!
//! Submission never blocks the caller beyond the queue handoff: when the
//! queue is full the task runs inline on the caller's own execution
//! context.  A panicking task is caught and logged; the worker that ran
//! it keeps serving the queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A unit of cache work.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded task queue with a fixed set of worker tasks.
///
/// Dropping the pool closes the queue; workers finish the tasks already
/// queued and then exit.
pub struct TaskPool {
    queue: mpsc::Sender<Task>,
}

impl TaskPool {
    /// Spawn `workers` worker tasks sharing one queue of `capacity`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            tokio::spawn(worker_loop(worker, rx.clone()));
        }
        Self { queue }
    }

    /// Submit a task.  Enqueues when there is room; otherwise the task
    /// executes synchronously on the caller (never dropped).
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.queue.try_send(Box::pin(task)) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                debug!("cache task queue unavailable, running task inline");
                task.await;
            }
        }
    }

    /// Remaining queue capacity, for observability.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

async fn worker_loop(worker: usize, rx: Arc<Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            break; // queue closed
        };

        // A panicking task must not take the worker slot with it.
        if std::panic::AssertUnwindSafe(task).catch_unwind().await.is_err() {
            warn!(worker, "cache task panicked, worker restarting");
        }
    }
    debug!(worker, "cache worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submitted_tasks_execute() {
        let pool = TaskPool::new(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tasks should complete");
    }

    #[tokio::test]
    async fn full_queue_runs_inline() {
        // One worker parked on a slow task, queue of one, so the third
        // submission finds the queue full and must run inline.
        let pool = TaskPool::new(1, 1);
        let (block_tx, block_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        pool.submit(async move {
            let _ = started_tx.send(());
            let _ = block_rx.await;
        })
        .await;
        // Wait for the worker to pick the blocking task up, then fill
        // the single queue slot.
        started_rx.await.unwrap();
        pool.submit(async {}).await;

        let ran_inline = Arc::new(AtomicUsize::new(0));
        let flag = ran_inline.clone();
        pool.submit(async move {
            flag.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        // submit() only returns after an inline task has run.
        assert_eq!(ran_inline.load(Ordering::SeqCst), 1);
        let _ = block_tx.send(());
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_workers() {
        let pool = TaskPool::new(1, 8);

        pool.submit(async {
            panic!("boom");
        })
        .await;

        let counter = Arc::new(AtomicUsize::new(0));
        let flag = counter.clone();
        pool.submit(async move {
            flag.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should survive the panic");
    }
}
