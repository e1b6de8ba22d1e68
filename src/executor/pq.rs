//! Worker pools draining a shared priority queue.
//!
//! [`AsyncPqExecutor`] runs futures on the worker task itself.
//! [`AsyncPqThreadPoolExecutor`] hands closures to tokio's blocking pool so
//! synchronous work never stalls the runtime.
//!
//! Both must be constructed inside a tokio runtime.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{ErasedJob, ItemKind, JobQueue};
use super::{panic_message, JobError, JobHandle};

/// Priority of the shutdown sentinels. Queued jobs run before them.
const SHUTDOWN_PRIORITY: i32 = i32::MAX;

/// Queue, workers and lifecycle shared by both flavors.
struct WorkerPool {
    name: &'static str,
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
}

impl WorkerPool {
    fn new(name: &'static str, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let queue = Arc::new(JobQueue::new());
        let workers = (0..max_workers)
            .map(|worker_id| tokio::spawn(worker_loop(name, worker_id, queue.clone())))
            .collect();
        info!(executor = name, max_workers, "Executor started");
        Self {
            name,
            queue,
            workers: Mutex::new(workers),
            max_workers,
        }
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// False once shutdown has begun; the job is dropped unrun.
    fn enqueue(&self, priority: i32, job: ErasedJob) -> bool {
        self.queue.push(priority, ItemKind::Job(job))
    }

    async fn shutdown(&self, wait: bool) {
        // Each worker exits on the first sentinel it pops, so exactly one per worker.
        if !self.queue.close(self.max_workers, SHUTDOWN_PRIORITY) {
            return;
        }
        if !wait {
            return;
        }
        self.queue.join().await;
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(executor = self.name, error = %e, "Worker task ended abnormally");
            }
        }
        info!(executor = self.name, "Executor shut down");
    }
}

async fn worker_loop(name: &'static str, worker_id: usize, queue: Arc<JobQueue>) {
    debug!(executor = name, worker_id, "Worker started");
    loop {
        let item = queue.pop().await;
        match item.kind {
            ItemKind::Shutdown => {
                queue.task_done();
                break;
            }
            ItemKind::Job(job) => {
                job.await;
                queue.task_done();
            }
        }
    }
    debug!(executor = name, worker_id, "Worker stopped");
}

fn deliver<T>(tx: oneshot::Sender<Result<T, JobError>>, result: Result<T, JobError>) {
    if let Err(Err(e)) = tx.send(result) {
        debug!(error = %e, "Job result dropped, handle gone");
    }
}

/// Priority executor for work that is already asynchronous.
pub struct AsyncPqExecutor {
    pool: WorkerPool,
}

impl AsyncPqExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            pool: WorkerPool::new("async-pq", max_workers),
        }
    }

    /// Queue `fut` at `priority` (lower runs first).
    pub fn submit<F, T>(&self, fut: F, priority: i32) -> JobHandle<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.pool.is_closed() {
            return JobHandle::closed();
        }
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    debug!(error = %e, "Job failed");
                    Err(JobError::Failed(e))
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    warn!(panic = %msg, "Job panicked");
                    Err(JobError::Panicked(msg))
                }
            };
            deliver(tx, result);
        };
        if !self.pool.enqueue(priority, job.boxed()) {
            return JobHandle::closed();
        }
        JobHandle::new(rx)
    }

    /// Stop accepting work and release the workers once queued jobs finish.
    /// With `wait`, resolves after the queue drains and every worker exits.
    pub async fn shutdown(&self, wait: bool) {
        self.pool.shutdown(wait).await;
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pool.queue.unfinished()
    }

    pub fn max_workers(&self) -> usize {
        self.pool.max_workers
    }
}

/// Priority executor for synchronous, blocking work.
pub struct AsyncPqThreadPoolExecutor {
    pool: WorkerPool,
}

impl AsyncPqThreadPoolExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            pool: WorkerPool::new("blocking-pq", max_workers),
        }
    }

    /// Queue `work` at `priority`; it runs on the blocking pool.
    pub fn submit<F, T>(&self, work: F, priority: i32) -> JobHandle<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.pool.is_closed() {
            return JobHandle::closed();
        }
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let result = match tokio::task::spawn_blocking(work).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    debug!(error = %e, "Blocking job failed");
                    Err(JobError::Failed(e))
                }
                Err(join_err) if join_err.is_panic() => {
                    let msg = panic_message(join_err.into_panic().as_ref());
                    warn!(panic = %msg, "Blocking job panicked");
                    Err(JobError::Panicked(msg))
                }
                Err(_) => Err(JobError::Cancelled),
            };
            deliver(tx, result);
        };
        if !self.pool.enqueue(priority, job.boxed()) {
            return JobHandle::closed();
        }
        JobHandle::new(rx)
    }

    pub async fn shutdown(&self, wait: bool) {
        self.pool.shutdown(wait).await;
    }

    pub fn pending(&self) -> usize {
        self.pool.queue.unfinished()
    }

    pub fn max_workers(&self) -> usize {
        self.pool.max_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_is_attached_to_handle() {
        let exec = AsyncPqExecutor::new(1);
        let failed = exec.submit(async { Err::<(), _>(anyhow::anyhow!("disk gone")) }, 0);
        let ok = exec.submit(async { Ok(7) }, 0);

        assert!(matches!(failed.await, Err(JobError::Failed(_))));
        assert_eq!(ok.await.unwrap(), 7);
        exec.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let exec = AsyncPqExecutor::new(1);
        let boom = exec.submit(
            async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(())
            },
            0,
        );
        let after = exec.submit(async { Ok("still alive") }, 1);

        match boom.await {
            Err(JobError::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(after.await.unwrap(), "still alive");
        exec.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let exec = AsyncPqThreadPoolExecutor::new(2);
        exec.shutdown(true).await;
        let handle = exec.submit(|| Ok(1), 0);
        assert!(matches!(handle.await, Err(JobError::Closed)));
        assert_eq!(exec.pending(), 0);
    }

    #[tokio::test]
    async fn test_blocking_job_runs_off_runtime() {
        let exec = AsyncPqThreadPoolExecutor::new(2);
        let handle = exec.submit(
            || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(std::thread::current().name().map(str::to_string))
            },
            0,
        );
        assert!(handle.await.is_ok());
        assert_eq!(exec.max_workers(), 2);
        exec.shutdown(true).await;
    }
}
