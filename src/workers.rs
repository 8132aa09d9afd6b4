//! Worker-pool strategies for fanning out shard requests.
//!
//! Grounded in the reference implementation's three worker backends
//! (`workers_sequential`, `workers_ondemand`, `workers_pool`): each offers
//! the same `launch`/`wait_all` surface but trades concurrency for
//! resource bounds differently. Translated from native threads/queues to
//! `tokio::spawn` plus a `Semaphore` or an `async-channel` bounded queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::XpnResult;

pub type BoxedTask = Pin<Box<dyn Future<Output = XpnResult<i32>> + Send>>;

/// Common surface every worker strategy exposes.
#[async_trait::async_trait]
pub trait WorkerPool: Send + Sync {
    /// Runs `task` and returns a handle to its result.
    async fn launch(&self, task: BoxedTask) -> JoinHandle<XpnResult<i32>>;

    /// Runs `task`, discarding its result (fire-and-forget fan-out, used
    /// by replica writes where only the primary's result is returned to
    /// the caller).
    async fn launch_no_future(&self, task: BoxedTask);

    /// Blocks until every task launched so far has completed.
    async fn wait_all(&self);

    /// Current number of workers (pool capacity, not in-flight count).
    fn size(&self) -> usize;
}

/// Runs every task inline on the calling task, one at a time. No
/// concurrency; used for `block_size` layouts small enough that fan-out
/// overhead would dominate, or for deterministic single-threaded testing.
pub struct SequentialPool;

#[async_trait::async_trait]
impl WorkerPool for SequentialPool {
    async fn launch(&self, task: BoxedTask) -> JoinHandle<XpnResult<i32>> {
        let result = task.await;
        tokio::spawn(async move { result })
    }

    async fn launch_no_future(&self, task: BoxedTask) {
        let _ = task.await;
    }

    async fn wait_all(&self) {}

    fn size(&self) -> usize {
        1
    }
}

/// Spawns one `tokio` task per request, capped by a semaphore so an
/// unbounded fan-out (e.g. a write striped across hundreds of servers)
/// cannot exhaust the runtime's worker threads. Capacity defaults to
/// twice the available parallelism, mirroring the reference
/// implementation's `2 * hardware_concurrency` on-demand default.
pub struct OnDemandPool {
    semaphore: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl OnDemandPool {
    pub fn new(capacity: Option<usize>) -> Self {
        let capacity = capacity.unwrap_or_else(|| 2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
        Self { semaphore: Arc::new(Semaphore::new(capacity)), handles: Mutex::new(Vec::new()), capacity }
    }
}

#[async_trait::async_trait]
impl WorkerPool for OnDemandPool {
    async fn launch(&self, task: BoxedTask) -> JoinHandle<XpnResult<i32>> {
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        tokio::spawn(async move {
            let result = task.await;
            drop(permit);
            result
        })
    }

    async fn launch_no_future(&self, task: BoxedTask) {
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let handle = tokio::spawn(async move {
            let _ = task.await;
            drop(permit);
        });
        self.handles.lock().await.push(handle);
    }

    async fn wait_all(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    fn size(&self) -> usize {
        self.capacity
    }
}

/// A fixed set of worker loops draining a bounded `async-channel` queue.
/// `launch` blocks if every worker is busy and the queue is full,
/// providing backpressure instead of unbounded task growth.
pub struct FixedPool {
    sender: Sender<BoxedTask>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl FixedPool {
    pub fn new(capacity: usize, queue_depth: usize) -> Self {
        let (sender, receiver): (Sender<BoxedTask>, Receiver<BoxedTask>) = async_channel::bounded(queue_depth.max(1));
        let mut workers = Vec::with_capacity(capacity);
        for _ in 0..capacity.max(1) {
            let receiver = receiver.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(task) = receiver.recv().await {
                    let _ = task.await;
                }
            }));
        }
        Self { sender, workers, capacity: capacity.max(1) }
    }
}

#[async_trait::async_trait]
impl WorkerPool for FixedPool {
    async fn launch(&self, task: BoxedTask) -> JoinHandle<XpnResult<i32>> {
        // Fixed pools do not hand back per-task results directly; wrap the
        // task so its result can still be observed via a join handle if the
        // caller needs one, at the cost of a double-spawn.
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let wrapped: BoxedTask = Box::pin(async move {
            let result = task.await;
            let _ = result_tx.send(result.clone());
            result
        });
        let _ = self.sender.send(wrapped).await;
        tokio::spawn(async move { result_rx.await.unwrap_or(Ok(-1)) })
    }

    async fn launch_no_future(&self, task: BoxedTask) {
        let _ = self.sender.send(task).await;
    }

    async fn wait_all(&self) {
        self.sender.close();
        // Workers drain on drop of the last sender clone; nothing to await
        // here beyond giving the queue a chance to empty.
        while !self.sender.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    fn size(&self) -> usize {
        self.capacity
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.sender.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sequential_pool_runs_one_task_at_a_time() {
        let pool = SequentialPool;
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            let handle = pool
                .launch(Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                }))
                .await;
            handle.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn on_demand_pool_runs_tasks_concurrently_up_to_capacity() {
        let pool = OnDemandPool::new(Some(4));
        assert_eq!(pool.size(), 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.launch_no_future(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }))
            .await;
        }
        pool.wait_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn fixed_pool_drains_a_bounded_queue() {
        let pool = FixedPool::new(2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.launch_no_future(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }))
            .await;
        }
        pool.wait_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
