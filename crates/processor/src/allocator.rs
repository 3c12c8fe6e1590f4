//! Worker allocation.
//!
//! Two allocator variants share one capability set: a singleton for
//! single-threaded invocation pipelines and a fixed pool handing out
//! workers FIFO with bounded-wait semantics. The choice is wired at
//! construction; dispatch happens at the boundary only.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocateError {
    #[error("No available workers")]
    NoAvailableWorkers,
}

/// Monotonic allocation counters. Never decremented; reset only by process
/// restart.
#[derive(Debug, Default)]
pub struct AllocatorStatistics {
    allocations: AtomicU64,
    success_immediate: AtomicU64,
    success_after_wait: AtomicU64,
    timeouts: AtomicU64,
    wait_ms_sum: AtomicU64,
    available_sampled_sum: AtomicU64,
}

impl AllocatorStatistics {
    fn snapshot(&self) -> AllocatorStatisticsSnapshot {
        AllocatorStatisticsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            success_immediate: self.success_immediate.load(Ordering::Relaxed),
            success_after_wait: self.success_after_wait.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            wait_ms_sum: self.wait_ms_sum.load(Ordering::Relaxed),
            available_sampled_sum: self.available_sampled_sum.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of an allocator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStatisticsSnapshot {
    pub allocations: u64,
    pub success_immediate: u64,
    pub success_after_wait: u64,
    pub timeouts: u64,
    pub wait_ms_sum: u64,
    pub available_sampled_sum: u64,
}

#[async_trait]
pub trait WorkerAllocator: Send + Sync {
    /// Lease a worker, waiting up to `timeout`. A zero timeout means
    /// non-blocking.
    async fn allocate(&self, timeout: Duration) -> Result<Arc<Worker>, AllocateError>;

    /// Return a leased worker. Releasing a worker that does not belong to
    /// this allocator is undefined: identity is not validated, callers are
    /// expected to hold on to their lease handles.
    fn release(&self, worker: Arc<Worker>);

    /// Whether concurrent tasks may share this allocator.
    fn shareable(&self) -> bool;

    /// Direct access to all workers for management and housekeeping.
    fn workers(&self) -> Vec<Arc<Worker>>;

    fn statistics(&self) -> AllocatorStatisticsSnapshot;
}

/// Holds exactly one worker, handed out unconditionally and immediately.
/// Callers must serialize externally.
pub struct SingletonWorkerAllocator {
    worker: Arc<Worker>,
    statistics: AllocatorStatistics,
}

impl SingletonWorkerAllocator {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker: Arc::new(worker),
            statistics: AllocatorStatistics::default(),
        }
    }
}

#[async_trait]
impl WorkerAllocator for SingletonWorkerAllocator {
    async fn allocate(&self, _timeout: Duration) -> Result<Arc<Worker>, AllocateError> {
        Ok(self.worker.clone())
    }

    fn release(&self, _worker: Arc<Worker>) {}

    fn shareable(&self) -> bool {
        false
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        vec![self.worker.clone()]
    }

    fn statistics(&self) -> AllocatorStatisticsSnapshot {
        self.statistics.snapshot()
    }
}

/// Fixed number of workers behind a bounded FIFO queue, pre-populated at
/// construction. The worker released longest ago is allocated next.
pub struct FixedPoolWorkerAllocator {
    workers: Vec<Arc<Worker>>,
    queue: Mutex<VecDeque<Arc<Worker>>>,
    permits: Semaphore,
    statistics: AllocatorStatistics,
}

impl FixedPoolWorkerAllocator {
    pub fn new(workers: Vec<Worker>) -> Self {
        let workers: Vec<Arc<Worker>> = workers.into_iter().map(Arc::new).collect();
        let queue: VecDeque<Arc<Worker>> = workers.iter().cloned().collect();
        debug!(workers = workers.len(), "Created fixed pool worker allocator");
        Self {
            permits: Semaphore::new(workers.len()),
            queue: Mutex::new(queue),
            workers,
            statistics: AllocatorStatistics::default(),
        }
    }

    /// Pop the next worker. Only called with a permit held, so the queue
    /// cannot be empty.
    fn take_front(&self) -> Arc<Worker> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("pool queue empty while a permit was held")
    }
}

#[async_trait]
impl WorkerAllocator for FixedPoolWorkerAllocator {
    async fn allocate(&self, timeout: Duration) -> Result<Arc<Worker>, AllocateError> {
        self.statistics.allocations.fetch_add(1, Ordering::Relaxed);

        // sample how many workers are available while we're allocating
        self.statistics
            .available_sampled_sum
            .fetch_add(self.permits.available_permits() as u64, Ordering::Relaxed);

        if let Ok(permit) = self.permits.try_acquire() {
            permit.forget();
            self.statistics
                .success_immediate
                .fetch_add(1, Ordering::Relaxed);
            return Ok(self.take_front());
        }

        if timeout.is_zero() {
            self.statistics.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(AllocateError::NoAvailableWorkers);
        }

        let wait_start = Instant::now();
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.statistics
                    .success_after_wait
                    .fetch_add(1, Ordering::Relaxed);
                self.statistics
                    .wait_ms_sum
                    .fetch_add(wait_start.elapsed().as_millis() as u64, Ordering::Relaxed);
                Ok(self.take_front())
            }
            // the semaphore is never closed; both arms are the timer firing
            Ok(Err(_)) | Err(_) => {
                self.statistics.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(AllocateError::NoAvailableWorkers)
            }
        }
    }

    fn release(&self, worker: Arc<Worker>) {
        // capacity equals population, so the queue can never be full here;
        // blocking would indicate a double release
        self.queue.lock().unwrap().push_back(worker);
        self.permits.add_permits(1);
    }

    fn shareable(&self) -> bool {
        true
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.clone()
    }

    fn statistics(&self) -> AllocatorStatisticsSnapshot {
        self.statistics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> FixedPoolWorkerAllocator {
        FixedPoolWorkerAllocator::new((0..size).map(Worker::new).collect())
    }

    #[tokio::test]
    async fn test_singleton_always_allocates() {
        let allocator = SingletonWorkerAllocator::new(Worker::new(0));
        assert!(!allocator.shareable());
        assert_eq!(allocator.workers().len(), 1);

        for _ in 0..3 {
            let worker = allocator.allocate(Duration::ZERO).await.unwrap();
            assert_eq!(worker.index(), 0);
            allocator.release(worker);
        }

        // the singleton does not account its allocations
        assert_eq!(allocator.statistics(), AllocatorStatisticsSnapshot::default());
    }

    #[tokio::test]
    async fn test_fixed_pool_nonblocking_exhaustion() {
        let allocator = pool(2);
        assert!(allocator.shareable());

        let first = allocator.allocate(Duration::ZERO).await.unwrap();
        let second = allocator.allocate(Duration::ZERO).await.unwrap();
        assert_ne!(first.index(), second.index());

        let err = allocator.allocate(Duration::ZERO).await.unwrap_err();
        assert_eq!(err, AllocateError::NoAvailableWorkers);

        let stats = allocator.statistics();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.success_immediate, 2);
        assert_eq!(stats.success_after_wait, 0);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let allocator = pool(2);

        let first = allocator.allocate(Duration::ZERO).await.unwrap();
        let second = allocator.allocate(Duration::ZERO).await.unwrap();
        let first_index = first.index();
        let second_index = second.index();

        // released longest ago comes back first
        allocator.release(second);
        allocator.release(first);

        assert_eq!(
            allocator.allocate(Duration::ZERO).await.unwrap().index(),
            second_index
        );
        assert_eq!(
            allocator.allocate(Duration::ZERO).await.unwrap().index(),
            first_index
        );
    }

    #[tokio::test]
    async fn test_allocate_succeeds_after_wait() {
        let allocator = Arc::new(pool(1));

        let worker = allocator.allocate(Duration::ZERO).await.unwrap();

        let releaser = allocator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release(worker);
        });

        let worker = allocator.allocate(Duration::from_millis(500)).await.unwrap();
        assert_eq!(worker.index(), 0);

        let stats = allocator.statistics();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.success_immediate, 1);
        assert_eq!(stats.success_after_wait, 1);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test]
    async fn test_contention_statistics() {
        // five concurrent callers against two workers, nobody releases:
        // exactly two immediate successes, three timeouts
        let allocator = Arc::new(pool(2));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.allocate(Duration::from_millis(100)).await
            }));
        }

        let mut successes = 0;
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(AllocateError::NoAvailableWorkers) => failures += 1,
            }
        }
        assert_eq!(successes, 2);
        assert_eq!(failures, 3);

        let stats = allocator.statistics();
        assert_eq!(stats.allocations, 5);
        assert_eq!(stats.success_immediate, 2);
        assert_eq!(stats.success_after_wait, 0);
        assert_eq!(stats.timeouts, 3);
    }

    #[tokio::test]
    async fn test_accounting_invariant() {
        let allocator = Arc::new(pool(2));

        // mix of immediate successes, waited successes and timeouts
        let a = allocator.allocate(Duration::ZERO).await.unwrap();
        let b = allocator.allocate(Duration::ZERO).await.unwrap();
        let _ = allocator.allocate(Duration::ZERO).await;
        let _ = allocator.allocate(Duration::from_millis(10)).await;

        let releaser = allocator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release(a);
            releaser.release(b);
        });
        let _ = allocator.allocate(Duration::from_millis(500)).await.unwrap();

        let stats = allocator.statistics();
        assert_eq!(
            stats.success_immediate + stats.success_after_wait + stats.timeouts,
            stats.allocations
        );
        assert!(stats.wait_ms_sum > 0);
    }
}
