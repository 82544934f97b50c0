//! Bounded Work Queues
//!
//! Three flavours of asynchronous job queue:
//!
//! - [`WorkQueue`]: at most N jobs in flight, started strictly in submission
//!   order (render jobs use N = 4)
//! - [`WorkQueue::serial`]: N = 1, so jobs run one after another in order
//!   (one per surface)
//! - [`KeyedQueue`]: jobs sharing a key run one after another in order, and
//!   at most N jobs run overall (connection restarts)
//!
//! ```text
//!   submit ──▶ mpsc ──▶ dispatcher ──acquire permit──▶ spawn(job)
//!                         (FIFO)        Semaphore(N)
//! ```
//!
//! In-flight work cannot be cancelled. All constructors must be called
//! from within a Tokio runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};

use crate::error::{HubError, HubResult};

type Job = BoxFuture<'static, ()>;

/// Counts outstanding jobs and wakes idle waiters
#[derive(Debug, Default)]
struct IdleTracker {
    pending: AtomicUsize,
    idle: Notify,
}

impl IdleTracker {
    fn begin(self: &Arc<Self>) -> IdleGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        IdleGuard(Arc::clone(self))
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the pending count when the job finishes, panics included
struct IdleGuard(Arc<IdleTracker>);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// =============================================================================
// WorkQueue
// =============================================================================

/// Queue with bounded concurrency and in-order start
#[derive(Clone)]
pub struct WorkQueue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
    tracker: Arc<IdleTracker>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkQueue {
    /// Create a queue running at most `concurrency` jobs at once
    #[must_use]
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));

        let queue_name = Arc::clone(&name);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
            tracing::debug!(queue = %queue_name, "Work queue dispatcher stopped");
        });

        Self {
            name,
            tx,
            tracker: Arc::new(IdleTracker::default()),
        }
    }

    /// Create a strictly ordered queue (concurrency 1)
    #[must_use]
    pub fn serial(name: impl Into<String>) -> Self {
        Self::new(name, 1)
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs submitted but not yet finished
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// Submit a job without waiting for it
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tracker.begin();
        let job = async move {
            job.await;
            drop(guard);
        }
        .boxed();
        if self.tx.send(job).is_err() {
            tracing::warn!(queue = %self.name, "Work queue closed, job dropped");
        }
    }

    /// Submit a job and wait for its output
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the queue shut down before the job ran.
    pub async fn run<F, T>(&self, job: F) -> HubResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(async move {
            let _ = tx.send(job.await);
        });
        rx.await
            .map_err(|_| HubError::Closed(format!("work queue {}", self.name)))
    }

    /// Wait until no job is pending
    pub async fn wait_idle(&self) {
        self.tracker.wait().await;
    }
}

// =============================================================================
// KeyedQueue
// =============================================================================

type Chains = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>;

/// Single-flight-per-key queue with a shared concurrency bound
#[derive(Clone)]
pub struct KeyedQueue {
    name: Arc<str>,
    permits: Arc<Semaphore>,
    chains: Chains,
    tracker: Arc<IdleTracker>,
}

impl KeyedQueue {
    /// Create a queue running at most `concurrency` jobs at once overall
    #[must_use]
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: Arc::from(name.into()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            chains: Arc::new(Mutex::new(HashMap::new())),
            tracker: Arc::new(IdleTracker::default()),
        }
    }

    /// Jobs submitted but not yet finished
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// Submit a job behind every earlier job with the same key
    pub fn submit<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tracker.begin();
        let job = async move {
            job.await;
            drop(guard);
        }
        .boxed();

        let mut chains = self.chains.lock();
        let job = match chains.get(key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        chains.insert(key.to_string(), tx);
        drop(chains);

        tokio::spawn(run_chain(
            key.to_string(),
            rx,
            Arc::clone(&self.chains),
            Arc::clone(&self.permits),
        ));
    }

    /// Submit a keyed job and wait for its output
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the job was dropped before completing.
    pub async fn run<F, T>(&self, key: &str, job: F) -> HubResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(key, async move {
            let _ = tx.send(job.await);
        });
        rx.await
            .map_err(|_| HubError::Closed(format!("keyed queue {}", self.name)))
    }

    /// Wait until no job is pending
    pub async fn wait_idle(&self) {
        self.tracker.wait().await;
    }
}

/// Drain one key's chain, removing it from the map once empty
async fn run_chain(
    key: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    chains: Chains,
    permits: Arc<Semaphore>,
) {
    loop {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Re-check under the lock so a concurrent submit is never stranded
                let mut map = chains.lock();
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        map.remove(&key);
                        return;
                    }
                }
            }
        };

        let Ok(_permit) = permits.acquire().await else {
            return;
        };
        job.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serial_queue_preserves_order() {
        let queue = WorkQueue::serial("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10u32 {
            let log = Arc::clone(&log);
            queue.submit(async move {
                // Earlier jobs sleep longer; order must still hold
                tokio::time::sleep(Duration::from_millis(u64::from(10 - i))).await;
                log.lock().push(i);
            });
        }
        queue.wait_idle().await;

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_work_queue_bounds_concurrency() {
        let queue = WorkQueue::new("bounded", 4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            queue.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        queue.wait_idle().await;

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let queue = WorkQueue::new("run", 2);
        let value = queue.run(async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_keyed_queue_orders_per_key() {
        let queue = KeyedQueue::new("keyed", 4);
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5u64 {
            for key in ["a", "b"] {
                let log = Arc::clone(&log);
                queue.submit(key, async move {
                    tokio::time::sleep(Duration::from_millis(5 - i)).await;
                    log.lock().push(format!("{key}{i}"));
                });
            }
        }
        queue.wait_idle().await;

        let log = log.lock();
        for key in ["a", "b"] {
            let seen: Vec<&String> = log.iter().filter(|e| e.starts_with(key)).collect();
            let expected: Vec<String> = (0..5).map(|i| format!("{key}{i}")).collect();
            assert_eq!(seen, expected.iter().collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_keyed_queue_reuses_key_after_drain() {
        let queue = KeyedQueue::new("keyed", 1);
        assert_eq!(queue.run("k", async { 1 }).await.unwrap(), 1);
        queue.wait_idle().await;
        assert_eq!(queue.run("k", async { 2 }).await.unwrap(), 2);
    }
}
