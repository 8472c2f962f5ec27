use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Default concurrency cap.
pub const DEFAULT_MAX_WORKERS: usize = 100;

/// Errors from pool submission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The caller's scope was cancelled before a worker slot freed.
    #[error("submission cancelled")]
    Cancelled,
}

/// Pool statistics for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Tasks currently holding a worker slot.
    pub active: usize,
    /// The concurrency cap.
    pub max_workers: usize,
}

/// A bounded set of worker tasks.
///
/// At most `max_workers` submitted tasks run concurrently; this is what
/// keeps a large device fleet from exhausting sockets and file
/// descriptors. Submission waits for a slot, racing the caller's
/// cancellation scope.
pub struct Pool {
    max_workers: usize,
    sem: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Pool {
    /// Creates a pool. `max_workers == 0` selects
    /// [`DEFAULT_MAX_WORKERS`].
    pub fn new(max_workers: usize) -> Self {
        let max_workers = if max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            max_workers
        };
        Self {
            max_workers,
            sem: Arc::new(Semaphore::new(max_workers)),
            tracker: TaskTracker::new(),
        }
    }

    /// Schedules `task` once a worker slot is free. Returns
    /// [`PoolError::Cancelled`] if `token` fires first. The task's error,
    /// if any, is logged, not returned.
    pub async fn submit<F>(
        &self,
        token: &CancellationToken,
        name: &str,
        task: F,
    ) -> Result<(), PoolError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permit = tokio::select! {
            _ = token.cancelled() => return Err(PoolError::Cancelled),
            permit = Arc::clone(&self.sem).acquire_owned() => {
                permit.map_err(|_| PoolError::Cancelled)?
            }
        };

        let name = name.to_string();
        let cancelled = token.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            debug!(task = %name, "task started");
            match task.await {
                Ok(()) => debug!(task = %name, "task completed"),
                Err(e) if cancelled.is_cancelled() => {
                    debug!(task = %name, error = %e, "task ended during shutdown");
                }
                Err(e) => warn!(task = %name, error = %e, "task failed"),
            }
        });

        Ok(())
    }

    /// Tasks currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.max_workers - self.sem.available_permits()
    }

    /// The concurrency cap.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active_count(),
            max_workers: self.max_workers,
        }
    }

    /// Stops accepting tasks and waits for all running tasks to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let pool = Pool::new(4);
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let count = Arc::clone(&count);
            pool.submit(&token, "incr", async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .expect("submit");
        }

        pool.wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 8);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_cap() {
        let pool = Pool::new(2);
        let token = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(&token, "probe", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .expect("submit");
        }

        pool.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_scope_rejects_submission() {
        let pool = Pool::new(1);
        let token = CancellationToken::new();

        // Occupy the only slot.
        let hold = CancellationToken::new();
        let held = hold.clone();
        pool.submit(&token, "hold", async move {
            held.cancelled().await;
            Ok(())
        })
        .await
        .expect("submit");

        // A cancelled caller cannot wait for the slot.
        let caller = CancellationToken::new();
        caller.cancel();
        let result = pool
            .submit(&caller, "late", async move { Ok(()) })
            .await;
        assert_eq!(result, Err(PoolError::Cancelled));

        hold.cancel();
        pool.wait().await;
    }
}
