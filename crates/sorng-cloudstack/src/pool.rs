//! Bounded worker pool for fan-out listings.
//!
//! Each job runs on its own tokio task, gated by a semaphore, and pushes
//! results into a shared [`Collector`]. The caller waits until every job
//! has finished or the first one fails, in which case the rest are
//! aborted.

use crate::error::{CsError, CsResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// Default number of jobs allowed to run at once.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Sink handed to each job; cheap to clone and safe to use concurrently.
pub struct Collector<T> {
    job: usize,
    tx: mpsc::UnboundedSender<(usize, T)>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            job: self.job,
            tx: self.tx.clone(),
        }
    }
}

impl<T> Collector<T> {
    /// Push one item. Items pushed after the caller gave up are dropped.
    pub fn push(&self, item: T) {
        if self.tx.send((self.job, item)).is_err() {
            log::debug!("collector for job {} closed; dropping item", self.job);
        }
    }

    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) {
        for item in items {
            self.push(item);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    max_workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Run `jobs` and return everything they collected, grouped by job in
    /// submission order with each job's push order preserved.
    pub async fn run<T, F, Fut>(&self, jobs: Vec<F>) -> CsResult<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce(Collector<T>) -> Fut + Send + 'static,
        Fut: Future<Output = CsResult<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();

        for (job, start) in jobs.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let collector = Collector { job, tx: tx.clone() };
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CsError::internal("Worker pool was closed"))?;
                start(collector).await
            });
        }
        drop(tx);

        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(CsError::internal(format!("Worker failed: {}", e))),
            };
            if let Err(e) = outcome {
                set.abort_all();
                return Err(e);
            }
        }

        let mut collected = Vec::new();
        while let Ok(item) = rx.try_recv() {
            collected.push(item);
        }
        collected.sort_by_key(|(job, _)| *job);
        Ok(collected.into_iter().map(|(_, item)| item).collect())
    }
}
