/// Bounded executor pools.
///
/// Each pool admits at most `size` concurrent jobs. Sync, async and
/// build-heavy tasks get separate pools so that long builds cannot starve
/// short synchronous work.
use crate::config::PoolConfig;
use delegate_core::{PoolKind, Task};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ExecutorPool {
    kind: PoolKind,
    size: usize,
    permits: Arc<Semaphore>,
}

impl ExecutorPool {
    pub fn new(kind: PoolKind, size: usize) -> Self {
        ExecutorPool {
            kind,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Queues `job` for a free slot.
    ///
    /// A job cancelled while still queued never starts. Once started it runs
    /// to completion; cancellation is left to the job itself.
    pub fn submit<F>(&self, cancel: CancellationToken, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let kind = self.kind;
        tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Job cancelled before a {} pool slot freed up", kind);
                    return;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            job.await;
        })
    }
}

/// The three task pools.
pub struct ExecutorPools {
    sync: ExecutorPool,
    async_pool: ExecutorPool,
    build: ExecutorPool,
}

impl ExecutorPools {
    pub fn new(config: &PoolConfig) -> Self {
        ExecutorPools {
            sync: ExecutorPool::new(PoolKind::Sync, config.sync_size),
            async_pool: ExecutorPool::new(PoolKind::Async, config.async_size),
            build: ExecutorPool::new(PoolKind::Build, config.build_size),
        }
    }

    pub fn get(&self, kind: PoolKind) -> &ExecutorPool {
        match kind {
            PoolKind::Sync => &self.sync,
            PoolKind::Async => &self.async_pool,
            PoolKind::Build => &self.build,
        }
    }

    pub fn for_task(&self, task: &Task) -> &ExecutorPool {
        self.get(task.pool_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = ExecutorPool::new(PoolKind::Sync, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = pool.submit(CancellationToken::new(), async move {
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.active(), 1);

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let second = pool.submit(CancellationToken::new(), async move {
            let _ = done_tx.send(());
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        first.await.unwrap();
        done_rx.await.unwrap();
        second.await.unwrap();
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_never_starts() {
        let pool = ExecutorPool::new(PoolKind::Build, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let _busy = pool.submit(CancellationToken::new(), async move {
            let _ = release_rx.await;
        });

        let cancel = CancellationToken::new();
        let (ran_tx, mut ran_rx) = oneshot::channel::<()>();
        let queued = pool.submit(cancel.clone(), async move {
            let _ = ran_tx.send(());
        });
        cancel.cancel();
        queued.await.unwrap();
        assert!(ran_rx.try_recv().is_err());
        drop(release_tx);
    }

    #[test]
    fn test_pool_selection_by_task() {
        let pools = ExecutorPools::new(&PoolConfig::default());
        let build = Task::new("t", "a", "GCB_BUILD");
        assert_eq!(pools.for_task(&build).kind(), PoolKind::Build);
        let sync = Task::new("t", "a", "HTTP");
        assert_eq!(pools.for_task(&sync).kind(), PoolKind::Sync);
        assert_eq!(pools.get(PoolKind::Async).size(), 10);
    }
}
