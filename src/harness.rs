//! Per-worker lifecycle driver.
//!
//! One tokio task per worker: `init_thread`, the worker body, then
//! `cleanup_thread`, which runs whether the body succeeded, failed or
//! panicked.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::task;

use crate::context::{CallContext, WorkerContext};
use crate::db::Db;

/// The body each worker runs against the shared database.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run(&self, db: &dyn Db, ctx: &mut WorkerContext) -> Result<Self::Output>;
}

#[derive(Debug)]
pub struct WorkerReport<T> {
    pub thread_id: usize,
    pub result: Result<T>,
}

/// Run `worker` on `thread_count` concurrent workers and collect one
/// report per worker, ordered by thread id.
pub async fn run_workers<W: Worker>(
    db: Arc<dyn Db>,
    call: &CallContext,
    thread_count: usize,
    worker: Arc<W>,
) -> Result<Vec<WorkerReport<W::Output>>> {
    if thread_count == 0 {
        bail!("at least one worker is required");
    }
    tracing::info!(backend = db.name(), thread_count, "starting workers");

    let mut handles = Vec::with_capacity(thread_count);
    for thread_id in 0..thread_count {
        let db = db.clone();
        let call = call.clone();
        let worker = worker.clone();

        let handle = task::spawn(async move {
            let mut ctx = db.init_thread(&call, thread_id, thread_count).await?;
            tracing::debug!(thread_id, "worker initialized");
            let result = AssertUnwindSafe(worker.run(db.as_ref(), &mut ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow!("worker {} panicked: {}", thread_id, panic_message(&*panic)))
                });
            db.cleanup_thread(ctx).await;
            tracing::debug!(thread_id, ok = result.is_ok(), "worker cleaned up");
            result
        });
        handles.push((thread_id, handle));
    }

    let mut reports = Vec::with_capacity(thread_count);
    for (thread_id, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("worker {} panicked: {}", thread_id, e)),
        };
        if let Err(e) = &result {
            tracing::warn!(thread_id, error = %e, "worker failed");
        }
        reports.push(WorkerReport { thread_id, result });
    }
    Ok(reports)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::error::{DbError, DbResult};

    /// Every data operation fails; lifecycle calls are counted.
    #[derive(Default)]
    struct BrokenDb {
        inits: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl Db for BrokenDb {
        fn name(&self) -> &str {
            "broken"
        }

        async fn close(&self) -> DbResult<()> {
            Ok(())
        }

        async fn init_thread(
            &self,
            ctx: &CallContext,
            thread_id: usize,
            thread_count: usize,
        ) -> DbResult<WorkerContext> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            WorkerContext::new(ctx.clone(), thread_id, thread_count)
        }

        async fn cleanup_thread(&self, _ctx: WorkerContext) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }

        async fn read(&self, _: &mut WorkerContext, _: &str, _: &str) -> DbResult<String> {
            Err(DbError::backend("disk on fire"))
        }

        async fn update(&self, _: &mut WorkerContext, _: &str, _: &str, _: &str) -> DbResult<()> {
            Err(DbError::backend("disk on fire"))
        }

        async fn insert(&self, _: &mut WorkerContext, _: &str, _: &str, _: &str) -> DbResult<()> {
            Err(DbError::backend("disk on fire"))
        }

        async fn delete(&self, _: &mut WorkerContext, _: &str, _: &str) -> DbResult<()> {
            Err(DbError::backend("disk on fire"))
        }
    }

    struct InsertOnce {
        seen: Mutex<Vec<(usize, usize)>>,
    }

    #[async_trait]
    impl Worker for InsertOnce {
        type Output = ();

        async fn run(&self, db: &dyn Db, ctx: &mut WorkerContext) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((ctx.thread_id(), ctx.thread_count()));
            db.insert(ctx, "t", "k", "v").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn cleanup_runs_even_when_every_operation_fails() {
        let db = Arc::new(BrokenDb::default());
        let worker = Arc::new(InsertOnce {
            seen: Mutex::new(Vec::new()),
        });

        let reports = run_workers(db.clone(), &CallContext::new(), 5, worker.clone())
            .await
            .unwrap();

        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.result.is_err()));
        assert_eq!(
            reports.iter().map(|r| r.thread_id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(db.inits.load(Ordering::SeqCst), 5);
        assert_eq!(db.cleanups.load(Ordering::SeqCst), 5);

        let mut seen = worker.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..5).map(|id| (id, 5)).collect::<Vec<_>>());
    }

    struct Panics;

    #[async_trait]
    impl Worker for Panics {
        type Output = ();

        async fn run(&self, _: &dyn Db, ctx: &mut WorkerContext) -> Result<()> {
            panic!("worker {} blew up", ctx.thread_id());
        }
    }

    #[tokio::test]
    async fn cleanup_runs_after_a_panicking_worker() {
        let db = Arc::new(BrokenDb::default());

        let reports = run_workers(db.clone(), &CallContext::new(), 3, Arc::new(Panics))
            .await
            .unwrap();

        assert_eq!(reports.len(), 3);
        for report in &reports {
            let err = report.result.as_ref().unwrap_err().to_string();
            assert!(err.contains("panicked"), "{}", err);
            assert!(err.contains("blew up"), "{}", err);
        }
        assert_eq!(db.inits.load(Ordering::SeqCst), 3);
        assert_eq!(db.cleanups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let db: Arc<dyn Db> = Arc::new(BrokenDb::default());
        let worker = Arc::new(InsertOnce {
            seen: Mutex::new(Vec::new()),
        });
        assert!(run_workers(db, &CallContext::new(), 0, worker).await.is_err());
    }
}
