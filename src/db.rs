use async_trait::async_trait;

use crate::batch::BatchDb;
use crate::context::{CallContext, WorkerContext};
use crate::error::DbResult;
use crate::transaction::TransactionDb;

/// The layer the benchmark engine uses to access the database under test.
///
/// One instance is shared by every worker of a run. Every data operation
/// receives the calling worker's [`WorkerContext`]; implementations must be
/// safe to call concurrently for distinct contexts.
#[async_trait]
pub trait Db: Send + Sync + 'static {
    /// Short backend name, used in logs.
    fn name(&self) -> &str;

    /// Release all backend resources. Called once at shutdown.
    async fn close(&self) -> DbResult<()>;

    /// Prepare the state of one worker.
    ///
    /// The returned context must be used for every following call made by
    /// that worker. Fails if `thread_id >= thread_count`.
    async fn init_thread(
        &self,
        ctx: &CallContext,
        thread_id: usize,
        thread_count: usize,
    ) -> DbResult<WorkerContext> {
        WorkerContext::new(ctx.clone(), thread_id, thread_count)
    }

    /// Release the state of one worker after its last operation, whatever
    /// the outcome of its operations was.
    async fn cleanup_thread(&self, ctx: WorkerContext) {
        drop(ctx);
    }

    /// Read the value of a record.
    async fn read(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<String>;

    /// Overwrite the value of an existing record. Not an upsert.
    async fn update(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()>;

    /// Create a new record.
    async fn insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()>;

    /// Remove a record.
    async fn delete(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<()>;

    /// Narrow to the transactional extension, if this backend has it.
    fn as_transaction_db(&self) -> Option<&dyn TransactionDb> {
        None
    }

    /// Narrow to the batch extension, if this backend has it.
    fn as_batch_db(&self) -> Option<&dyn BatchDb> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: self.as_transaction_db().is_some(),
            batch: self.as_batch_db().is_some(),
        }
    }
}

/// Optional extensions beyond the base contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Transactional,
    Batch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub transactional: bool,
    pub batch: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Transactional => self.transactional,
            Capability::Batch => self.batch,
        }
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = vec!["basic"];
        if self.transactional {
            parts.push("transactional");
        }
        if self.batch {
            parts.push("batch");
        }
        write!(f, "{}", parts.join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;

    struct PlainDb;

    #[async_trait]
    impl Db for PlainDb {
        fn name(&self) -> &str {
            "plain"
        }

        async fn close(&self) -> DbResult<()> {
            Ok(())
        }

        async fn read(&self, _: &mut WorkerContext, table: &str, key: &str) -> DbResult<String> {
            Err(DbError::not_found(table, key))
        }

        async fn update(&self, _: &mut WorkerContext, t: &str, k: &str, _: &str) -> DbResult<()> {
            Err(DbError::not_found(t, k))
        }

        async fn insert(&self, _: &mut WorkerContext, _: &str, _: &str, _: &str) -> DbResult<()> {
            Ok(())
        }

        async fn delete(&self, _: &mut WorkerContext, t: &str, k: &str) -> DbResult<()> {
            Err(DbError::not_found(t, k))
        }
    }

    #[tokio::test]
    async fn plain_backend_advertises_no_extensions() {
        let db = PlainDb;
        let caps = db.capabilities();
        assert_eq!(caps, Capabilities::default());
        assert!(!caps.supports(Capability::Transactional));
        assert!(!caps.supports(Capability::Batch));
        assert!(db.as_transaction_db().is_none());
        assert!(db.as_batch_db().is_none());
        assert_eq!(caps.to_string(), "basic");
    }

    #[tokio::test]
    async fn default_init_thread_validates_ids() {
        let db = PlainDb;
        let call = CallContext::new();
        let ctx = db.init_thread(&call, 2, 5).await.unwrap();
        assert_eq!(ctx.thread_id(), 2);
        db.cleanup_thread(ctx).await;

        assert!(db.init_thread(&call, 5, 5).await.is_err());
    }
}
