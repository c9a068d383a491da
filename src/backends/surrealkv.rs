//! SurrealKV backend.
//!
//! Plain and transactional only; it does not implement the batch
//! extension. Writes read the key inside a read-write SurrealKV
//! transaction, so a concurrent change to it makes the commit fail with a
//! conflict instead of silently overwriting.
//!
//! Parameters: `surrealkv.dir`, `surrealkv.drop_data`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::data_dir::DataDir;
use crate::codec;
use crate::config::DbConfig;
use crate::context::WorkerContext;
use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::transaction::{CommitTarget, StagedTransaction, Transaction, TransactionDb, WriteSet};

pub const NAME: &str = "surrealkv";

const DEFAULT_DB_PATH: &str = "surrealkv_ycsb";

fn skv_err(err: surrealkv::Error) -> DbError {
    // surrealkv reports write/write and read/write races at commit time
    match err {
        surrealkv::Error::TransactionReadConflict | surrealkv::Error::TransactionWriteConflict => {
            DbError::Conflict(err.to_string())
        }
        _ => DbError::backend(err),
    }
}

struct Shared {
    store: surrealkv::Store,
    closed: AtomicBool,
    dir: DataDir,
}

impl Shared {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }

    fn begin(&self, mode: surrealkv::Mode) -> DbResult<surrealkv::Transaction> {
        self.ensure_open()?;
        self.store.begin_with_mode(mode).map_err(skv_err)
    }
}

#[async_trait]
impl CommitTarget for Shared {
    fn name(&self) -> &str {
        NAME
    }

    async fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let mut txn = self.begin(surrealkv::Mode::ReadOnly)?;
        let value = txn.get(key).map_err(skv_err)?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn apply(&self, set: WriteSet) -> DbResult<()> {
        let mut txn = self.begin(surrealkv::Mode::ReadWrite)?;
        let stale = set.first_stale(|key| {
            txn.get(key)
                .map(|v| v.map(|v| v.to_vec()))
                .map_err(skv_err)
        })?;
        if let Some(key) = stale {
            return Err(DbError::Conflict(format!(
                "key {} changed since it was read",
                String::from_utf8_lossy(key)
            )));
        }
        for (key, value) in set.writes() {
            match value {
                Some(value) => txn.set(key, value).map_err(skv_err)?,
                None => txn.delete(key).map_err(skv_err)?,
            }
        }
        txn.commit().await.map_err(skv_err)
    }
}

pub struct SurrealKv {
    shared: Arc<Shared>,
}

impl SurrealKv {
    pub fn open(config: &DbConfig) -> DbResult<Self> {
        let db_path = PathBuf::from(config.get_or("surrealkv.dir", DEFAULT_DB_PATH));
        let drop_data = config.parse_or("surrealkv.drop_data", true)?;

        let dir = DataDir::prepare(db_path, drop_data)?;

        let mut opts = surrealkv::Options::new();
        opts.enable_versions = false;
        opts.disk_persistence = true;
        opts.dir = dir.path().to_path_buf();

        let store = surrealkv::Store::new(opts).map_err(skv_err)?;
        tracing::info!(path = %dir.path().display(), "opened surrealkv backend");

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                closed: AtomicBool::new(false),
                dir,
            }),
        })
    }

    pub fn create(config: &DbConfig) -> DbResult<Arc<dyn Db>> {
        Ok(Arc::new(Self::open(config)?))
    }

    /// Run `write` inside a read-write transaction after looking up `rkey`.
    async fn write_checked<F>(&self, ctx: &WorkerContext, rkey: &[u8], write: F) -> DbResult<()>
    where
        F: FnOnce(&mut surrealkv::Transaction, bool) -> DbResult<()> + Send,
    {
        ctx.guard(async {
            let mut txn = self.shared.begin(surrealkv::Mode::ReadWrite)?;
            let exists = txn.get(rkey).map_err(skv_err)?.is_some();
            write(&mut txn, exists)?;
            txn.commit().await.map_err(skv_err)
        })
        .await
    }
}

#[async_trait]
impl Db for SurrealKv {
    fn name(&self) -> &str {
        NAME
    }

    async fn close(&self) -> DbResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.store.close().await.map_err(skv_err)?;
        tracing::info!(path = %self.shared.dir.path().display(), "closed surrealkv backend");
        Ok(())
    }

    async fn read(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<String> {
        let rkey = codec::record_key(table, key)?;
        let data = ctx.guard(CommitTarget::get(&*self.shared, &rkey)).await?;
        match data {
            Some(data) => codec::decode_value(&data),
            None => Err(DbError::not_found(table, key)),
        }
    }

    async fn update(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()> {
        let rkey = codec::record_key(table, key)?;
        let data = codec::encode_value(value)?;
        self.write_checked(ctx, &rkey, |txn, exists| {
            if !exists {
                return Err(DbError::not_found(table, key));
            }
            txn.set(&rkey, &data).map_err(skv_err)
        })
        .await
    }

    async fn insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()> {
        let rkey = codec::record_key(table, key)?;
        let data = codec::encode_value(value)?;
        self.write_checked(ctx, &rkey, |txn, exists| {
            if exists {
                return Err(DbError::duplicate(table, key));
            }
            txn.set(&rkey, &data).map_err(skv_err)
        })
        .await
    }

    async fn delete(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<()> {
        let rkey = codec::record_key(table, key)?;
        self.write_checked(ctx, &rkey, |txn, exists| {
            if !exists {
                return Err(DbError::not_found(table, key));
            }
            txn.delete(&rkey).map_err(skv_err)
        })
        .await
    }

    fn as_transaction_db(&self) -> Option<&dyn TransactionDb> {
        Some(self)
    }
}

impl TransactionDb for SurrealKv {
    fn new_transaction(&self) -> Box<dyn Transaction> {
        Box::new(StagedTransaction::new(self.shared.clone()))
    }
}
