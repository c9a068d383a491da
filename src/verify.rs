//! Contract-verification workload.
//!
//! Each worker owns the keys `user{i}` with `i % thread_count == thread_id`.
//! It inserts them, reads them back, updates them, reads again, deletes
//! them and checks they are gone, using the single-record, transactional
//! or batch operations depending on [`OpPath`].

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use rand::seq::SliceRandom;

use crate::batch::{BatchDb, FieldMap};
use crate::codec::VALUE_FIELD;
use crate::context::WorkerContext;
use crate::db::{Capabilities, Db};
use crate::error::DbError;
use crate::harness::Worker;
use crate::transaction::{Transaction, TransactionDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoadPattern {
    Sequential,
    Random,
}

/// Which family of operations the workload drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OpPath {
    Single,
    Transactional,
    Batch,
}

impl OpPath {
    /// `self` if the backend supports it, otherwise [`OpPath::Single`].
    pub fn resolve(self, caps: Capabilities) -> OpPath {
        match self {
            OpPath::Transactional if caps.transactional => self,
            OpPath::Batch if caps.batch => self,
            _ => OpPath::Single,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub table: String,
    pub record_count: u64,
    pub load_pattern: LoadPattern,
    /// Records per transaction or per batch call.
    pub chunk_size: usize,
    pub path: OpPath,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyStats {
    pub inserted: u64,
    pub verified: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl VerifyStats {
    pub fn merge(&mut self, other: &VerifyStats) {
        self.inserted += other.inserted;
        self.verified += other.verified;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

impl std::fmt::Display for VerifyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Inserted: {}", self.inserted)?;
        writeln!(f, "Verified reads: {}", self.verified)?;
        writeln!(f, "Updated: {}", self.updated)?;
        write!(f, "Deleted: {}", self.deleted)
    }
}

#[derive(Debug, Clone, Copy)]
enum Write {
    Insert,
    Update,
    Delete,
}

fn value_for(key: &str, round: u32) -> String {
    serde_json::json!({ "key": key, "round": round }).to_string()
}

fn fields_for(key: &str, round: u32) -> FieldMap {
    FieldMap::from([(VALUE_FIELD.to_string(), value_for(key, round).into_bytes())])
}

pub struct VerifyWorker {
    config: VerifyConfig,
}

impl VerifyWorker {
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            config: VerifyConfig {
                chunk_size: config.chunk_size.max(1),
                ..config
            },
        }
    }

    fn keys_for(&self, ctx: &WorkerContext) -> Vec<String> {
        let threads = ctx.thread_count() as u64;
        let id = ctx.thread_id() as u64;
        let mut keys: Vec<String> = (0..self.config.record_count)
            .filter(|i| i % threads == id)
            .map(|i| format!("user{}", i))
            .collect();
        if self.config.load_pattern == LoadPattern::Random {
            keys.shuffle(&mut rand::thread_rng());
        }
        keys
    }

    async fn write(&self, db: &dyn Db, ctx: &mut WorkerContext, keys: &[String], op: Write, round: u32) -> Result<()> {
        let table = self.config.table.as_str();
        match self.config.path {
            OpPath::Single => {
                for key in keys {
                    match op {
                        Write::Insert => db.insert(ctx, table, key, &value_for(key, round)).await?,
                        Write::Update => db.update(ctx, table, key, &value_for(key, round)).await?,
                        Write::Delete => db.delete(ctx, table, key).await?,
                    }
                }
            }
            OpPath::Transactional => {
                let tdb = transactional(db)?;
                for chunk in keys.chunks(self.config.chunk_size) {
                    let txn = tdb.new_transaction();
                    txn.start().await?;
                    if let Err(e) = write_in_txn(txn.as_ref(), ctx, table, chunk, op, round).await {
                        if let Err(abort) = txn.abort().await {
                            tracing::warn!(error = %abort, "abort after failed write also failed");
                        }
                        return Err(e.into());
                    }
                    txn.commit().await?;
                }
            }
            OpPath::Batch => {
                let bdb = batch(db)?;
                for chunk in keys.chunks(self.config.chunk_size) {
                    let values: Vec<FieldMap> = chunk.iter().map(|k| fields_for(k, round)).collect();
                    match op {
                        Write::Insert => bdb.batch_insert(ctx, table, chunk, &values).await?,
                        Write::Update => bdb.batch_update(ctx, table, chunk, &values).await?,
                        Write::Delete => bdb.batch_delete(ctx, table, chunk).await?,
                    }
                }
            }
        }
        Ok(())
    }

    /// Check every key holds the value of `round`, or is absent for `None`.
    async fn check(&self, db: &dyn Db, ctx: &mut WorkerContext, keys: &[String], round: Option<u32>) -> Result<u64> {
        let table = self.config.table.as_str();
        if self.config.path == OpPath::Batch {
            let bdb = batch(db)?;
            for chunk in keys.chunks(self.config.chunk_size) {
                let got = bdb.batch_read(ctx, table, chunk, None).await?;
                ensure!(got.len() == chunk.len(), "batch read returned {} of {} records", got.len(), chunk.len());
                for (key, record) in chunk.iter().zip(got) {
                    let expected = round.map(|r| fields_for(key, r));
                    ensure!(record == expected, "unexpected record for {}", key);
                }
            }
        } else {
            for key in keys {
                match (db.read(ctx, table, key).await, round) {
                    (Ok(value), Some(r)) => {
                        ensure!(value == value_for(key, r), "stale value for {}: {}", key, value)
                    }
                    (Err(DbError::NotFound { .. }), None) => {}
                    (Ok(_), None) => bail!("{} still readable after delete", key),
                    (Err(e), _) => return Err(e).with_context(|| format!("reading {}", key)),
                }
            }
        }
        Ok(keys.len() as u64)
    }
}

fn transactional(db: &dyn Db) -> Result<&dyn TransactionDb> {
    db.as_transaction_db()
        .ok_or_else(|| anyhow!("{} does not support transactions", db.name()))
}

fn batch(db: &dyn Db) -> Result<&dyn BatchDb> {
    db.as_batch_db()
        .ok_or_else(|| anyhow!("{} does not support batch operations", db.name()))
}

async fn write_in_txn(
    txn: &dyn Transaction,
    ctx: &mut WorkerContext,
    table: &str,
    keys: &[String],
    op: Write,
    round: u32,
) -> Result<(), DbError> {
    for key in keys {
        match op {
            Write::Insert => txn.insert(ctx, table, key, &value_for(key, round)).await?,
            Write::Update => txn.update(ctx, table, key, &value_for(key, round)).await?,
            Write::Delete => txn.delete(ctx, table, key).await?,
        }
    }
    Ok(())
}

#[async_trait]
impl Worker for VerifyWorker {
    type Output = VerifyStats;

    async fn run(&self, db: &dyn Db, ctx: &mut WorkerContext) -> Result<VerifyStats> {
        let keys = self.keys_for(ctx);
        let mut stats = VerifyStats::default();

        self.write(db, ctx, &keys, Write::Insert, 0).await.context("insert phase")?;
        stats.inserted = keys.len() as u64;
        stats.verified += self.check(db, ctx, &keys, Some(0)).await.context("verify inserts")?;

        self.write(db, ctx, &keys, Write::Update, 1).await.context("update phase")?;
        stats.updated = keys.len() as u64;
        stats.verified += self.check(db, ctx, &keys, Some(1)).await.context("verify updates")?;

        self.write(db, ctx, &keys, Write::Delete, 1).await.context("delete phase")?;
        stats.deleted = keys.len() as u64;
        stats.verified += self.check(db, ctx, &keys, None).await.context("verify deletes")?;

        Ok(stats)
    }
}
