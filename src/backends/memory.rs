//! In-process reference backend.
//!
//! Supports every capability. Batches are all-or-nothing: every element is
//! checked under one write lock before anything is applied. Insert on an
//! existing key fails with [`DbError::Duplicate`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::batch::{project, validate_batch, BatchDb, BatchOutcome, FieldMap};
use crate::codec;
use crate::config::DbConfig;
use crate::context::{CallContext, WorkerContext};
use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::transaction::{CommitTarget, StagedTransaction, Transaction, TransactionDb, WriteSet};

pub const NAME: &str = "memory";

#[derive(Default)]
struct Store {
    records: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl Store {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CommitTarget for Store {
    fn name(&self) -> &str {
        NAME
    }

    async fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn apply(&self, set: WriteSet) -> DbResult<()> {
        self.ensure_open()?;
        let mut records = self.records.write().await;
        if let Some(key) = set.first_stale(|key| Ok(records.get(key).cloned()))? {
            return Err(DbError::Conflict(format!(
                "key {} changed since it was read",
                String::from_utf8_lossy(key)
            )));
        }
        for (key, value) in set.writes() {
            match value {
                Some(value) => records.insert(key.to_vec(), value.to_vec()),
                None => records.remove(key),
            };
        }
        Ok(())
    }
}

/// Operation counters kept in each worker's context.
#[derive(Debug, Default)]
struct WorkerStats {
    ops: u64,
    failures: u64,
}

fn tally<T>(ctx: &mut WorkerContext, res: &DbResult<T>) {
    if let Some(stats) = ctx.state_mut::<WorkerStats>() {
        stats.ops += 1;
        if res.is_err() {
            stats.failures += 1;
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryDb {
    store: Arc<Store>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(_config: &DbConfig) -> DbResult<Arc<dyn Db>> {
        Ok(Arc::new(Self::new()))
    }

    /// Number of stored records across all tables.
    pub async fn len(&self) -> usize {
        self.store.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn do_read(&self, ctx: &WorkerContext, table: &str, key: &str) -> DbResult<String> {
        self.store.ensure_open()?;
        ctx.check()?;
        let rkey = codec::record_key(table, key)?;
        match self.store.records.read().await.get(&rkey) {
            Some(bytes) => codec::decode_value(bytes),
            None => Err(DbError::not_found(table, key)),
        }
    }

    async fn do_update(&self, ctx: &WorkerContext, table: &str, key: &str, value: &str) -> DbResult<()> {
        self.store.ensure_open()?;
        ctx.check()?;
        let rkey = codec::record_key(table, key)?;
        let encoded = codec::encode_value(value)?;
        match self.store.records.write().await.get_mut(&rkey) {
            Some(slot) => {
                *slot = encoded;
                Ok(())
            }
            None => Err(DbError::not_found(table, key)),
        }
    }

    async fn do_insert(&self, ctx: &WorkerContext, table: &str, key: &str, value: &str) -> DbResult<()> {
        self.store.ensure_open()?;
        ctx.check()?;
        let rkey = codec::record_key(table, key)?;
        let encoded = codec::encode_value(value)?;
        let mut records = self.store.records.write().await;
        if records.contains_key(&rkey) {
            return Err(DbError::duplicate(table, key));
        }
        records.insert(rkey, encoded);
        Ok(())
    }

    async fn do_delete(&self, ctx: &WorkerContext, table: &str, key: &str) -> DbResult<()> {
        self.store.ensure_open()?;
        ctx.check()?;
        let rkey = codec::record_key(table, key)?;
        match self.store.records.write().await.remove(&rkey) {
            Some(_) => Ok(()),
            None => Err(DbError::not_found(table, key)),
        }
    }
}

#[async_trait]
impl Db for MemoryDb {
    fn name(&self) -> &str {
        NAME
    }

    async fn close(&self) -> DbResult<()> {
        if !self.store.closed.swap(true, Ordering::AcqRel) {
            let mut records = self.store.records.write().await;
            tracing::debug!(records = records.len(), "closing memory backend");
            records.clear();
        }
        Ok(())
    }

    async fn init_thread(
        &self,
        ctx: &CallContext,
        thread_id: usize,
        thread_count: usize,
    ) -> DbResult<WorkerContext> {
        let mut worker = WorkerContext::new(ctx.clone(), thread_id, thread_count)?;
        worker.set_state(WorkerStats::default());
        Ok(worker)
    }

    async fn cleanup_thread(&self, mut ctx: WorkerContext) {
        if let Some(stats) = ctx.take_state::<WorkerStats>() {
            tracing::debug!(
                thread_id = ctx.thread_id(),
                ops = stats.ops,
                failures = stats.failures,
                "memory worker finished"
            );
        }
    }

    async fn read(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<String> {
        let res = self.do_read(ctx, table, key).await;
        tally(ctx, &res);
        res
    }

    async fn update(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()> {
        let res = self.do_update(ctx, table, key, value).await;
        tally(ctx, &res);
        res
    }

    async fn insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()> {
        let res = self.do_insert(ctx, table, key, value).await;
        tally(ctx, &res);
        res
    }

    async fn delete(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<()> {
        let res = self.do_delete(ctx, table, key).await;
        tally(ctx, &res);
        res
    }

    fn as_transaction_db(&self) -> Option<&dyn TransactionDb> {
        Some(self)
    }

    fn as_batch_db(&self) -> Option<&dyn BatchDb> {
        Some(self)
    }
}

impl TransactionDb for MemoryDb {
    fn new_transaction(&self) -> Box<dyn Transaction> {
        Box::new(StagedTransaction::new(self.store.clone()))
    }
}

fn record_keys(table: &str, keys: &[String]) -> DbResult<Vec<Vec<u8>>> {
    keys.iter().map(|key| codec::record_key(table, key)).collect()
}

#[async_trait]
impl BatchDb for MemoryDb {
    async fn batch_insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        values: &[FieldMap],
    ) -> DbResult<()> {
        validate_batch(keys, Some(values))?;
        self.store.ensure_open()?;
        ctx.check()?;
        let rkeys = record_keys(table, keys)?;
        let encoded = values
            .iter()
            .map(codec::encode_record)
            .collect::<DbResult<Vec<_>>>()?;

        let mut records = self.store.records.write().await;
        let mut outcome = BatchOutcome::new(keys.len());
        let mut seen = HashSet::new();
        for (i, rkey) in rkeys.iter().enumerate() {
            if records.contains_key(rkey) || !seen.insert(rkey) {
                outcome.fail(i, DbError::duplicate(table, &keys[i]));
            }
        }
        outcome.into_result()?;
        records.extend(rkeys.into_iter().zip(encoded));
        Ok(())
    }

    async fn batch_read(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        fields: Option<&[String]>,
    ) -> DbResult<Vec<Option<FieldMap>>> {
        self.store.ensure_open()?;
        ctx.check()?;
        let rkeys = record_keys(table, keys)?;
        let records = self.store.records.read().await;
        rkeys
            .iter()
            .map(|rkey| match records.get(rkey) {
                Some(bytes) => Ok(Some(project(codec::decode_record(bytes)?, fields))),
                None => Ok(None),
            })
            .collect()
    }

    async fn batch_update(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        values: &[FieldMap],
    ) -> DbResult<()> {
        validate_batch(keys, Some(values))?;
        self.store.ensure_open()?;
        ctx.check()?;
        let rkeys = record_keys(table, keys)?;

        let mut records = self.store.records.write().await;
        let mut outcome = BatchOutcome::new(keys.len());
        let mut merged: BTreeMap<Vec<u8>, FieldMap> = BTreeMap::new();
        for (i, (rkey, update)) in rkeys.into_iter().zip(values).enumerate() {
            let current = match merged.remove(&rkey) {
                Some(record) => record,
                None => match records.get(&rkey) {
                    Some(bytes) => codec::decode_record(bytes)?,
                    None => {
                        outcome.fail(i, DbError::not_found(table, &keys[i]));
                        continue;
                    }
                },
            };
            let mut record = current;
            record.extend(update.iter().map(|(f, v)| (f.clone(), v.clone())));
            merged.insert(rkey, record);
        }
        outcome.into_result()?;
        for (rkey, record) in merged {
            records.insert(rkey, codec::encode_record(&record)?);
        }
        Ok(())
    }

    async fn batch_delete(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
    ) -> DbResult<()> {
        self.store.ensure_open()?;
        ctx.check()?;
        let rkeys = record_keys(table, keys)?;

        let mut records = self.store.records.write().await;
        let mut outcome = BatchOutcome::new(keys.len());
        let mut seen = HashSet::new();
        for (i, rkey) in rkeys.iter().enumerate() {
            if !records.contains_key(rkey) || !seen.insert(rkey) {
                outcome.fail(i, DbError::not_found(table, &keys[i]));
            }
        }
        outcome.into_result()?;
        for rkey in &rkeys {
            records.remove(rkey);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "usertable";

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn worker(db: &MemoryDb) -> WorkerContext {
        db.init_thread(&CallContext::new(), 0, 1).await.unwrap()
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;

        db.insert(&mut ctx, TABLE, "user1", "v1").await.unwrap();
        assert_eq!(db.read(&mut ctx, TABLE, "user1").await.unwrap(), "v1");
        db.update(&mut ctx, TABLE, "user1", "v2").await.unwrap();
        assert_eq!(db.read(&mut ctx, TABLE, "user1").await.unwrap(), "v2");
        db.delete(&mut ctx, TABLE, "user1").await.unwrap();
        assert!(db.read(&mut ctx, TABLE, "user1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_is_not_upsert_and_insert_detects_duplicates() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;

        assert!(db.update(&mut ctx, TABLE, "nope", "v").await.unwrap_err().is_not_found());
        assert!(db.delete(&mut ctx, TABLE, "nope").await.unwrap_err().is_not_found());
        assert!(db.is_empty().await);

        db.insert(&mut ctx, TABLE, "k", "first").await.unwrap();
        assert!(matches!(
            db.insert(&mut ctx, TABLE, "k", "second").await,
            Err(DbError::Duplicate { .. })
        ));
        assert_eq!(db.read(&mut ctx, TABLE, "k").await.unwrap(), "first");
    }

    #[tokio::test]
    async fn tables_are_isolated() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        db.insert(&mut ctx, "a", "k", "in-a").await.unwrap();
        assert!(db.read(&mut ctx, "b", "k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn worker_stats_count_failures() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        let _ = db.read(&mut ctx, TABLE, "missing").await;
        db.insert(&mut ctx, TABLE, "k", "v").await.unwrap();
        let stats = ctx.state_mut::<WorkerStats>().unwrap();
        assert_eq!((stats.ops, stats.failures), (2, 1));
        db.cleanup_thread(ctx).await;
    }

    #[tokio::test]
    async fn closed_backend_rejects_operations() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        db.insert(&mut ctx, TABLE, "k", "v").await.unwrap();
        db.close().await.unwrap();
        db.close().await.unwrap();
        assert!(matches!(db.read(&mut ctx, TABLE, "k").await, Err(DbError::Closed)));
    }

    #[tokio::test]
    async fn batch_insert_rejects_whole_batch_on_duplicate() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        db.insert(&mut ctx, TABLE, "k2", "old").await.unwrap();

        let err = db
            .batch_insert(
                &mut ctx,
                TABLE,
                &keys(&["k1", "k2", "k3"]),
                &[fields(&[("f", "1")]), fields(&[("f", "2")]), fields(&[("f", "3")])],
            )
            .await
            .unwrap_err();
        match err {
            DbError::Batch(failure) => {
                assert_eq!(failure.failures.len(), 1);
                assert_eq!(failure.failures[0].0, 1);
                assert_eq!(failure.applied, 0);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(db.read(&mut ctx, TABLE, "k1").await.unwrap_err().is_not_found());
        assert_eq!(db.len().await, 1);
    }

    #[tokio::test]
    async fn batch_insert_flags_repeated_keys() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        let err = db
            .batch_insert(
                &mut ctx,
                TABLE,
                &keys(&["k", "k"]),
                &[fields(&[("f", "1")]), fields(&[("f", "2")])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Batch(ref f) if f.failures[0].0 == 1));
        assert!(db.is_empty().await);
    }

    #[tokio::test]
    async fn batch_update_merges_fields() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        let ks = keys(&["k1"]);
        db.batch_insert(&mut ctx, TABLE, &ks, &[fields(&[("a", "1"), ("b", "2")])])
            .await
            .unwrap();
        db.batch_update(&mut ctx, TABLE, &ks, &[fields(&[("b", "3"), ("c", "4")])])
            .await
            .unwrap();

        let got = db.batch_read(&mut ctx, TABLE, &ks, None).await.unwrap();
        assert_eq!(got, vec![Some(fields(&[("a", "1"), ("b", "3"), ("c", "4")]))]);

        let err = db
            .batch_update(&mut ctx, TABLE, &keys(&["k1", "ghost"]), &[fields(&[("a", "x")]), fields(&[])])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Batch(_)));
        let got = db.batch_read(&mut ctx, TABLE, &ks, Some(&keys(&["a"])[..])).await.unwrap();
        assert_eq!(got, vec![Some(fields(&[("a", "1")]))]);
    }

    #[tokio::test]
    async fn batch_delete_is_all_or_nothing() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        db.insert(&mut ctx, TABLE, "k1", "v").await.unwrap();

        assert!(db.batch_delete(&mut ctx, TABLE, &keys(&["k1", "k2"])).await.is_err());
        assert_eq!(db.read(&mut ctx, TABLE, "k1").await.unwrap(), "v");

        db.batch_delete(&mut ctx, TABLE, &keys(&["k1"])).await.unwrap();
        assert!(db.is_empty().await);
    }

    #[tokio::test]
    async fn commit_conflict_applies_nothing() {
        let db = MemoryDb::new();
        let mut ctx = worker(&db).await;
        db.insert(&mut ctx, TABLE, "k", "v0").await.unwrap();

        let txn = db.new_transaction();
        txn.start().await.unwrap();
        assert_eq!(txn.read(&mut ctx, TABLE, "k").await.unwrap(), "v0");
        txn.insert(&mut ctx, TABLE, "other", "x").await.unwrap();
        txn.update(&mut ctx, TABLE, "k", "from-txn").await.unwrap();

        // a concurrent writer changes the key the transaction read
        db.update(&mut ctx, TABLE, "k", "outside").await.unwrap();

        assert!(matches!(txn.commit().await, Err(DbError::Conflict(_))));
        assert_eq!(txn.state().await, crate::transaction::TxnState::Aborted);
        assert_eq!(db.read(&mut ctx, TABLE, "k").await.unwrap(), "outside");
        assert!(db.read(&mut ctx, TABLE, "other").await.unwrap_err().is_not_found());
    }
}
