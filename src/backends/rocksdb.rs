//! RocksDB backend on top of a `TransactionDB`.
//!
//! Every write runs in a RocksDB transaction that locks the keys it checks
//! with `get_for_update`, so existence checks and writes are atomic with
//! respect to other workers. Batches are all-or-nothing.
//!
//! Parameters: `rocksdb.dir`, `rocksdb.drop_data`, `rocksdb.sync`,
//! `rocksdb.parallelism`, `rocksdb.write_buffer_size`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    DBCompactionStyle, DBCompressionType, ErrorKind, LogLevel, Options as RocksDBOptions,
    ReadOptions, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};

use super::data_dir::DataDir;
use crate::batch::{project, validate_batch, BatchDb, BatchOutcome, FieldMap};
use crate::codec;
use crate::config::DbConfig;
use crate::context::WorkerContext;
use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::transaction::{self, CommitTarget, StagedTransaction, TransactionDb, WriteSet};

pub const NAME: &str = "rocksdb";

const DEFAULT_DB_PATH: &str = "rocksdb_benchmark";

fn rocks_err(err: rocksdb::Error) -> DbError {
    match err.kind() {
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut => {
            DbError::Conflict(err.to_string())
        }
        _ => DbError::backend(err),
    }
}

struct Shared {
    db: TransactionDB,
    sync: bool,
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

    fn get_transaction(&self) -> Transaction<'_, TransactionDB> {
        // Set the transaction options
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_snapshot(true);

        // Set the write options
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync);

        self.db.transaction_opt(&write_opts, &txn_opts)
    }

    fn read_opts() -> ReadOptions {
        let mut read_opts = ReadOptions::default();
        read_opts.set_async_io(true);
        read_opts.fill_cache(true);
        read_opts
    }

    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.db
            .get_opt(key, &Self::read_opts())
            .map_err(rocks_err)
    }
}

#[async_trait]
impl CommitTarget for Shared {
    fn name(&self) -> &str {
        NAME
    }

    async fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Shared::get(self, key)
    }

    async fn apply(&self, set: WriteSet) -> DbResult<()> {
        self.ensure_open()?;
        let txn = self.get_transaction();
        let stale = set.first_stale(|key| txn.get_for_update(key, true).map_err(rocks_err))?;
        if let Some(key) = stale {
            return Err(DbError::Conflict(format!(
                "key {} changed since it was read",
                String::from_utf8_lossy(key)
            )));
        }
        for (key, value) in set.writes() {
            match value {
                Some(value) => txn.put(key, value).map_err(rocks_err)?,
                None => txn.delete(key).map_err(rocks_err)?,
            }
        }
        txn.commit().map_err(rocks_err)
    }
}

pub struct RocksDb {
    shared: Arc<Shared>,
}

impl RocksDb {
    pub fn open(config: &DbConfig) -> DbResult<Self> {
        let db_path = PathBuf::from(config.get_or("rocksdb.dir", DEFAULT_DB_PATH));
        let drop_data = config.parse_or("rocksdb.drop_data", true)?;
        let sync = config.parse_or("rocksdb.sync", false)?;
        let parallelism = config.parse_or("rocksdb.parallelism", 8i32)?;
        let write_buffer_size = config.parse_or("rocksdb.write_buffer_size", 256 * 1024 * 1024usize)?;

        let dir = DataDir::prepare(db_path, drop_data)?;

        let mut opts = RocksDBOptions::default();
        // Ensure we use fdatasync
        opts.set_use_fsync(false);
        // Only use warning log level
        opts.set_log_level(LogLevel::Error);
        // Set the number of log files to keep
        opts.set_keep_log_file_num(20);
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compaction_style(DBCompactionStyle::Level);
        // Increase the background thread count
        opts.increase_parallelism(parallelism);
        opts.set_max_write_buffer_number(32);
        // Set the amount of data to build up in memory
        opts.set_write_buffer_size(write_buffer_size);
        opts.set_target_file_size_base(512 * 1024 * 1024);
        opts.set_min_write_buffer_number_to_merge(4);
        // Use separate write thread queues
        opts.set_enable_pipelined_write(true);
        // Store 4KB values separate from keys
        opts.set_enable_blob_files(true);
        opts.set_min_blob_size(4 * 1024);
        opts.set_compression_per_level(&[
            DBCompressionType::None,
            DBCompressionType::None,
            DBCompressionType::Snappy,
            DBCompressionType::Snappy,
            DBCompressionType::Snappy,
        ]);

        let txn_db_opts = TransactionDBOptions::default();
        let db = TransactionDB::open(&opts, &txn_db_opts, dir.path()).map_err(rocks_err)?;
        tracing::info!(path = %dir.path().display(), sync, "opened rocksdb backend");

        Ok(Self {
            shared: Arc::new(Shared {
                db,
                sync,
                closed: AtomicBool::new(false),
                dir,
            }),
        })
    }

    pub fn create(config: &DbConfig) -> DbResult<Arc<dyn Db>> {
        Ok(Arc::new(Self::open(config)?))
    }

    fn begin(&self, ctx: &WorkerContext) -> DbResult<Transaction<'_, TransactionDB>> {
        self.shared.ensure_open()?;
        ctx.check()?;
        Ok(self.shared.get_transaction())
    }
}

#[async_trait]
impl Db for RocksDb {
    fn name(&self) -> &str {
        NAME
    }

    async fn close(&self) -> DbResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Persist the WAL and memtables; the handle itself is released on drop
        self.shared.db.flush_wal(true).map_err(rocks_err)?;
        self.shared.db.flush().map_err(rocks_err)?;
        tracing::info!(path = %self.shared.dir.path().display(), "closed rocksdb backend");
        Ok(())
    }

    async fn read(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<String> {
        self.shared.ensure_open()?;
        ctx.check()?;
        let rkey = codec::record_key(table, key)?;
        match self.shared.get(&rkey)? {
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
        let txn = self.begin(ctx)?;
        if txn.get_for_update(&rkey, true).map_err(rocks_err)?.is_none() {
            return Err(DbError::not_found(table, key));
        }
        txn.put(&rkey, codec::encode_value(value)?).map_err(rocks_err)?;
        txn.commit().map_err(rocks_err)
    }

    async fn insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()> {
        let rkey = codec::record_key(table, key)?;
        let txn = self.begin(ctx)?;
        if txn.get_for_update(&rkey, true).map_err(rocks_err)?.is_some() {
            return Err(DbError::duplicate(table, key));
        }
        txn.put(&rkey, codec::encode_value(value)?).map_err(rocks_err)?;
        txn.commit().map_err(rocks_err)
    }

    async fn delete(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<()> {
        let rkey = codec::record_key(table, key)?;
        let txn = self.begin(ctx)?;
        if txn.get_for_update(&rkey, true).map_err(rocks_err)?.is_none() {
            return Err(DbError::not_found(table, key));
        }
        txn.delete(&rkey).map_err(rocks_err)?;
        txn.commit().map_err(rocks_err)
    }

    fn as_transaction_db(&self) -> Option<&dyn TransactionDb> {
        Some(self)
    }

    fn as_batch_db(&self) -> Option<&dyn BatchDb> {
        Some(self)
    }
}

impl TransactionDb for RocksDb {
    fn new_transaction(&self) -> Box<dyn transaction::Transaction> {
        Box::new(StagedTransaction::new(self.shared.clone()))
    }
}

#[async_trait]
impl BatchDb for RocksDb {
    async fn batch_insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        values: &[FieldMap],
    ) -> DbResult<()> {
        validate_batch(keys, Some(values))?;
        let txn = self.begin(ctx)?;
        let mut outcome = BatchOutcome::new(keys.len());
        let mut seen = HashSet::new();
        let mut staged = Vec::with_capacity(keys.len());
        for (i, (key, fields)) in keys.iter().zip(values).enumerate() {
            let rkey = codec::record_key(table, key)?;
            let exists = txn.get_for_update(&rkey, true).map_err(rocks_err)?.is_some();
            if exists || !seen.insert(rkey.clone()) {
                outcome.fail(i, DbError::duplicate(table, key));
                continue;
            }
            staged.push((rkey, codec::encode_record(fields)?));
        }
        outcome.into_result()?;
        for (rkey, data) in staged {
            txn.put(rkey, data).map_err(rocks_err)?;
        }
        txn.commit().map_err(rocks_err)
    }

    async fn batch_read(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        fields: Option<&[String]>,
    ) -> DbResult<Vec<Option<FieldMap>>> {
        self.shared.ensure_open()?;
        ctx.check()?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let rkey = codec::record_key(table, key)?;
            let record = match self.shared.get(&rkey)? {
                Some(data) => Some(project(codec::decode_record(&data)?, fields)),
                None => None,
            };
            results.push(record);
        }
        Ok(results)
    }

    async fn batch_update(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        values: &[FieldMap],
    ) -> DbResult<()> {
        validate_batch(keys, Some(values))?;
        let txn = self.begin(ctx)?;
        let mut outcome = BatchOutcome::new(keys.len());
        let mut merged: BTreeMap<Vec<u8>, FieldMap> = BTreeMap::new();
        for (i, (key, update)) in keys.iter().zip(values).enumerate() {
            let rkey = codec::record_key(table, key)?;
            let mut record = match merged.remove(&rkey) {
                Some(record) => record,
                None => match txn.get_for_update(&rkey, true).map_err(rocks_err)? {
                    Some(data) => codec::decode_record(&data)?,
                    None => {
                        outcome.fail(i, DbError::not_found(table, key));
                        continue;
                    }
                },
            };
            record.extend(update.iter().map(|(f, v)| (f.clone(), v.clone())));
            merged.insert(rkey, record);
        }
        outcome.into_result()?;
        for (rkey, record) in merged {
            txn.put(rkey, codec::encode_record(&record)?).map_err(rocks_err)?;
        }
        txn.commit().map_err(rocks_err)
    }

    async fn batch_delete(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
    ) -> DbResult<()> {
        let txn = self.begin(ctx)?;
        let mut outcome = BatchOutcome::new(keys.len());
        let mut seen = HashSet::new();
        for (i, key) in keys.iter().enumerate() {
            let rkey = codec::record_key(table, key)?;
            let exists = txn.get_for_update(&rkey, true).map_err(rocks_err)?.is_some();
            if !exists || !seen.insert(rkey) {
                outcome.fail(i, DbError::not_found(table, key));
            }
        }
        outcome.into_result()?;
        for rkey in &seen {
            txn.delete(rkey).map_err(rocks_err)?;
        }
        txn.commit().map_err(rocks_err)
    }
}
