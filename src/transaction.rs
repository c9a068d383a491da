//! Transactional extension of the [`Db`] contract.
//!
//! Backends opt in by implementing [`TransactionDb`]. The built-in backends
//! share [`StagedTransaction`]: writes are buffered in a private
//! [`WriteSet`] while the transaction is active, and on commit the backend
//! re-checks every key the transaction observed and applies all writes in
//! one atomic step.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::codec;
use crate::context::WorkerContext;
use crate::db::Db;
use crate::error::{DbError, DbResult};

/// Lifecycle of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Uninitialized,
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    pub fn require_active(self, op: &'static str) -> DbResult<()> {
        match self {
            Self::Active => Ok(()),
            state => Err(DbError::State { op, state }),
        }
    }

    /// Uninitialized -> Active.
    pub fn start(&mut self) -> DbResult<()> {
        match *self {
            Self::Uninitialized => {
                *self = Self::Active;
                Ok(())
            }
            state => Err(DbError::State { op: "start", state }),
        }
    }

    /// Active -> `outcome`, which must be a terminal state.
    pub fn finish(&mut self, op: &'static str, outcome: TxnState) -> DbResult<()> {
        debug_assert!(outcome.is_terminated());
        self.require_active(op)?;
        *self = outcome;
        Ok(())
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A backend that can hand out independent transaction handles.
pub trait TransactionDb: Db {
    /// A fresh handle in [`TxnState::Uninitialized`] sharing no transaction
    /// state with `self` or any other handle.
    fn new_transaction(&self) -> Box<dyn Transaction>;
}

/// One transaction. Data operations are only accepted while active, and a
/// terminated handle accepts nothing further.
///
/// A handle belongs to a single worker.
#[async_trait]
pub trait Transaction: Db {
    async fn state(&self) -> TxnState;

    async fn start(&self) -> DbResult<()>;

    /// Make every write of the transaction visible at once, or fail with
    /// none of them visible.
    async fn commit(&self) -> DbResult<()>;

    /// Discard every write of the transaction.
    async fn abort(&self) -> DbResult<()>;
}

/// Reads observed and writes buffered by an active transaction, keyed by
/// encoded record key. A `None` value means "absent" / "deleted".
#[derive(Debug, Default)]
pub struct WriteSet {
    reads: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteSet {
    /// `Some(..)` if this transaction already wrote `key`.
    pub fn staged(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.writes.get(key).map(|v| v.as_deref())
    }

    /// Remember the committed value first seen for `key`.
    pub fn observe(&mut self, key: &[u8], value: Option<&[u8]>) {
        if !self.writes.contains_key(key) && !self.reads.contains_key(key) {
            self.reads.insert(key.to_vec(), value.map(<[u8]>::to_vec));
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn reads(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.reads.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    pub fn writes(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.writes.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// First read whose committed value differs from `current(key)`.
    pub fn first_stale<'a, F>(&'a self, mut current: F) -> DbResult<Option<&'a [u8]>>
    where
        F: FnMut(&[u8]) -> DbResult<Option<Vec<u8>>>,
    {
        for (key, seen) in self.reads() {
            if current(key)?.as_deref() != seen {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}

/// Storage a [`StagedTransaction`] reads from and commits into.
#[async_trait]
pub trait CommitTarget: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Committed value of an encoded record key.
    async fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    /// Atomically verify that every read in `set` still holds and apply
    /// every write, or fail with [`DbError::Conflict`] applying nothing.
    async fn apply(&self, set: WriteSet) -> DbResult<()>;
}

#[async_trait]
impl<T: CommitTarget> CommitTarget for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn apply(&self, set: WriteSet) -> DbResult<()> {
        (**self).apply(set).await
    }
}

struct Staged {
    state: TxnState,
    set: WriteSet,
}

/// Optimistic transaction handle over any [`CommitTarget`].
pub struct StagedTransaction<T: CommitTarget> {
    target: T,
    inner: Mutex<Staged>,
}

impl<T: CommitTarget> StagedTransaction<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            inner: Mutex::new(Staged {
                state: TxnState::Uninitialized,
                set: WriteSet::default(),
            }),
        }
    }

    /// Value as seen by this transaction: its own writes first, then the
    /// committed value, which gets recorded for commit-time validation.
    async fn visible(
        &self,
        ctx: &WorkerContext,
        staged: &mut Staged,
        key: &[u8],
    ) -> DbResult<Option<Vec<u8>>> {
        if let Some(value) = staged.set.staged(key) {
            return Ok(value.map(<[u8]>::to_vec));
        }
        let value = ctx.guard(self.target.get(key)).await?;
        staged.set.observe(key, value.as_deref());
        Ok(value)
    }
}

#[async_trait]
impl<T: CommitTarget> Db for StagedTransaction<T> {
    fn name(&self) -> &str {
        self.target.name()
    }

    async fn close(&self) -> DbResult<()> {
        let mut staged = self.inner.lock().await;
        if staged.state == TxnState::Active {
            staged.set = WriteSet::default();
            staged.state = TxnState::Aborted;
        }
        Ok(())
    }

    async fn read(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<String> {
        ctx.check()?;
        let mut staged = self.inner.lock().await;
        staged.state.require_active("read")?;
        let rkey = codec::record_key(table, key)?;
        match self.visible(ctx, &mut staged, &rkey).await? {
            Some(bytes) => codec::decode_value(&bytes),
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
        ctx.check()?;
        let mut staged = self.inner.lock().await;
        staged.state.require_active("update")?;
        let rkey = codec::record_key(table, key)?;
        if self.visible(ctx, &mut staged, &rkey).await?.is_none() {
            return Err(DbError::not_found(table, key));
        }
        staged.set.put(rkey, codec::encode_value(value)?);
        Ok(())
    }

    async fn insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        key: &str,
        value: &str,
    ) -> DbResult<()> {
        ctx.check()?;
        let mut staged = self.inner.lock().await;
        staged.state.require_active("insert")?;
        let rkey = codec::record_key(table, key)?;
        if self.visible(ctx, &mut staged, &rkey).await?.is_some() {
            return Err(DbError::duplicate(table, key));
        }
        staged.set.put(rkey, codec::encode_value(value)?);
        Ok(())
    }

    async fn delete(&self, ctx: &mut WorkerContext, table: &str, key: &str) -> DbResult<()> {
        ctx.check()?;
        let mut staged = self.inner.lock().await;
        staged.state.require_active("delete")?;
        let rkey = codec::record_key(table, key)?;
        if self.visible(ctx, &mut staged, &rkey).await?.is_none() {
            return Err(DbError::not_found(table, key));
        }
        staged.set.delete(rkey);
        Ok(())
    }
}

#[async_trait]
impl<T: CommitTarget> Transaction for StagedTransaction<T> {
    async fn state(&self) -> TxnState {
        self.inner.lock().await.state
    }

    async fn start(&self) -> DbResult<()> {
        self.inner.lock().await.state.start()
    }

    async fn commit(&self) -> DbResult<()> {
        let mut staged = self.inner.lock().await;
        staged.state.require_active("commit")?;
        let set = std::mem::take(&mut staged.set);
        let writes = set.write_count();
        match self.target.apply(set).await {
            Ok(()) => {
                staged.state.finish("commit", TxnState::Committed)?;
                tracing::trace!(backend = self.target.name(), writes, "transaction committed");
                Ok(())
            }
            Err(err) => {
                staged.state.finish("commit", TxnState::Aborted)?;
                tracing::debug!(backend = self.target.name(), error = %err, "transaction commit failed");
                Err(err)
            }
        }
    }

    async fn abort(&self) -> DbResult<()> {
        let mut staged = self.inner.lock().await;
        staged.state.finish("abort", TxnState::Aborted)?;
        staged.set = WriteSet::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let mut state = TxnState::Uninitialized;
        assert!(matches!(
            state.finish("commit", TxnState::Committed),
            Err(DbError::State { op: "commit", state: TxnState::Uninitialized })
        ));
        state.start().unwrap();
        assert!(state.start().is_err());
        state.finish("commit", TxnState::Committed).unwrap();
        assert!(state.is_terminated());
        assert!(state.start().is_err());
        assert!(state.finish("abort", TxnState::Aborted).is_err());
        assert!(state.require_active("read").is_err());
    }

    #[test]
    fn write_set_tracks_first_observation_only() {
        let mut set = WriteSet::default();
        set.observe(b"a", Some(b"1"));
        set.observe(b"a", Some(b"2"));
        set.put(b"b".to_vec(), b"x".to_vec());
        // already written by this transaction, nothing to validate
        set.observe(b"b", None);
        set.delete(b"c".to_vec());

        let reads: Vec<_> = set.reads().collect();
        assert_eq!(reads, vec![(&b"a"[..], Some(&b"1"[..]))]);
        assert_eq!(set.staged(b"b"), Some(Some(&b"x"[..])));
        assert_eq!(set.staged(b"c"), Some(None));
        assert_eq!(set.staged(b"a"), None);
        assert_eq!(set.write_count(), 2);
    }

    #[test]
    fn stale_reads_are_detected() {
        let mut set = WriteSet::default();
        set.observe(b"a", Some(b"1"));
        set.observe(b"gone", None);

        let unchanged = set
            .first_stale(|key| Ok(if key == b"a" { Some(b"1".to_vec()) } else { None }))
            .unwrap();
        assert_eq!(unchanged, None);

        let changed = set
            .first_stale(|key| Ok(if key == b"gone" { Some(b"new".to_vec()) } else { Some(b"1".to_vec()) }))
            .unwrap();
        assert_eq!(changed, Some(&b"gone"[..]));
    }
}
