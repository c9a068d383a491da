//! Explicit call contexts threaded through every database operation.
//!
//! A [`CallContext`] carries the cancellation signal and optional deadline
//! of a whole benchmark run. [`WorkerContext`] adds the identity of one
//! worker plus whatever per-worker state a backend attached in
//! [`Db::init_thread`](crate::db::Db::init_thread).

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{DbError, DbResult};

/// Cancellation and deadline shared by every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails fast if the context is already cancelled or expired.
    pub fn check(&self) -> DbResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DbError::Timeout),
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn guard<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(DbError::Cancelled),
                    res = tokio::time::timeout_at(deadline, fut) => {
                        res.unwrap_or(Err(DbError::Timeout))
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(DbError::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}

/// Execution context owned by exactly one worker between `init_thread` and
/// `cleanup_thread`.
///
/// Not `Clone`. Data operations borrow it mutably, so only one worker can
/// drive it at a time.
pub struct WorkerContext {
    call: CallContext,
    thread_id: usize,
    thread_count: usize,
    state: Option<Box<dyn Any + Send + Sync>>,
}

impl WorkerContext {
    /// Fails with a validation error unless `thread_id < thread_count`.
    pub fn new(call: CallContext, thread_id: usize, thread_count: usize) -> DbResult<Self> {
        if thread_id >= thread_count {
            return Err(DbError::Validation(format!(
                "thread id {} out of range for {} workers",
                thread_id, thread_count
            )));
        }
        Ok(Self {
            call,
            thread_id,
            thread_count,
            state: None,
        })
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn call(&self) -> &CallContext {
        &self.call
    }

    pub fn check(&self) -> DbResult<()> {
        self.call.check()
    }

    pub async fn guard<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        self.call.guard(fut).await
    }

    /// Attach backend-specific per-worker state, replacing any previous value.
    pub fn set_state<T: Any + Send + Sync>(&mut self, state: T) {
        self.state = Some(Box::new(state));
    }

    pub fn state_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.state.as_mut().and_then(|s| s.downcast_mut::<T>())
    }

    pub fn take_state<T: Any + Send + Sync>(&mut self) -> Option<T> {
        match self.state.take()?.downcast::<T>() {
            Ok(state) => Some(*state),
            Err(other) => {
                self.state = Some(other);
                None
            }
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("thread_id", &self.thread_id)
            .field("thread_count", &self.thread_count)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_must_be_in_range() {
        let ctx = WorkerContext::new(CallContext::new(), 2, 5).unwrap();
        assert_eq!((ctx.thread_id(), ctx.thread_count()), (2, 5));

        assert!(matches!(
            WorkerContext::new(CallContext::new(), 5, 5),
            Err(DbError::Validation(_))
        ));
        assert!(WorkerContext::new(CallContext::new(), 0, 0).is_err());
    }

    #[test]
    fn state_slot_is_typed() {
        let mut ctx = WorkerContext::new(CallContext::new(), 0, 1).unwrap();
        ctx.set_state(41u64);
        *ctx.state_mut::<u64>().unwrap() += 1;
        assert!(ctx.state_mut::<String>().is_none());
        assert!(ctx.take_state::<String>().is_none());
        assert_eq!(ctx.take_state::<u64>(), Some(42));
        assert!(ctx.take_state::<u64>().is_none());
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let call = CallContext::new();
        call.cancel();
        assert!(matches!(call.check(), Err(DbError::Cancelled)));
        let res = call.guard(async { Ok::<_, DbError>(1) }).await;
        assert!(matches!(res, Err(DbError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_turns_hang_into_timeout() {
        let call = CallContext::new().with_timeout(Duration::from_millis(20));
        let res = call
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DbError>(())
            })
            .await;
        assert!(matches!(res, Err(DbError::Timeout)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_work() {
        let call = CallContext::new();
        let token = call.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let res = call
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DbError>(())
            })
            .await;
        assert!(matches!(res, Err(DbError::Cancelled)));
    }
}
