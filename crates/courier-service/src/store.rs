//! Async access to the synchronous SQLite store.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use courier_shared::{MessagingError, Result};
use courier_store::{Database, StoreError};

/// Shared handle to the [`Database`], driven from tokio's blocking pool.
///
/// Every operation runs under `timeout`. A call that times out is reported
/// as `Transient`; the blocking work it started keeps running and still
/// either commits in full or not at all, which is why sends carry
/// idempotency keys.
#[derive(Clone)]
pub struct SharedStore {
    db: Arc<Mutex<Database>>,
    timeout: Duration,
}

impl SharedStore {
    pub fn new(db: Database, timeout: Duration) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            timeout,
        }
    }

    /// The underlying database handle, for maintenance tasks that need to
    /// bypass the facade.
    pub fn handle(&self) -> Arc<Mutex<Database>> {
        self.db.clone()
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> courier_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.blocking(f);
        self.bounded(op, task)
            .await?
            .map_err(|e| classify(op, e))
    }

    /// Like [`run`](Self::run), then call `on_success` with the result once
    /// `f` has succeeded.
    ///
    /// `on_success` runs even when the caller has already been answered
    /// with `Transient`: a write that commits after the timeout is still
    /// followed by its side effects.
    pub async fn run_then<T, F, C>(&self, op: &'static str, f: F, on_success: C) -> Result<T>
    where
        F: FnOnce(&mut Database) -> courier_store::Result<T> + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
        T: Send + 'static,
    {
        let blocking = self.blocking(f);
        let task = tokio::spawn(async move {
            let value = match blocking.await {
                Ok(result) => result.map_err(|e| classify(op, e))?,
                Err(join_err) => {
                    error!(op, error = %join_err, "store worker failed");
                    return Err(MessagingError::Transient(format!("{op} worker failed")));
                }
            };
            on_success(&value);
            Ok(value)
        });
        self.bounded(op, task).await?
    }

    fn blocking<T, F>(&self, f: F) -> JoinHandle<courier_store::Result<T>>
    where
        F: FnOnce(&mut Database) -> courier_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            // A panic mid-operation drops its open transaction, which rolls
            // back, so the connection behind a poisoned lock is still sound.
            let mut guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard)
        })
    }

    /// Wait for `task` at most `timeout`. The task itself is not cancelled.
    async fn bounded<R>(&self, op: &'static str, task: JoinHandle<R>) -> Result<R> {
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "store operation timed out"
                );
                Err(MessagingError::Transient(format!("{op} timed out")))
            }
            Ok(Err(join_err)) => {
                error!(op, error = %join_err, "store worker failed");
                Err(MessagingError::Transient(format!("{op} worker failed")))
            }
            Ok(Ok(result)) => Ok(result),
        }
    }
}

/// Map a store failure onto the caller-facing taxonomy.
pub fn classify(op: &'static str, err: StoreError) -> MessagingError {
    if err.is_busy() {
        warn!(op, error = %err, "store busy");
        return MessagingError::Transient(err.to_string());
    }
    if err.is_constraint_violation() {
        warn!(op, error = %err, "store constraint violated");
        return MessagingError::Conflict(err.to_string());
    }
    match err {
        StoreError::NotFound(what) => MessagingError::NotFound(what),
        StoreError::InvalidInput(reason) => MessagingError::InvalidConversation(reason),
        StoreError::IdempotencyMismatch(key) => MessagingError::Conflict(format!(
            "idempotency key {key} was already used for another conversation"
        )),
        other => {
            error!(op, error = %other, "store failure");
            MessagingError::Storage(other.to_string())
        }
    }
}
