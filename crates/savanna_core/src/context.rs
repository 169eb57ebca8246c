//! Execution contexts.

use crate::engine::DatastoreInner;
use crate::error::{DbError, DbResult};
use crate::transaction::{Pending, TxnState};
use crate::types::{ContextId, EntityKey};
use indexmap::IndexMap;
use parking_lot::Mutex;
use savanna_model::ClassId;
use std::sync::Arc;
use tracing::debug;

/// One logical worker's view of the datastore.
///
/// A context owns its transaction stack and identifies lock ownership; it
/// never shares either with other contexts. All reads and writes flow
/// through a context so buffered transaction state stays visible to its
/// owner only (read-your-writes).
pub struct ExecutionContext {
    id: ContextId,
    inner: Arc<DatastoreInner>,
    txn: Mutex<TxnState>,
}

impl ExecutionContext {
    pub(crate) fn new(id: ContextId, inner: Arc<DatastoreInner>) -> Self {
        Self {
            id,
            inner,
            txn: Mutex::new(TxnState::new()),
        }
    }

    /// The context identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Opens a transaction (or a nested level when one is already open).
    pub fn start_transaction(&self) {
        let mut txn = self.txn.lock();
        txn.start();
        debug!(ctx = %self.id, level = txn.level(), "transaction started");
    }

    /// The current nesting level; 0 when no transaction is open.
    #[must_use]
    pub fn transaction_level(&self) -> usize {
        self.txn.lock().level()
    }

    /// Accepts the transaction at the current level.
    ///
    /// An inner commit merges its buffered writes into the parent level; the
    /// outermost commit flushes the whole buffered set atomically. If the
    /// flush fails (validation or a stamp conflict), the entire set is
    /// discarded and the error surfaces here.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] outside a transaction; otherwise any
    /// validation, conflict or backend failure from the flush.
    pub fn commit(&self) -> DbResult<()> {
        let mut txn = self.txn.lock();
        match txn.level() {
            0 => Err(DbError::invalid_operation("commit outside a transaction")),
            1 => {
                let writes = txn.take_all();
                drop(txn);
                self.inner.commit_writes(writes).map(|applied| {
                    debug!(ctx = %self.id, applied = applied.len(), "transaction committed");
                })
            }
            _ => {
                txn.merge_down();
                Ok(())
            }
        }
    }

    /// Cancels the transaction at the current level, discarding its
    /// buffered writes.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] outside a transaction.
    pub fn rollback(&self) -> DbResult<()> {
        let mut txn = self.txn.lock();
        txn.rollback()?;
        debug!(ctx = %self.id, level = txn.level(), "transaction rolled back");
        Ok(())
    }

    /// Detaches the transaction stack from the context; subsequent writes
    /// autocommit until [`ExecutionContext::resume_transaction`]. A no-op at
    /// level 0.
    pub fn pause_transaction(&self) {
        self.txn.lock().pause();
    }

    /// Restores a paused transaction stack exactly as it was. A no-op when
    /// nothing is paused.
    pub fn resume_transaction(&self) {
        self.txn.lock().resume();
    }

    pub(crate) fn buffering(&self) -> bool {
        self.txn.lock().buffering()
    }

    pub(crate) fn record_write(&self, class: ClassId, key: EntityKey, pending: Pending) {
        self.txn.lock().record(class, key, pending);
    }

    pub(crate) fn pending_for(&self, class: ClassId, key: &EntityKey) -> Option<Pending> {
        self.txn.lock().pending_for(class, key).cloned()
    }

    pub(crate) fn touches_class(&self, class: ClassId) -> bool {
        self.txn.lock().touches_class(class)
    }

    pub(crate) fn overlay_for(&self, class: ClassId) -> IndexMap<EntityKey, Pending> {
        self.txn.lock().overlay_for(class)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // A context that dies with an open transaction loses its buffer.
        self.txn.lock().clear();
        self.inner.locks.unlock_all(self.id);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("transaction_level", &self.transaction_level())
            .finish()
    }
}
