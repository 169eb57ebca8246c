//! Per-context transaction state.
//!
//! Each execution context owns a stack of transaction frames. Level 0 is
//! autocommit: every save or remove is immediately durable. From level 1 up,
//! writes buffer in the top frame; an inner commit merges its frame into the
//! parent, and only the outermost commit flushes the whole buffered set
//! atomically. Buffered writes are visible to the owning context only.

use crate::error::{DbError, DbResult};
use crate::types::EntityKey;
use indexmap::IndexMap;
use savanna_model::{ClassId, Value};

/// A buffered mutation awaiting the outer commit.
#[derive(Debug, Clone)]
pub(crate) enum Pending {
    /// A buffered save.
    Save {
        /// Storage attribute values as of the buffered save.
        values: IndexMap<String, Value>,
        /// The stamp the saving context loaded (0 for a new entity).
        expected_stamp: u64,
        /// Whether the entity had never been durably saved.
        was_new: bool,
    },
    /// A buffered remove.
    Drop {
        /// The stamp the removing context loaded.
        expected_stamp: u64,
    },
}

/// One transaction nesting level.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    /// Writes in arrival order; later writes to the same entity replace
    /// earlier ones.
    pub writes: IndexMap<(ClassId, EntityKey), Pending>,
}

/// The transaction stack of one execution context.
#[derive(Debug, Default)]
pub(crate) struct TxnState {
    frames: Vec<Frame>,
    parked: Option<Vec<Frame>>,
}

impl TxnState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current nesting level; 0 means autocommit.
    pub(crate) fn level(&self) -> usize {
        self.frames.len()
    }

    /// True when writes should buffer instead of committing directly.
    pub(crate) fn buffering(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Opens a new nesting level.
    pub(crate) fn start(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Discards the current frame and returns to the parent level.
    pub(crate) fn rollback(&mut self) -> DbResult<()> {
        if self.frames.pop().is_none() {
            return Err(DbError::invalid_operation("rollback outside a transaction"));
        }
        Ok(())
    }

    /// Merges the top frame into its parent (commit at level >= 2).
    /// The inner frame's writes win over the parent's.
    pub(crate) fn merge_down(&mut self) {
        if let Some(inner) = self.frames.pop() {
            if let Some(parent) = self.frames.last_mut() {
                for (key, pending) in inner.writes {
                    parent.writes.insert(key, pending);
                }
            } else {
                // merge_down is only called at level >= 2
                self.frames.push(inner);
            }
        }
    }

    /// Takes the whole buffered set for the outer flush, clearing the stack.
    /// Outer frames first, inner writes overriding.
    pub(crate) fn take_all(&mut self) -> IndexMap<(ClassId, EntityKey), Pending> {
        let mut merged = IndexMap::new();
        for frame in self.frames.drain(..) {
            for (key, pending) in frame.writes {
                merged.insert(key, pending);
            }
        }
        merged
    }

    /// Discards every frame (after a failed outer commit).
    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }

    /// Buffers a write in the top frame.
    pub(crate) fn record(&mut self, class: ClassId, key: EntityKey, pending: Pending) {
        if let Some(frame) = self.frames.last_mut() {
            frame.writes.insert((class, key), pending);
        }
    }

    /// Looks up the innermost buffered write for an entity.
    pub(crate) fn pending_for(&self, class: ClassId, key: &EntityKey) -> Option<&Pending> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.writes.get(&(class, key.clone())))
    }

    /// True when any frame buffers a write against the class. Queries fall
    /// back to an overlay-aware scan in that case.
    pub(crate) fn touches_class(&self, class: ClassId) -> bool {
        self.frames
            .iter()
            .any(|f| f.writes.keys().any(|(c, _)| *c == class))
    }

    /// The merged per-entity overlay for one class, innermost write winning.
    pub(crate) fn overlay_for(&self, class: ClassId) -> IndexMap<EntityKey, Pending> {
        let mut merged = IndexMap::new();
        for frame in &self.frames {
            for ((c, key), pending) in &frame.writes {
                if *c == class {
                    merged.insert(key.clone(), pending.clone());
                }
            }
        }
        merged
    }

    /// Detaches the whole stack from the context. A no-op at level 0 or
    /// when a stack is already parked.
    pub(crate) fn pause(&mut self) {
        if !self.frames.is_empty() && self.parked.is_none() {
            self.parked = Some(std::mem::take(&mut self.frames));
        }
    }

    /// Restores a parked stack exactly as it was. A no-op when nothing is
    /// parked.
    pub(crate) fn resume(&mut self) {
        if let Some(parked) = self.parked.take() {
            debug_assert!(self.frames.is_empty());
            self.frames = parked;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS: ClassId = ClassId::new(0);

    fn save(stamp: u64) -> Pending {
        Pending::Save {
            values: IndexMap::new(),
            expected_stamp: stamp,
            was_new: stamp == 0,
        }
    }

    #[test]
    fn levels_track_start_and_rollback() {
        let mut txn = TxnState::new();
        assert_eq!(txn.level(), 0);
        txn.start();
        txn.start();
        assert_eq!(txn.level(), 2);
        txn.rollback().unwrap();
        assert_eq!(txn.level(), 1);
    }

    #[test]
    fn rollback_at_level_zero_is_an_error() {
        let mut txn = TxnState::new();
        assert!(txn.rollback().is_err());
    }

    #[test]
    fn inner_rollback_discards_only_inner_writes() {
        let mut txn = TxnState::new();
        txn.start();
        txn.record(CLASS, EntityKey::Long(1), save(1));
        txn.start();
        txn.record(CLASS, EntityKey::Long(2), save(1));
        txn.rollback().unwrap();

        assert!(txn.pending_for(CLASS, &EntityKey::Long(1)).is_some());
        assert!(txn.pending_for(CLASS, &EntityKey::Long(2)).is_none());
    }

    #[test]
    fn merge_down_lets_inner_writes_win() {
        let mut txn = TxnState::new();
        txn.start();
        txn.record(CLASS, EntityKey::Long(1), save(3));
        txn.start();
        txn.record(CLASS, EntityKey::Long(1), Pending::Drop { expected_stamp: 3 });
        txn.merge_down();

        assert_eq!(txn.level(), 1);
        assert!(matches!(
            txn.pending_for(CLASS, &EntityKey::Long(1)),
            Some(Pending::Drop { .. })
        ));
    }

    #[test]
    fn take_all_merges_outer_to_inner() {
        let mut txn = TxnState::new();
        txn.start();
        txn.record(CLASS, EntityKey::Long(1), save(1));
        txn.record(CLASS, EntityKey::Long(2), save(1));
        txn.start();
        txn.record(CLASS, EntityKey::Long(2), Pending::Drop { expected_stamp: 1 });

        let writes = txn.take_all();
        assert_eq!(txn.level(), 0);
        assert_eq!(writes.len(), 2);
        assert!(matches!(
            writes.get(&(CLASS, EntityKey::Long(2))),
            Some(Pending::Drop { .. })
        ));
    }

    #[test]
    fn pause_and_resume_restore_the_stack() {
        let mut txn = TxnState::new();
        txn.pause(); // level 0: no-op
        assert_eq!(txn.level(), 0);

        txn.start();
        txn.record(CLASS, EntityKey::Long(1), save(1));
        txn.pause();
        assert_eq!(txn.level(), 0);
        assert!(!txn.buffering());

        txn.resume();
        assert_eq!(txn.level(), 1);
        assert!(txn.pending_for(CLASS, &EntityKey::Long(1)).is_some());
    }
}
