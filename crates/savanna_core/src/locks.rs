//! Advisory per-entity locks.

use crate::types::{ContextId, EntityKey};
use parking_lot::Mutex;
use savanna_model::ClassId;
use std::collections::HashMap;

/// The process-wide entity lock table.
///
/// Locks are exclusive, advisory and keyed by entity identity. A context
/// that already holds a lock re-acquires it trivially; unlocking something
/// the caller does not hold is a no-op.
#[derive(Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<(ClassId, EntityKey), ContextId>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tries to take the lock for `ctx`. Returns `false` when another
    /// context holds it.
    pub(crate) fn lock(&self, class: ClassId, key: &EntityKey, ctx: ContextId) -> bool {
        let mut held = self.held.lock();
        match held.get(&(class, key.clone())) {
            Some(owner) => *owner == ctx,
            None => {
                held.insert((class, key.clone()), ctx);
                true
            }
        }
    }

    /// Releases the lock when `ctx` owns it; idempotent otherwise.
    pub(crate) fn unlock(&self, class: ClassId, key: &EntityKey, ctx: ContextId) {
        let mut held = self.held.lock();
        if held.get(&(class, key.clone())) == Some(&ctx) {
            held.remove(&(class, key.clone()));
        }
    }

    /// Drops every lock a context holds (fired when the context ends).
    pub(crate) fn unlock_all(&self, ctx: ContextId) {
        self.held.lock().retain(|_, owner| *owner != ctx);
    }

    /// Current owner of an entity lock, if any.
    pub(crate) fn owner(&self, class: ClassId, key: &EntityKey) -> Option<ContextId> {
        self.held.lock().get(&(class, key.clone())).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS: ClassId = ClassId::new(0);

    #[test]
    fn exclusive_across_contexts_reentrant_within() {
        let table = LockTable::new();
        let key = EntityKey::Long(1);
        let a = ContextId::new(1);
        let b = ContextId::new(2);

        assert!(table.lock(CLASS, &key, a));
        assert!(table.lock(CLASS, &key, a));
        assert!(!table.lock(CLASS, &key, b));

        table.unlock(CLASS, &key, a);
        assert!(table.lock(CLASS, &key, b));
    }

    #[test]
    fn unlock_is_idempotent_and_owner_checked() {
        let table = LockTable::new();
        let key = EntityKey::Long(1);
        let a = ContextId::new(1);
        let b = ContextId::new(2);

        assert!(table.lock(CLASS, &key, a));
        // b does not own the lock; its unlock changes nothing
        table.unlock(CLASS, &key, b);
        assert_eq!(table.owner(CLASS, &key), Some(a));

        table.unlock(CLASS, &key, a);
        table.unlock(CLASS, &key, a);
        assert_eq!(table.owner(CLASS, &key), None);
    }

    #[test]
    fn unlock_all_releases_only_that_context() {
        let table = LockTable::new();
        let a = ContextId::new(1);
        let b = ContextId::new(2);
        assert!(table.lock(CLASS, &EntityKey::Long(1), a));
        assert!(table.lock(CLASS, &EntityKey::Long(2), b));

        table.unlock_all(a);
        assert_eq!(table.owner(CLASS, &EntityKey::Long(1)), None);
        assert_eq!(table.owner(CLASS, &EntityKey::Long(2)), Some(b));
    }
}
