//! Named key-value storage spaces.
//!
//! A storage space is a process-wide mutable map reachable from any
//! execution context, with an explicit lock (`lock` blocks, `try_lock`
//! does not) so contexts can serialize multi-step read-modify-write
//! sequences.

use crate::types::ContextId;
use parking_lot::{Condvar, Mutex};
use savanna_model::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One named storage space.
pub struct NamedStorage {
    items: Mutex<HashMap<String, Value>>,
    owner: Mutex<Option<ContextId>>,
    released: Condvar,
}

impl NamedStorage {
    fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Number of key/value pairs.
    #[must_use]
    pub fn length(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns a copy of a stored value.
    #[must_use]
    pub fn get_item(&self, key: &str) -> Option<Value> {
        self.items.lock().get(key).cloned()
    }

    /// Creates or updates an item.
    pub fn set_item(&self, key: impl Into<String>, value: Value) {
        self.items.lock().insert(key.into(), value);
    }

    /// Removes an item.
    pub fn remove_item(&self, key: &str) {
        self.items.lock().remove(key);
    }

    /// Removes every item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Locks the storage for `ctx`, blocking until it is available.
    /// Re-locking from the owning context returns immediately.
    pub fn lock(&self, ctx: ContextId) {
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => {
                    *owner = Some(ctx);
                    return;
                }
                Some(current) if current == ctx => return,
                Some(_) => self.released.wait(&mut owner),
            }
        }
    }

    /// Tries to lock the storage for `ctx` without blocking.
    #[must_use]
    pub fn try_lock(&self, ctx: ContextId) -> bool {
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(ctx);
                true
            }
            Some(current) => current == ctx,
        }
    }

    /// Releases the lock when `ctx` owns it; idempotent otherwise.
    pub fn unlock(&self, ctx: ContextId) {
        let mut owner = self.owner.lock();
        if *owner == Some(ctx) {
            *owner = None;
            self.released.notify_one();
        }
    }
}

/// Registry of named storage spaces, keyed by storage id.
#[derive(Default)]
pub(crate) struct StorageRegistry {
    spaces: Mutex<HashMap<String, Arc<NamedStorage>>>,
}

impl StorageRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the named storage, creating it on first use.
    pub(crate) fn get(&self, id: &str) -> Arc<NamedStorage> {
        self.spaces
            .lock()
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(NamedStorage::new()))
            .clone()
    }

    /// Deletes a named storage. Outstanding references keep working on the
    /// detached space.
    pub(crate) fn remove(&self, id: &str) {
        self.spaces.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_roundtrip() {
        let registry = StorageRegistry::new();
        let storage = registry.get("session");
        storage.set_item("visits", Value::Long(3));
        assert_eq!(storage.get_item("visits"), Some(Value::Long(3)));
        assert_eq!(storage.length(), 1);

        storage.remove_item("visits");
        assert_eq!(storage.get_item("visits"), None);
    }

    #[test]
    fn get_returns_the_same_space() {
        let registry = StorageRegistry::new();
        registry.get("shared").set_item("k", Value::Bool(true));
        assert_eq!(registry.get("shared").get_item("k"), Some(Value::Bool(true)));

        registry.remove("shared");
        assert_eq!(registry.get("shared").get_item("k"), None);
    }

    #[test]
    fn try_lock_respects_ownership() {
        let registry = StorageRegistry::new();
        let storage = registry.get("s");
        let a = ContextId::new(1);
        let b = ContextId::new(2);

        assert!(storage.try_lock(a));
        assert!(storage.try_lock(a));
        assert!(!storage.try_lock(b));

        storage.unlock(b); // not the owner, no effect
        assert!(!storage.try_lock(b));

        storage.unlock(a);
        assert!(storage.try_lock(b));
    }

    #[test]
    fn blocking_lock_hands_over() {
        let registry = Arc::new(StorageRegistry::new());
        let storage = registry.get("s");
        let a = ContextId::new(1);
        let b = ContextId::new(2);

        storage.lock(a);
        let storage2 = Arc::clone(&registry).get("s");
        let waiter = std::thread::spawn(move || {
            storage2.lock(b);
            storage2.unlock(b);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        storage.unlock(a);
        waiter.join().unwrap();
    }
}
