//! The native per-class record store.

use crate::error::{DbError, DbResult};
use crate::types::{EntityKey, Stamp};
use indexmap::IndexMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use savanna_model::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// The canonical stored form of one entity.
#[derive(Debug, Clone)]
pub(crate) struct StoredRecord {
    /// Storage attribute values.
    pub values: IndexMap<String, Value>,
    /// Concurrency stamp; incremented by exactly 1 on every durable save.
    pub stamp: u64,
    /// Wall-clock time of the last durable save.
    pub saved_at: chrono::NaiveDateTime,
}

/// The record map a store guards.
pub(crate) type RecordMap = IndexMap<EntityKey, StoredRecord>;

/// In-memory canonical storage for one native class: the record map plus
/// the class autosequence counter.
pub(crate) struct NativeStore {
    records: RwLock<RecordMap>,
    sequence: AtomicI64,
}

impl NativeStore {
    pub(crate) fn new(sequence_start: i64) -> Self {
        Self {
            records: RwLock::new(RecordMap::new()),
            sequence: AtomicI64::new(sequence_start),
        }
    }

    /// Hands out the next autosequence value.
    pub(crate) fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// (Re)sets the autosequence counter.
    pub(crate) fn set_sequence(&self, value: i64) {
        self.sequence.store(value, Ordering::SeqCst);
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RecordMap> {
        self.records.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RecordMap> {
        self.records.write()
    }

    /// Clones one record out of the store.
    pub(crate) fn get(&self, key: &EntityKey) -> Option<StoredRecord> {
        self.records.read().get(key).cloned()
    }

    /// The committed key extent, in insertion order.
    pub(crate) fn keys(&self) -> Vec<EntityKey> {
        self.records.read().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// Verifies the optimistic-concurrency stamp of `key` before a write.
///
/// `expected` is 0 for a brand-new entity, in which case the key must not
/// exist yet.
pub(crate) fn check_stamp(
    map: &RecordMap,
    class: &str,
    key: &EntityKey,
    expected: u64,
) -> DbResult<()> {
    let found = map.get(key).map_or(0, |r| r.stamp);
    if found == expected {
        Ok(())
    } else {
        Err(DbError::StampConflict {
            class: class.to_owned(),
            key: key.clone(),
            expected: Stamp::new(expected),
            found: Stamp::new(found),
        })
    }
}

/// Applies one durable save to the record map and returns the new stamp.
/// The stamp must have been checked beforehand.
pub(crate) fn apply_put(map: &mut RecordMap, key: EntityKey, values: IndexMap<String, Value>) -> u64 {
    let now = chrono::Utc::now().naive_utc();
    match map.get_mut(&key) {
        Some(record) => {
            record.values = values;
            record.stamp += 1;
            record.saved_at = now;
            record.stamp
        }
        None => {
            map.insert(
                key,
                StoredRecord {
                    values,
                    stamp: 1,
                    saved_at: now,
                },
            );
            1
        }
    }
}

/// Removes one record. Returns the removed record, or `None` when the key
/// was already absent (removing an absent entity is not an error).
pub(crate) fn apply_remove(map: &mut RecordMap, key: &EntityKey) -> Option<StoredRecord> {
    map.shift_remove(key)
}

/// Checks a `unique` constraint: does any record other than `excluding`
/// already hold `value` in `attribute`?
pub(crate) fn unique_conflict(
    map: &RecordMap,
    attribute: &str,
    value: &Value,
    excluding: Option<&EntityKey>,
) -> bool {
    if value.is_null() {
        return false;
    }
    map.iter().any(|(key, record)| {
        if excluding == Some(key) {
            return false;
        }
        record
            .values
            .get(attribute)
            .is_some_and(|v| v.compare(value) == Some(std::cmp::Ordering::Equal))
    })
}
