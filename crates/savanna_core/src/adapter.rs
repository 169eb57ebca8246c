//! Virtual backend adapters.
//!
//! A class may delegate all of its entity, collection and query primitives
//! to an external data source by implementing [`VirtualAdapter`]. The engine
//! dispatches every native operation through the class backend, so adapter
//! classes are indistinguishable from native ones to callers: same
//! validate/save ordering, same stamp semantics (defaulting to 0 when
//! [`VirtualAdapter::get_stamp`] is not implemented), same query fallback
//! chain.
//!
//! Only four methods are required; everything else has a default the engine
//! supplies once and reuses for both native and adapter classes.

use crate::error::DbError;
use crate::types::EntityKey;
use indexmap::IndexMap;
use savanna_model::Value;
use thiserror::Error;

/// One remote record: attribute name to value, in attribute order.
pub type AttrRow = IndexMap<String, Value>;

/// Error raised by a control method; propagated verbatim to the caller of
/// the native-looking operation that triggered the dispatch.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AdapterError(pub String);

impl AdapterError {
    /// Creates an adapter error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<AdapterError> for DbError {
    fn from(err: AdapterError) -> Self {
        DbError::Adapter { message: err.0 }
    }
}

/// Result type for control methods.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// One lowered query criterion, handed to
/// [`VirtualAdapter::query_by_criteria`].
///
/// Wildcard positions in the original clause set the prefix/suffix/equality
/// flags: `"Smi*"` lowers to `begins_with`, `"*ith"` to `ends_with`, a
/// wildcard-free operand to `equal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    /// The queried attribute.
    pub attribute_name: String,
    /// The compared text, wildcards stripped.
    pub value: String,
    /// Match values starting with `value`.
    pub begins_with: bool,
    /// Match values ending with `value`.
    pub ends_with: bool,
    /// Match values equal to `value` (engine collation).
    pub equal: bool,
}

/// Sort directive handed to [`VirtualAdapter::order_by`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDirective {
    /// Attribute name.
    pub attname: String,
    /// True for ascending order.
    pub ascending: bool,
}

/// The control-method capability set a class can implement to stand in for
/// the native engine.
///
/// `all_entities`, `get_entity_by_key`, `save_entity` and `drop_entity` are
/// the read/write/delete core and must be provided. Every other method has
/// a default: either derived from the core four, or `None`/passthrough to
/// tell the engine to use its own implementation.
pub trait VirtualAdapter: Send + Sync {
    /// Fetches every remote record.
    fn all_entities(&self) -> AdapterResult<Vec<AttrRow>>;

    /// Fetches one record by primary key; `Ok(None)` when absent.
    fn get_entity_by_key(&self, key: &EntityKey) -> AdapterResult<Option<AttrRow>>;

    /// Creates or updates a record; returns the (possibly newly assigned)
    /// primary key.
    fn save_entity(&self, key: Option<&EntityKey>, values: &AttrRow) -> AdapterResult<EntityKey>;

    /// Deletes one record.
    fn drop_entity(&self, key: &EntityKey) -> AdapterResult<()>;

    /// Fetches the record at a position in enumeration order.
    fn get_entity_by_pos(&self, pos: usize) -> AdapterResult<Option<AttrRow>> {
        Ok(self.all_entities()?.into_iter().nth(pos))
    }

    /// Reads one attribute from a fetched record.
    fn get_attribute_value(&self, row: &AttrRow, attribute: &str) -> AdapterResult<Value> {
        Ok(row.get(attribute).cloned().unwrap_or(Value::Null))
    }

    /// Produces the storage for a fresh, unsaved record.
    fn new_entity(&self) -> AdapterResult<AttrRow> {
        Ok(AttrRow::new())
    }

    /// Writes one attribute into a record's storage.
    fn set_attribute_value(
        &self,
        row: &mut AttrRow,
        attribute: &str,
        value: Value,
    ) -> AdapterResult<()> {
        row.insert(attribute.to_owned(), value);
        Ok(())
    }

    /// Re-fetches a record from the source.
    fn refresh_entity(&self, key: &EntityKey) -> AdapterResult<Option<AttrRow>> {
        self.get_entity_by_key(key)
    }

    /// Deletes a set of records.
    fn drop_entities(&self, keys: &[EntityKey]) -> AdapterResult<()> {
        for key in keys {
            self.drop_entity(key)?;
        }
        Ok(())
    }

    /// Runs a textual query natively on the source. `Ok(None)` falls back to
    /// [`VirtualAdapter::query_by_criteria`].
    fn query_by_string(&self, query: &str) -> AdapterResult<Option<Vec<AttrRow>>> {
        let _ = query;
        Ok(None)
    }

    /// Runs a lowered criteria query on the source. `Ok(None)` makes the
    /// engine fetch `all_entities` and filter them itself, so every
    /// predicate works against every adapter.
    fn query_by_criteria(&self, criteria: &[Criterion]) -> AdapterResult<Option<Vec<AttrRow>>> {
        let _ = criteria;
        Ok(None)
    }

    /// Extracts the foreign key stored under a relation attribute.
    fn get_related_key(&self, row: &AttrRow, attribute: &str) -> AdapterResult<Option<EntityKey>> {
        Ok(row.get(attribute).and_then(EntityKey::from_value))
    }

    /// Fetches a related record directly. `Ok(None)` lets the engine resolve
    /// the relation through the related class's own backend.
    fn get_related_entity(
        &self,
        row: &AttrRow,
        attribute: &str,
    ) -> AdapterResult<Option<AttrRow>> {
        let _ = (row, attribute);
        Ok(None)
    }

    /// Fetches a related record set directly. `Ok(None)` lets the engine
    /// query the related class's own backend.
    fn get_related_entities(
        &self,
        row: &AttrRow,
        attribute: &str,
    ) -> AdapterResult<Option<Vec<AttrRow>>> {
        let _ = (row, attribute);
        Ok(None)
    }

    /// Hook fired when an empty collection is created for the class.
    fn new_collection(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Hook fired when an entity joins a collection of the class.
    fn add_entity_to_collection(&self, key: &EntityKey) -> AdapterResult<()> {
        let _ = key;
        Ok(())
    }

    /// Overrides the length computation of a collection. `Ok(None)` counts
    /// the engine-side key list.
    fn get_collection_length(&self, keys: &[EntityKey]) -> AdapterResult<Option<usize>> {
        let _ = keys;
        Ok(None)
    }

    /// Counts records at the class level.
    fn count_entities(&self) -> AdapterResult<usize> {
        Ok(self.all_entities()?.len())
    }

    /// Orders a fetched row set natively. `Ok(None)` makes the engine sort.
    fn order_by(
        &self,
        rows: Vec<AttrRow>,
        directives: &[SortDirective],
    ) -> AdapterResult<Option<Vec<AttrRow>>> {
        let _ = (rows, directives);
        Ok(None)
    }

    /// Overrides statistical aggregation for one attribute. `Ok(None)` runs
    /// the engine's own aggregation over fetched values.
    fn compute_attribute(&self, attribute: &str) -> AdapterResult<Option<Vec<Value>>> {
        let _ = attribute;
        Ok(None)
    }

    /// Overrides row projection for `to_array`. `Ok(None)` projects
    /// engine-side.
    fn collection_to_array(&self, keys: &[EntityKey]) -> AdapterResult<Option<Vec<AttrRow>>> {
        let _ = keys;
        Ok(None)
    }

    /// Overrides cursor advancement in a collection. `Ok(None)` steps the
    /// engine-side key list.
    fn next_in_collection(
        &self,
        keys: &[EntityKey],
        current: usize,
    ) -> AdapterResult<Option<Option<EntityKey>>> {
        let _ = (keys, current);
        Ok(None)
    }

    /// Returns the concurrency stamp of a record. The default of 0 disables
    /// optimistic conflict detection for the class.
    fn get_stamp(&self, key: &EntityKey) -> AdapterResult<u64> {
        let _ = key;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TwoRows;

    impl VirtualAdapter for TwoRows {
        fn all_entities(&self) -> AdapterResult<Vec<AttrRow>> {
            let mut a = AttrRow::new();
            a.insert("ID".into(), Value::Long(1));
            let mut b = AttrRow::new();
            b.insert("ID".into(), Value::Long(2));
            Ok(vec![a, b])
        }

        fn get_entity_by_key(&self, key: &EntityKey) -> AdapterResult<Option<AttrRow>> {
            Ok(self
                .all_entities()?
                .into_iter()
                .find(|r| r.get("ID").and_then(EntityKey::from_value).as_ref() == Some(key)))
        }

        fn save_entity(
            &self,
            _key: Option<&EntityKey>,
            _values: &AttrRow,
        ) -> AdapterResult<EntityKey> {
            Err(AdapterError::new("read-only source"))
        }

        fn drop_entity(&self, _key: &EntityKey) -> AdapterResult<()> {
            Err(AdapterError::new("read-only source"))
        }
    }

    #[test]
    fn default_position_and_count_derive_from_all_entities() {
        let adapter = TwoRows;
        assert_eq!(adapter.count_entities().unwrap(), 2);
        let second = adapter.get_entity_by_pos(1).unwrap().unwrap();
        assert_eq!(second.get("ID"), Some(&Value::Long(2)));
        assert!(adapter.get_entity_by_pos(5).unwrap().is_none());
    }

    #[test]
    fn default_stamp_is_zero() {
        assert_eq!(TwoRows.get_stamp(&EntityKey::Long(1)).unwrap(), 0);
    }

    #[test]
    fn adapter_error_becomes_db_error_verbatim() {
        let err: DbError = AdapterError::new("boom").into();
        assert_eq!(err.to_string(), "adapter error: boom");
    }
}
