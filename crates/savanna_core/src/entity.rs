//! Entity handles and the save pipeline.

use crate::collection::EntityCollection;
use crate::context::ExecutionContext;
use crate::engine::{ClassRt, DatastoreInner, ValuesRef, ValuesView};
use crate::error::{DbError, DbResult};
use crate::store::{unique_conflict, RecordMap};
use crate::transaction::Pending;
use crate::types::EntityKey;
use chrono::NaiveDateTime;
use indexmap::{IndexMap, IndexSet};
use savanna_model::{AttributeKind, ValidationOutcome, Value};
use std::sync::Arc;
use tracing::trace;

/// Validation error code: `not_null` violated.
pub const ERR_NOT_NULL: i64 = 1001;
/// Validation error code: length constraint violated.
pub const ERR_LENGTH: i64 = 1002;
/// Validation error code: numeric range violated.
pub const ERR_RANGE: i64 = 1003;
/// Validation error code: entry pattern violated.
pub const ERR_PATTERN: i64 = 1004;
/// Validation error code: `unique` violated.
pub const ERR_UNIQUE: i64 = 1005;
/// Validation error code: primary key missing or unusable.
pub const ERR_KEY: i64 = 1006;

/// Runs the validation chain over a record about to be saved.
///
/// Order is fixed: per-attribute validate handlers (registration order,
/// first rejection aborts), then per-class validate handlers, then the
/// structural constraints. Structural failures accumulate into one error so
/// the message stack reports everything wrong with the record.
///
/// `map` is the class record map for `unique` checks; `None` (virtual
/// classes) skips them, the external source owns uniqueness there.
pub(crate) fn validate_record(
    class: &ClassRt,
    values: &IndexMap<String, Value>,
    map: Option<&RecordMap>,
    excluding: Option<&EntityKey>,
) -> DbResult<()> {
    let view = ValuesRef { values };

    for attr in class.def.attributes.values() {
        for handler in attr.events.validate_handlers() {
            if let ValidationOutcome::Fail { code, message } = handler(&view) {
                return Err(DbError::Validation {
                    code,
                    messages: vec![message],
                });
            }
        }
    }
    for handler in class.def.events.validate_handlers() {
        if let ValidationOutcome::Fail { code, message } = handler(&view) {
            return Err(DbError::Validation {
                code,
                messages: vec![message],
            });
        }
    }

    let mut code = 0;
    let mut messages = Vec::new();
    let mut fail = |c: i64, m: String| {
        if code == 0 {
            code = c;
        }
        messages.push(m);
    };

    for attr in class.def.attributes.values().filter(|a| a.is_stored()) {
        let value = values.get(&attr.name).cloned().unwrap_or(Value::Null);
        let label = || format!("{}.{}", class.name(), attr.name);

        if value.is_null() {
            if attr.not_null {
                fail(ERR_NOT_NULL, format!("{} cannot be null", label()));
            }
            continue;
        }
        if let Value::Text(text) = &value {
            let chars = text.chars().count();
            if let Some(max) = attr.max_length {
                if chars > max {
                    fail(ERR_LENGTH, format!("{} exceeds {max} characters", label()));
                }
            }
            if let Some(min) = attr.min_length {
                if chars < min {
                    fail(ERR_LENGTH, format!("{} is shorter than {min} characters", label()));
                }
            }
            if let Some(fixed) = attr.fixed_length {
                if chars != fixed {
                    fail(ERR_LENGTH, format!("{} must be exactly {fixed} characters", label()));
                }
            }
            if let Some(pattern) = &attr.pattern {
                if !pattern.is_match(text) {
                    fail(ERR_PATTERN, format!("{} does not match its pattern", label()));
                }
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = attr.min_value {
                if n < min {
                    fail(ERR_RANGE, format!("{} is below {min}", label()));
                }
            }
            if let Some(max) = attr.max_value {
                if n > max {
                    fail(ERR_RANGE, format!("{} is above {max}", label()));
                }
            }
        }
        if attr.unique {
            if let Some(map) = map {
                if unique_conflict(map, &attr.name, &value, excluding) {
                    fail(ERR_UNIQUE, format!("{} must be unique", label()));
                }
            }
        }
    }

    if messages.is_empty() {
        Ok(())
    } else {
        Err(DbError::Validation { code, messages })
    }
}

/// Fires the save event handlers: class handlers first, then per-attribute
/// handlers, all in registration order. Handlers may rewrite the record.
pub(crate) fn run_save_hooks(
    class: &ClassRt,
    values: &mut IndexMap<String, Value>,
) -> DbResult<()> {
    let mut view = ValuesView { values };
    for handler in class.def.events.save_handlers() {
        handler(&mut view).map_err(|e| DbError::Validation {
            code: e.code,
            messages: vec![e.message],
        })?;
    }
    for attr in class.def.attributes.values() {
        for handler in attr.events.save_handlers() {
            handler(&mut view).map_err(|e| DbError::Validation {
                code: e.code,
                messages: vec![e.message],
            })?;
        }
    }
    Ok(())
}

/// Fires the class remove event handlers over the doomed record.
pub(crate) fn run_remove_hooks(
    class: &ClassRt,
    values: &mut IndexMap<String, Value>,
) -> DbResult<()> {
    let mut view = ValuesView { values };
    for handler in class.def.events.remove_handlers() {
        handler(&mut view).map_err(|e| DbError::Validation {
            code: e.code,
            messages: vec![e.message],
        })?;
    }
    Ok(())
}

/// One record of a data class.
///
/// An entity is a handle: any number of handles may reference the same
/// underlying record, and they converge on [`Entity::refresh`]. The handle
/// tracks what changed since load so [`Entity::save`] can enforce the
/// optimistic-concurrency stamp rule.
#[derive(Clone)]
pub struct Entity {
    class: Arc<ClassRt>,
    inner: Arc<DatastoreInner>,
    key: Option<EntityKey>,
    values: IndexMap<String, Value>,
    loaded_stamp: u64,
    modified: IndexSet<String>,
    is_new: bool,
    loaded: bool,
    saved_in_pass: bool,
}

impl Entity {
    /// Builds a new, unsaved entity: defaults applied, init handlers fired.
    /// Adapter classes start from the storage their `new_entity` produces.
    pub(crate) fn create(class: Arc<ClassRt>, inner: Arc<DatastoreInner>) -> DbResult<Self> {
        let mut values = match class.adapter() {
            Some(adapter) => adapter.new_entity()?,
            None => IndexMap::new(),
        };
        for attr in class.def.attributes.values().filter(|a| a.is_stored()) {
            if let Some(default) = &attr.default_value {
                if !values.contains_key(&attr.name) {
                    values.insert(attr.name.clone(), default.clone());
                }
            }
        }
        {
            let mut view = ValuesView { values: &mut values };
            for handler in class.def.events.init_handlers() {
                handler(&mut view).map_err(|e| DbError::Validation {
                    code: e.code,
                    messages: vec![e.message],
                })?;
            }
        }
        Ok(Self {
            class,
            inner,
            key: None,
            values,
            loaded_stamp: 0,
            modified: IndexSet::new(),
            is_new: true,
            loaded: true,
            saved_in_pass: false,
        })
    }

    /// Wraps a record loaded from a backend.
    pub(crate) fn loaded(
        class: Arc<ClassRt>,
        inner: Arc<DatastoreInner>,
        key: EntityKey,
        values: IndexMap<String, Value>,
        stamp: u64,
    ) -> Self {
        Self {
            class,
            inner,
            key: Some(key),
            values,
            loaded_stamp: stamp,
            modified: IndexSet::new(),
            is_new: false,
            loaded: true,
            saved_in_pass: false,
        }
    }

    /// The owning class name.
    #[must_use]
    pub fn get_data_class(&self) -> &str {
        self.class.name()
    }

    /// The primary key value, once assigned.
    #[must_use]
    pub fn get_key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    /// The stamp this handle loaded (0 before the first durable save).
    #[must_use]
    pub fn get_stamp(&self) -> u64 {
        self.loaded_stamp
    }

    /// True until the first successful save.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// True when any attribute changed since load or the last save.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }

    /// True while the handle holds the record in memory.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Names of the attributes modified since load, in modification order.
    #[must_use]
    pub fn get_modified_attributes(&self) -> Vec<String> {
        self.modified.iter().cloned().collect()
    }

    /// Wall-clock time of the last durable save (native classes only).
    ///
    /// # Errors
    ///
    /// Never fails for native classes; kept fallible for interface symmetry.
    pub fn get_time_stamp(&self) -> DbResult<Option<NaiveDateTime>> {
        match &self.key {
            Some(key) if !self.class.is_virtual() => {
                Ok(self.class.store.get(key).map(|r| r.saved_at))
            }
            _ => Ok(None),
        }
    }

    fn ensure_loaded(&mut self, ctx: &ExecutionContext) -> DbResult<()> {
        if self.loaded {
            return Ok(());
        }
        if let Some(key) = self.key.clone() {
            if let Some((values, stamp)) = self.inner.load_record(ctx, &self.class, &key)? {
                self.values = values;
                self.loaded_stamp = stamp;
                self.loaded = true;
            }
        }
        Ok(())
    }

    /// Reads an attribute value.
    ///
    /// Storage attributes read their stored value, calculated attributes run
    /// `on_get`, aliases traverse their path, N -> 1 relations yield the
    /// stored foreign key and 1 -> N relations an array of related keys. A
    /// released handle transparently reloads first.
    ///
    /// # Errors
    ///
    /// Unknown attributes, hook failures and backend failures.
    pub fn get(&mut self, ctx: &ExecutionContext, attribute: &str) -> DbResult<Value> {
        self.ensure_loaded(ctx)?;
        let attr = self
            .class
            .def
            .attribute(attribute)
            .ok_or_else(|| DbError::unknown_attribute(self.class.name(), attribute))?;
        match attr.kind {
            AttributeKind::Storage | AttributeKind::RelatedEntity => {
                if let Some(adapter) = self.class.adapter() {
                    return Ok(adapter.get_attribute_value(&self.values, attribute)?);
                }
                Ok(self.values.get(attribute).cloned().unwrap_or(Value::Null))
            }
            AttributeKind::Calculated => {
                let hook = attr.on_get.as_ref().ok_or_else(|| {
                    DbError::invalid_operation("calculated attribute without on_get")
                })?;
                Ok(hook(&ValuesRef {
                    values: &self.values,
                })?)
            }
            AttributeKind::RelatedEntities => {
                let keys =
                    self.inner
                        .related_entity_keys(ctx, &self.class, &self.values, attribute)?;
                Ok(Value::Array(keys.iter().map(EntityKey::to_value).collect()))
            }
            AttributeKind::Alias => {
                let mut found =
                    self.inner
                        .record_path_values(ctx, &self.class, &self.values, attribute)?;
                let value = found.drain(..).next().unwrap_or(Value::Null);
                Ok(value)
            }
            AttributeKind::Removed => Ok(Value::Null),
        }
    }

    /// Writes an attribute value.
    ///
    /// Storage and N -> 1 relation attributes store directly (after
    /// `limiting_length` truncation); calculated attributes route through
    /// `on_set`; aliases and 1 -> N relations are not writable. Attribute
    /// set handlers fire after the write.
    ///
    /// # Errors
    ///
    /// Unknown or read-only attributes, hook failures.
    pub fn set(&mut self, attribute: &str, value: Value) -> DbResult<()> {
        let attr = self
            .class
            .def
            .attribute(attribute)
            .ok_or_else(|| DbError::unknown_attribute(self.class.name(), attribute))?
            .clone();
        if attr.read_only {
            return Err(DbError::ReadOnlyAttribute {
                class: self.class.name().to_owned(),
                attribute: attribute.to_owned(),
            });
        }
        match attr.kind {
            AttributeKind::Storage | AttributeKind::RelatedEntity => {
                let mut value = value;
                if let (Some(limit), Value::Text(text)) = (attr.limiting_length, &value) {
                    if text.chars().count() > limit {
                        value = Value::Text(text.chars().take(limit).collect());
                    }
                }
                match self.class.adapter() {
                    Some(adapter) => {
                        adapter.set_attribute_value(&mut self.values, attribute, value)?;
                    }
                    None => {
                        self.values.insert(attribute.to_owned(), value);
                    }
                }
                self.modified.insert(attribute.to_owned());
                let mut view = ValuesView {
                    values: &mut self.values,
                };
                for handler in attr.events.set_handlers() {
                    handler(&mut view).map_err(|e| DbError::Validation {
                        code: e.code,
                        messages: vec![e.message],
                    })?;
                }
                Ok(())
            }
            AttributeKind::Calculated => {
                let hook = attr.on_set.as_ref().ok_or_else(|| {
                    DbError::invalid_operation(format!(
                        "calculated attribute {attribute} has no on_set hook"
                    ))
                })?;
                let mut view = ValuesView {
                    values: &mut self.values,
                };
                hook(&mut view, value)?;
                self.modified.insert(attribute.to_owned());
                Ok(())
            }
            AttributeKind::Alias | AttributeKind::RelatedEntities | AttributeKind::Removed => {
                Err(DbError::invalid_operation(format!(
                    "attribute {attribute} is not writable"
                )))
            }
        }
    }

    /// Points an N -> 1 relation attribute at another entity.
    ///
    /// # Errors
    ///
    /// The target must have a key (saved at least once buffered) and the
    /// attribute must be a relation.
    pub fn set_related(&mut self, attribute: &str, target: &Entity) -> DbResult<()> {
        let key = target
            .get_key()
            .ok_or_else(|| DbError::invalid_operation("related entity has no key yet"))?;
        self.set(attribute, key.to_value())
    }

    /// Loads the entity an N -> 1 relation points at.
    ///
    /// # Errors
    ///
    /// Unknown attribute or backend failure.
    pub fn related_entity(
        &mut self,
        ctx: &ExecutionContext,
        attribute: &str,
    ) -> DbResult<Option<Entity>> {
        self.ensure_loaded(ctx)?;
        let attr = self
            .class
            .def
            .attribute(attribute)
            .ok_or_else(|| DbError::unknown_attribute(self.class.name(), attribute))?;
        let target = self.inner.class(attr.related_class().unwrap_or_default())?;

        if let Some(adapter) = self.class.adapter() {
            if let Some(row) = adapter.get_related_entity(&self.values, attribute)? {
                let key = target.row_key(&row)?;
                let stamp = adapter.get_stamp(&key)?;
                return Ok(Some(Entity::loaded(
                    Arc::clone(target),
                    Arc::clone(&self.inner),
                    key,
                    row,
                    stamp,
                )));
            }
        }

        let fk = self.values.get(attribute).cloned().unwrap_or(Value::Null);
        let Some(key) = EntityKey::from_value(&fk) else {
            return Ok(None);
        };
        match self.inner.load_record(ctx, target, &key)? {
            Some((values, stamp)) => Ok(Some(Entity::loaded(
                Arc::clone(target),
                Arc::clone(&self.inner),
                key,
                values,
                stamp,
            ))),
            None => Ok(None),
        }
    }

    /// Resolves a 1 -> N relation into a collection.
    ///
    /// # Errors
    ///
    /// Unknown attribute or backend failure.
    pub fn related_entities(
        &mut self,
        ctx: &ExecutionContext,
        attribute: &str,
    ) -> DbResult<EntityCollection> {
        self.ensure_loaded(ctx)?;
        let attr = self
            .class
            .def
            .attribute(attribute)
            .ok_or_else(|| DbError::unknown_attribute(self.class.name(), attribute))?;
        let target = self.inner.class(attr.related_class().unwrap_or_default())?;
        let keys = self
            .inner
            .related_entity_keys(ctx, &self.class, &self.values, attribute)?;
        Ok(EntityCollection::from_keys(
            Arc::clone(target),
            Arc::clone(&self.inner),
            keys,
            false,
        ))
    }

    /// Saves the entity.
    ///
    /// Pipeline: validation chain; then, at transaction level 0, the durable
    /// write (stamp check, save hooks, stamp + 1); inside a transaction the
    /// write is buffered, immediately visible to this context, with stamp
    /// and hook effects deferred to the outer commit. Saving an unmodified,
    /// non-new entity is a no-op.
    ///
    /// # Errors
    ///
    /// [`DbError::Validation`] from the chain, [`DbError::StampConflict`]
    /// when the stored record moved since load, adapter errors verbatim.
    pub fn save(&mut self, ctx: &ExecutionContext) -> DbResult<()> {
        if !self.is_new && self.modified.is_empty() {
            return Ok(());
        }
        self.ensure_loaded(ctx)?;

        if self.class.is_virtual() {
            return self.save_virtual();
        }

        let mut values = self.values.clone();
        let key = match &self.key {
            Some(k) => k.clone(),
            None => self.inner.assign_key(&self.class, &mut values)?,
        };
        self.values = values.clone();

        let expected = self.loaded_stamp;

        if ctx.buffering() {
            // the outer commit re-validates against whatever is stored by
            // then; this run catches bad records at save time
            {
                let map = self.class.store.read();
                validate_record(&self.class, &values, Some(&map), Some(&key))?;
            }
            trace!(class = self.class.name(), key = %key, "buffering save");
            ctx.record_write(
                self.class.id(),
                key.clone(),
                Pending::Save {
                    values,
                    expected_stamp: expected,
                    was_new: self.is_new,
                },
            );
            self.key = Some(key);
            self.is_new = false;
            self.modified.clear();
            self.saved_in_pass = true;
            return Ok(());
        }

        let pending = Pending::Save {
            values,
            expected_stamp: expected,
            was_new: self.is_new,
        };

        let mut writes = IndexMap::new();
        writes.insert((self.class.id(), key.clone()), pending);
        let applied = self.inner.commit_writes(writes)?;
        let stamp = applied
            .first()
            .map_or(expected + 1, |(_, _, stamp)| *stamp);

        // Save hooks may have rewritten the record; converge on the stored
        // form.
        if let Some((stored, _)) = self.inner.load_committed(&self.class, &key)? {
            self.values = stored;
        }
        self.key = Some(key);
        self.loaded_stamp = stamp;
        self.is_new = false;
        self.modified.clear();
        self.saved_in_pass = true;
        Ok(())
    }

    /// Adapter-backed saves run through the same validate/hook ordering but
    /// write straight to the source: remote writes sit outside the
    /// transaction discipline of the native store.
    fn save_virtual(&mut self) -> DbResult<()> {
        let adapter = self
            .class
            .adapter()
            .ok_or_else(|| DbError::invalid_operation("class has no adapter"))?
            .clone();
        let mut values = self.values.clone();
        validate_record(&self.class, &values, None, self.key.as_ref())?;
        run_save_hooks(&self.class, &mut values)?;

        let key = adapter.save_entity(self.key.as_ref(), &values)?;
        let stamp = adapter.get_stamp(&key)?;
        self.values = values;
        if let Some(row) = adapter.get_entity_by_key(&key)? {
            self.values = row;
        }
        self.key = Some(key);
        self.loaded_stamp = stamp;
        self.is_new = false;
        self.modified.clear();
        self.saved_in_pass = true;
        Ok(())
    }

    /// Removes the entity from the datastore (buffered inside a
    /// transaction). Outstanding collection references treat the key as
    /// logically absent afterwards.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] when the entity was never saved;
    /// adapter errors verbatim.
    pub fn remove(&mut self, ctx: &ExecutionContext) -> DbResult<()> {
        let Some(key) = self.key.clone() else {
            return Err(DbError::invalid_operation("entity has no key"));
        };

        if let Some(adapter) = self.class.adapter() {
            let mut doomed = self.values.clone();
            run_remove_hooks(&self.class, &mut doomed)?;
            adapter.drop_entity(&key)?;
        } else if ctx.buffering() {
            ctx.record_write(
                self.class.id(),
                key,
                Pending::Drop {
                    expected_stamp: self.loaded_stamp,
                },
            );
        } else {
            let mut writes = IndexMap::new();
            writes.insert(
                (self.class.id(), key),
                Pending::Drop {
                    expected_stamp: self.loaded_stamp,
                },
            );
            self.inner.commit_writes(writes)?;
        }
        self.modified.clear();
        self.loaded = false;
        Ok(())
    }

    /// Reloads the entity as stored, discarding unsaved modifications.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn refresh(&mut self, ctx: &ExecutionContext) -> DbResult<()> {
        let Some(key) = self.key.clone() else {
            return Ok(());
        };
        if let Some(adapter) = self.class.adapter() {
            let adapter = Arc::clone(adapter);
            match adapter.refresh_entity(&key)? {
                Some(row) => {
                    self.values = row;
                    self.loaded_stamp = adapter.get_stamp(&key)?;
                    self.loaded = true;
                    self.is_new = false;
                    self.modified.clear();
                }
                None => {
                    self.loaded = false;
                    self.modified.clear();
                }
            }
            return Ok(());
        }
        match self.inner.load_record(ctx, &self.class, &key)? {
            Some((values, stamp)) => {
                self.values = values;
                self.loaded_stamp = stamp;
                self.loaded = true;
                self.is_new = false;
                self.modified.clear();
            }
            None => {
                self.loaded = false;
                self.modified.clear();
            }
        }
        Ok(())
    }

    /// Evicts the record from this handle; the next access transparently
    /// reloads it.
    pub fn release(&mut self) {
        self.values.clear();
        self.modified.clear();
        self.loaded = false;
    }

    /// Tries to take the advisory lock on this entity for the calling
    /// context. Always true when the context already holds it.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] when the entity was never saved.
    pub fn lock(&self, ctx: &ExecutionContext) -> DbResult<bool> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| DbError::invalid_operation("entity has no key"))?;
        Ok(self.inner.locks.lock(self.class.id(), key, ctx.id()))
    }

    /// Releases the advisory lock when this context owns it; idempotent
    /// otherwise.
    pub fn unlock(&self, ctx: &ExecutionContext) {
        if let Some(key) = &self.key {
            self.inner.locks.unlock(self.class.id(), key, ctx.id());
        }
    }

    /// Runs the validation chain without saving.
    ///
    /// # Errors
    ///
    /// [`DbError::Validation`] describing the first rejection.
    pub fn validate(&self) -> DbResult<()> {
        if self.class.is_virtual() {
            validate_record(&self.class, &self.values, None, self.key.as_ref())
        } else {
            let map = self.class.store.read();
            validate_record(&self.class, &self.values, Some(&map), self.key.as_ref())
        }
    }

    /// Engine-internal write that bypasses the read-only check (imports and
    /// `fromArray` rows may carry primary keys).
    pub(crate) fn set_raw(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_owned(), value);
        self.modified.insert(name.to_owned());
    }

    pub(crate) fn begin_pass(&mut self) {
        self.saved_in_pass = false;
    }

    pub(crate) fn saved_in_pass(&self) -> bool {
        self.saved_in_pass
    }

    pub(crate) fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("class", &self.class.name())
            .field("key", &self.key)
            .field("stamp", &self.loaded_stamp)
            .field("is_new", &self.is_new)
            .field("is_modified", &self.is_modified())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use savanna_model::{Attribute, Catalog, DataClassDef, ScalarType as St};

    fn class_rt() -> Arc<ClassRt> {
        let catalog = Catalog::new()
            .class(
                DataClassDef::new("Country")
                    .attribute(
                        Attribute::storage("name", St::Text)
                            .not_null()
                            .unique()
                            .max_length(10),
                    )
                    .attribute(
                        Attribute::storage("population", St::Long).range(Some(0.0), None),
                    ),
            )
            .unwrap()
            .seal()
            .unwrap();
        let ds = crate::engine::Datastore::new(catalog);
        Arc::clone(ds.dataclass("Country").unwrap().class())
    }

    fn values(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn structural_failures_accumulate() {
        let class = class_rt();
        let bad = values(&[
            ("name", Value::Text("a string too long".into())),
            ("population", Value::Long(-5)),
        ]);
        let map = class.store.read();
        let err = validate_record(&class, &bad, Some(&map), None).unwrap_err();
        match err {
            DbError::Validation { code, messages } => {
                assert_eq!(code, ERR_LENGTH);
                assert_eq!(messages.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn not_null_rejects_missing_value() {
        let class = class_rt();
        let map = class.store.read();
        let err = validate_record(&class, &values(&[]), Some(&map), None).unwrap_err();
        assert!(matches!(err, DbError::Validation { code: ERR_NOT_NULL, .. }));
    }
}
