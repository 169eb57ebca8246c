//! The datastore engine: runtime class state, record access with
//! transaction overlays, the durable commit path, and the public
//! [`Datastore`] / [`DataClass`] facade.

use crate::adapter::{AttrRow, VirtualAdapter};
use crate::collection::EntityCollection;
use crate::context::ExecutionContext;
use crate::entity::{self, Entity};
use crate::error::{DbError, DbResult};
use crate::export;
use crate::index::ClassIndexes;
use crate::locks::LockTable;
use crate::query::{self, QueryOptions};
use crate::storage::{NamedStorage, StorageRegistry};
use crate::store::{self, NativeStore};
use crate::transaction::Pending;
use crate::types::{ContextId, EntityKey};
use indexmap::IndexMap;
use parking_lot::RwLock;
use savanna_model::{
    AttributeKind, ClassId, ClassScope, Record, RecordMut, ResolvedClass, SealedCatalog, Value,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;

/// Host-provided evaluator for `$`-prefixed query clauses
/// (`allowJavascript`). Receives the clause text and the candidate record.
pub type JsEval = Arc<dyn Fn(&str, &dyn Record) -> DbResult<bool> + Send + Sync>;

/// Read-only hook view over a raw values map.
pub(crate) struct ValuesRef<'a> {
    pub values: &'a IndexMap<String, Value>,
}

impl Record for ValuesRef<'_> {
    fn attribute(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// Mutable hook view over a raw values map.
pub(crate) struct ValuesView<'a> {
    pub values: &'a mut IndexMap<String, Value>,
}

impl Record for ValuesView<'_> {
    fn attribute(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

impl RecordMut for ValuesView<'_> {
    fn set_attribute(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_owned(), value);
    }
}

/// Runtime state of one class: schema, native store, secondary indexes and
/// the optional virtual backend.
pub(crate) struct ClassRt {
    pub def: ResolvedClass,
    pub store: NativeStore,
    pub indexes: RwLock<ClassIndexes>,
    adapter: OnceLock<Arc<dyn VirtualAdapter>>,
    page_length: AtomicUsize,
}

impl ClassRt {
    fn new(def: ResolvedClass) -> Self {
        let store = NativeStore::new(def.auto_sequence_start);
        let indexes = RwLock::new(ClassIndexes::new(&def));
        let page_length = AtomicUsize::new(def.page_length);
        Self {
            def,
            store,
            indexes,
            adapter: OnceLock::new(),
            page_length,
        }
    }

    pub(crate) fn id(&self) -> ClassId {
        self.def.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.def.name
    }

    pub(crate) fn adapter(&self) -> Option<&Arc<dyn VirtualAdapter>> {
        self.adapter.get()
    }

    pub(crate) fn is_virtual(&self) -> bool {
        self.adapter.get().is_some()
    }

    fn set_adapter(&self, adapter: Arc<dyn VirtualAdapter>) -> DbResult<()> {
        self.adapter
            .set(adapter)
            .map_err(|_| DbError::invalid_operation(format!("{} already has an adapter", self.name())))
    }

    pub(crate) fn page_length(&self) -> usize {
        self.page_length.load(Ordering::Relaxed)
    }

    pub(crate) fn set_page_length(&self, len: usize) {
        self.page_length.store(len, Ordering::Relaxed);
    }

    /// Extracts the primary key from an adapter row.
    pub(crate) fn row_key(&self, row: &AttrRow) -> DbResult<EntityKey> {
        row.get(&self.def.primary_key)
            .and_then(EntityKey::from_value)
            .ok_or_else(|| {
                DbError::adapter(format!(
                    "row from {} is missing its primary key {}",
                    self.name(),
                    self.def.primary_key
                ))
            })
    }
}

/// Shared engine state behind the public handles.
pub(crate) struct DatastoreInner {
    classes: Vec<Arc<ClassRt>>,
    by_name: HashMap<String, ClassId>,
    pub locks: LockTable,
    pub storages: StorageRegistry,
    next_context: AtomicU64,
    pub js_eval: OnceLock<JsEval>,
}

impl DatastoreInner {
    pub(crate) fn class(&self, name: &str) -> DbResult<&Arc<ClassRt>> {
        self.by_name
            .get(name)
            .map(|id| &self.classes[id.as_u32() as usize])
            .ok_or_else(|| DbError::unknown_class(name))
    }

    pub(crate) fn class_by_id(&self, id: ClassId) -> &Arc<ClassRt> {
        &self.classes[id.as_u32() as usize]
    }

    pub(crate) fn classes(&self) -> &[Arc<ClassRt>] {
        &self.classes
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId::new(self.next_context.fetch_add(1, Ordering::SeqCst))
    }

    /// Loads one record through the calling context's transaction overlay.
    /// `Ok(None)` means logically absent (never saved, or removed).
    pub(crate) fn load_record(
        &self,
        ctx: &ExecutionContext,
        class: &ClassRt,
        key: &EntityKey,
    ) -> DbResult<Option<(IndexMap<String, Value>, u64)>> {
        if let Some(pending) = ctx.pending_for(class.id(), key) {
            return Ok(match pending {
                Pending::Save {
                    values,
                    expected_stamp,
                    ..
                } => Some((values, expected_stamp)),
                Pending::Drop { .. } => None,
            });
        }
        self.load_committed(class, key)
    }

    /// Loads one record from the class backend, ignoring any overlay.
    pub(crate) fn load_committed(
        &self,
        class: &ClassRt,
        key: &EntityKey,
    ) -> DbResult<Option<(IndexMap<String, Value>, u64)>> {
        if let Some(adapter) = class.adapter() {
            let row = adapter.get_entity_by_key(key)?;
            return match row {
                Some(row) => {
                    let stamp = adapter.get_stamp(key)?;
                    Ok(Some((row, stamp)))
                }
                None => Ok(None),
            };
        }
        Ok(class.store.get(key).map(|r| (r.values, r.stamp)))
    }

    /// The class extent visible to `ctx`: committed keys plus buffered
    /// creations, minus buffered removals.
    pub(crate) fn class_extent(
        &self,
        ctx: &ExecutionContext,
        class: &ClassRt,
    ) -> DbResult<Vec<EntityKey>> {
        let mut keys = self.committed_extent(class)?;
        let overlay = ctx.overlay_for(class.id());
        if !overlay.is_empty() {
            for (key, pending) in overlay {
                match pending {
                    Pending::Save { .. } => {
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                    Pending::Drop { .. } => keys.retain(|k| *k != key),
                }
            }
        }
        Ok(keys)
    }

    /// The committed class extent from the backend.
    pub(crate) fn committed_extent(&self, class: &ClassRt) -> DbResult<Vec<EntityKey>> {
        if let Some(adapter) = class.adapter() {
            let rows = adapter.all_entities()?;
            return rows.iter().map(|row| class.row_key(row)).collect();
        }
        Ok(class.store.keys())
    }

    /// Resolves a dotted attribute path against one record, fanning out
    /// through object values and relations. Returns every reachable value.
    pub(crate) fn record_path_values(
        &self,
        ctx: &ExecutionContext,
        class: &Arc<ClassRt>,
        values: &IndexMap<String, Value>,
        path: &str,
    ) -> DbResult<Vec<Value>> {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        let attr = class
            .def
            .attribute(head)
            .ok_or_else(|| DbError::unknown_attribute(class.name(), head))?;

        let leaf = |value: Value| -> Vec<Value> {
            match rest {
                None => vec![value],
                Some(rest) => value.walk_path(rest).into_iter().cloned().collect(),
            }
        };

        match attr.kind {
            AttributeKind::Storage => {
                let value = match class.adapter() {
                    Some(adapter) => adapter.get_attribute_value(values, head)?,
                    None => values.get(head).cloned().unwrap_or(Value::Null),
                };
                Ok(leaf(value))
            }
            AttributeKind::Calculated => {
                let hook = attr
                    .on_get
                    .as_ref()
                    .ok_or_else(|| DbError::invalid_operation("calculated attribute without on_get"))?;
                let computed = hook(&ValuesRef { values })?;
                Ok(leaf(computed))
            }
            AttributeKind::Alias => {
                let alias_path = attr.path.as_deref().unwrap_or_default();
                let full = match rest {
                    Some(rest) => format!("{alias_path}.{rest}"),
                    None => alias_path.to_owned(),
                };
                self.record_path_values(ctx, class, values, &full)
            }
            AttributeKind::RelatedEntity => {
                let related_key = match class.adapter() {
                    Some(adapter) => adapter.get_related_key(values, head)?,
                    None => values.get(head).and_then(EntityKey::from_value),
                };
                match rest {
                    None => Ok(vec![related_key
                        .map(|k| k.to_value())
                        .unwrap_or(Value::Null)]),
                    Some(rest) => {
                        let Some(key) = related_key else {
                            return Ok(Vec::new());
                        };
                        let target = self.class(attr.related_class().unwrap_or_default())?;
                        match self.load_record(ctx, target, &key)? {
                            Some((related, _)) => {
                                self.record_path_values(ctx, target, &related, rest)
                            }
                            None => Ok(Vec::new()),
                        }
                    }
                }
            }
            AttributeKind::RelatedEntities => {
                let keys = self.related_entity_keys(ctx, class, values, attr.name.as_str())?;
                let target = self.class(attr.related_class().unwrap_or_default())?;
                let mut out = Vec::new();
                for key in keys {
                    match rest {
                        None => out.push(key.to_value()),
                        Some(rest) => {
                            if let Some((related, _)) = self.load_record(ctx, target, &key)? {
                                out.extend(self.record_path_values(ctx, target, &related, rest)?);
                            }
                        }
                    }
                }
                Ok(out)
            }
            AttributeKind::Removed => Ok(Vec::new()),
        }
    }

    /// Resolves a 1 -> N relation to the related entity keys.
    pub(crate) fn related_entity_keys(
        &self,
        ctx: &ExecutionContext,
        class: &Arc<ClassRt>,
        values: &IndexMap<String, Value>,
        attribute: &str,
    ) -> DbResult<Vec<EntityKey>> {
        let attr = class
            .def
            .attribute(attribute)
            .ok_or_else(|| DbError::unknown_attribute(class.name(), attribute))?;
        if let Some(adapter) = class.adapter() {
            if let Some(rows) = adapter.get_related_entities(values, attribute)? {
                let target = self.class(attr.related_class().unwrap_or_default())?;
                return rows.iter().map(|row| target.row_key(row)).collect();
            }
        }
        let my_key = values
            .get(&class.def.primary_key)
            .cloned()
            .unwrap_or(Value::Null);
        if my_key.is_null() {
            return Ok(Vec::new());
        }
        let reverse = attr.path.as_deref().unwrap_or_default();
        let target = self.class(attr.related_class().unwrap_or_default())?;
        let mut keys = Vec::new();
        for key in self.class_extent(ctx, target)? {
            if let Some((related, _)) = self.load_record(ctx, target, &key)? {
                let fk = related.get(reverse).cloned().unwrap_or(Value::Null);
                if fk.compare(&my_key) == Some(std::cmp::Ordering::Equal) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Establishes the primary key for a record about to be saved, drawing
    /// on the class autosequence or UUID generation when needed.
    pub(crate) fn assign_key(
        &self,
        class: &ClassRt,
        values: &mut IndexMap<String, Value>,
    ) -> DbResult<EntityKey> {
        let pk = class.def.primary_key_attribute();
        if let Some(v) = values.get(&pk.name) {
            if !v.is_null() {
                if let Some(key) = EntityKey::from_value(v) {
                    return Ok(key);
                }
            }
        }
        if pk.autosequence {
            let n = class.store.next_sequence();
            values.insert(pk.name.clone(), Value::Long(n));
            Ok(EntityKey::Long(n))
        } else if pk.autogenerate {
            let u = Uuid::new_v4();
            values.insert(pk.name.clone(), Value::Uuid(u));
            Ok(EntityKey::Uuid(u))
        } else {
            Err(DbError::validation(
                entity::ERR_KEY,
                format!("primary key {}.{} is not set", class.name(), pk.name),
            ))
        }
    }

    /// Durably applies a buffered write set, atomically.
    ///
    /// All involved store locks are taken (in class order) before anything
    /// is checked; every stamp check and the whole validation chain run
    /// first, so a failure anywhere rejects the entire set with no partial
    /// write. Save hooks fire between validation and the write, class save
    /// handlers before attribute save handlers.
    ///
    /// Returns `(class, key, new_stamp)` for every applied save.
    pub(crate) fn commit_writes(
        &self,
        writes: IndexMap<(ClassId, EntityKey), Pending>,
    ) -> DbResult<Vec<(ClassId, EntityKey, u64)>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        debug!(writes = writes.len(), "flushing buffered writes");

        let mut involved: Vec<ClassId> = writes.keys().map(|(c, _)| *c).collect();
        involved.sort_unstable();
        involved.dedup();

        let lock_order: Vec<&Arc<ClassRt>> =
            involved.iter().map(|id| self.class_by_id(*id)).collect();
        let mut guards: Vec<_> = lock_order.iter().map(|c| c.store.write()).collect();
        let slot = |id: ClassId| involved.iter().position(|c| *c == id).unwrap_or(0);

        // Check phase: stamps first, then the validation chain, including
        // unique collisions inside the batch itself.
        for ((class_id, key), pending) in &writes {
            let class = self.class_by_id(*class_id);
            let map = &guards[slot(*class_id)];
            match pending {
                Pending::Save {
                    values,
                    expected_stamp,
                    ..
                } => {
                    store::check_stamp(map, class.name(), key, *expected_stamp)?;
                    entity::validate_record(class, values, Some(map), Some(key))?;
                }
                Pending::Drop { expected_stamp } => {
                    if map.contains_key(key) {
                        store::check_stamp(map, class.name(), key, *expected_stamp)?;
                    }
                }
            }
        }
        self.check_batch_unique(&writes)?;

        // Apply phase: hooks, then the write, then index maintenance.
        let mut applied = Vec::new();
        for ((class_id, key), pending) in writes {
            let class = self.class_by_id(class_id);
            let map = &mut guards[slot(class_id)];
            match pending {
                Pending::Save { mut values, .. } => {
                    entity::run_save_hooks(class, &mut values)?;
                    let old = map.get(&key).map(|r| r.values.clone());
                    let stamp = store::apply_put(map, key.clone(), values.clone());
                    let mut indexes = class.indexes.write();
                    if let Some(old) = old {
                        indexes.remove_record(&key, &old);
                    }
                    indexes.insert_record(&key, &values);
                    applied.push((class_id, key, stamp));
                }
                Pending::Drop { .. } => {
                    if let Some(record) = map.get(&key) {
                        let mut doomed = record.values.clone();
                        entity::run_remove_hooks(class, &mut doomed)?;
                    }
                    if let Some(removed) = store::apply_remove(map, &key) {
                        class.indexes.write().remove_record(&key, &removed.values);
                    }
                }
            }
        }
        Ok(applied)
    }

    fn check_batch_unique(
        &self,
        writes: &IndexMap<(ClassId, EntityKey), Pending>,
    ) -> DbResult<()> {
        for ((class_id, key), pending) in writes {
            let Pending::Save { values, .. } = pending else {
                continue;
            };
            let class = self.class_by_id(*class_id);
            for attr in class.def.attributes.values().filter(|a| a.unique) {
                let Some(value) = values.get(&attr.name) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                let clash = writes.iter().any(|((c2, k2), p2)| {
                    c2 == class_id
                        && k2 != key
                        && matches!(p2, Pending::Save { values: v2, .. }
                            if v2.get(&attr.name).is_some_and(|v| v.compare(value) == Some(std::cmp::Ordering::Equal)))
                });
                if clash {
                    return Err(DbError::validation(
                        entity::ERR_UNIQUE,
                        format!("{}.{} must be unique", class.name(), attr.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// The datastore: the primary entry point of the engine.
///
/// A `Datastore` is built from a sealed catalog, hands out one
/// [`ExecutionContext`] per logical worker, and exposes classes through
/// [`DataClass`] handles.
///
/// ```rust,ignore
/// let ds = Datastore::new(catalog);
/// let ctx = ds.context();
/// let employees = ds.dataclass("Employee")?;
/// let high = employees.query(&ctx, "salary > :1", &[Value::Long(5000)], &QueryOptions::default())?;
/// ```
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<DatastoreInner>,
}

impl Datastore {
    /// Builds a datastore over a sealed catalog. Every class starts on the
    /// native in-memory engine; attach adapters with
    /// [`Datastore::register_adapter`] before first use of the class.
    #[must_use]
    pub fn new(catalog: SealedCatalog) -> Self {
        let classes: Vec<Arc<ClassRt>> = catalog
            .classes()
            .map(|def| Arc::new(ClassRt::new(def.clone())))
            .collect();
        let by_name = classes
            .iter()
            .map(|c| (c.name().to_owned(), c.id()))
            .collect();
        Self {
            inner: Arc::new(DatastoreInner {
                classes,
                by_name,
                locks: LockTable::new(),
                storages: StorageRegistry::new(),
                next_context: AtomicU64::new(1),
                js_eval: OnceLock::new(),
            }),
        }
    }

    /// Creates a new execution context. Each logical worker owns one; it
    /// carries the transaction stack and identifies lock ownership.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.inner.next_context_id(), Arc::clone(&self.inner))
    }

    /// Resolves a class handle by name.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownClass`] when the catalog has no such class.
    pub fn dataclass(&self, name: &str) -> DbResult<DataClass> {
        let class = self.inner.class(name)?;
        Ok(DataClass {
            class: Arc::clone(class),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Names of every class, in catalog order.
    #[must_use]
    pub fn dataclasses(&self) -> Vec<String> {
        self.inner
            .classes()
            .iter()
            .map(|c| c.name().to_owned())
            .collect()
    }

    /// Delegates a class to a virtual backend adapter. May be called once
    /// per class, before the class is used.
    ///
    /// # Errors
    ///
    /// Fails when the class is unknown or already delegated.
    pub fn register_adapter(
        &self,
        class: &str,
        adapter: Arc<dyn VirtualAdapter>,
    ) -> DbResult<()> {
        self.inner.class(class)?.set_adapter(adapter)
    }

    /// Installs the evaluator backing `$`-prefixed query clauses. Without
    /// one, `allow_javascript` queries fail with a query error.
    pub fn set_script_evaluator(&self, eval: JsEval) {
        let _ = self.inner.js_eval.set(eval);
    }

    /// Returns the named storage space, creating it on first use.
    #[must_use]
    pub fn get_storage(&self, id: &str) -> Arc<NamedStorage> {
        self.inner.storages.get(id)
    }

    /// Deletes a named storage space.
    pub fn remove_storage(&self, id: &str) {
        self.inner.storages.remove(id);
    }

    /// Exports every non-derived class to `<dir>/<Class>.json`.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn export_as_json(&self, dir: &Path) -> DbResult<()> {
        export::export_datastore_json(&self.inner, dir)
    }

    /// Imports every `<Class>.json` file found in `dir`.
    ///
    /// # Errors
    ///
    /// Propagates I/O and format failures.
    pub fn import_from_json(&self, dir: &Path) -> DbResult<()> {
        export::import_datastore_json(&self.inner, dir)
    }

    /// Exports every non-derived class to `<dir>/<Class>.sql`.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn export_as_sql(&self, dir: &Path) -> DbResult<()> {
        export::export_datastore_sql(&self.inner, dir)
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("classes", &self.dataclasses())
            .finish()
    }
}

/// Handle to one datastore class.
pub struct DataClass {
    pub(crate) class: Arc<ClassRt>,
    pub(crate) inner: Arc<DatastoreInner>,
}

impl DataClass {
    /// The class name.
    #[must_use]
    pub fn get_name(&self) -> &str {
        self.class.name()
    }

    /// The class scope.
    #[must_use]
    pub fn get_scope(&self) -> ClassScope {
        self.class.def.scope
    }

    /// Number of entities visible to `ctx`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn length(&self, ctx: &ExecutionContext) -> DbResult<usize> {
        if let Some(adapter) = self.class.adapter() {
            if !ctx.touches_class(self.class.id()) {
                return Ok(adapter.count_entities()?);
            }
        }
        Ok(self.inner.class_extent(ctx, &self.class)?.len())
    }

    /// All entities of the class, as an unsorted collection.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn all(&self, ctx: &ExecutionContext) -> DbResult<EntityCollection> {
        let keys = self.inner.class_extent(ctx, &self.class)?;
        Ok(EntityCollection::from_keys(
            Arc::clone(&self.class),
            Arc::clone(&self.inner),
            keys,
            false,
        ))
    }

    /// Runs a textual query against the whole class.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError::Query`] for grammar or planning failures, and
    /// propagates backend failures.
    pub fn query(
        &self,
        ctx: &ExecutionContext,
        query_string: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> DbResult<EntityCollection> {
        query::run_query(
            &self.inner,
            ctx,
            &self.class,
            query_string,
            params,
            options,
            None,
        )
    }

    /// `query` followed by taking the first result; no separate code path.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`DataClass::query`].
    pub fn find(
        &self,
        ctx: &ExecutionContext,
        query_string: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> DbResult<Option<Entity>> {
        self.query(ctx, query_string, params, options)?.first(ctx)
    }

    /// The first entity of the class extent, if any.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn first(&self, ctx: &ExecutionContext) -> DbResult<Option<Entity>> {
        self.all(ctx)?.first(ctx)
    }

    /// Sorts the whole class extent; see [`EntityCollection::order_by`].
    ///
    /// # Errors
    ///
    /// Same failure modes as the collection-level sort.
    pub fn order_by(&self, ctx: &ExecutionContext, spec: &str) -> DbResult<EntityCollection> {
        self.all(ctx)?.order_by(ctx, spec)
    }

    /// Visits every entity of the class; see [`EntityCollection::for_each`].
    ///
    /// # Errors
    ///
    /// Propagates callback, validation and backend failures.
    pub fn for_each<F>(&self, ctx: &ExecutionContext, f: F) -> DbResult<()>
    where
        F: FnMut(&mut Entity, usize) -> DbResult<()>,
    {
        self.all(ctx)?.for_each(ctx, f)
    }

    /// Sum of an attribute over the whole class.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn sum(&self, ctx: &ExecutionContext, attribute: &str, distinct: bool) -> DbResult<f64> {
        self.all(ctx)?.sum(ctx, attribute, distinct)
    }

    /// Average of an attribute over the whole class.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn average(
        &self,
        ctx: &ExecutionContext,
        attribute: &str,
        distinct: bool,
    ) -> DbResult<Option<f64>> {
        self.all(ctx)?.average(ctx, attribute, distinct)
    }

    /// Smallest attribute value over the whole class.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn min(&self, ctx: &ExecutionContext, attribute: &str) -> DbResult<Option<Value>> {
        self.all(ctx)?.min(ctx, attribute)
    }

    /// Largest attribute value over the whole class.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn max(&self, ctx: &ExecutionContext, attribute: &str) -> DbResult<Option<Value>> {
        self.all(ctx)?.max(ctx, attribute)
    }

    /// Every statistical calculation for the listed attributes in one pass.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn compute(
        &self,
        ctx: &ExecutionContext,
        attributes: &str,
    ) -> DbResult<IndexMap<String, crate::collection::ComputeStats>> {
        self.all(ctx)?.compute(ctx, attributes)
    }

    /// Distinct values of an attribute over the whole class, sorted.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn distinct_values(
        &self,
        ctx: &ExecutionContext,
        attribute: &str,
    ) -> DbResult<Vec<Value>> {
        self.all(ctx)?.distinct_values(ctx, attribute)
    }

    /// Creates a new, unsaved entity: default values applied, init handlers
    /// fired, `is_new` set.
    ///
    /// # Errors
    ///
    /// Surfaces init-handler failures.
    pub fn create_entity(&self) -> DbResult<Entity> {
        Entity::create(Arc::clone(&self.class), Arc::clone(&self.inner))
    }

    /// Creates an empty collection attached to the class.
    ///
    /// # Errors
    ///
    /// Propagates the adapter's `new_collection` failure for virtual
    /// classes.
    pub fn create_entity_collection(&self, keep_sorted: bool) -> DbResult<EntityCollection> {
        if let Some(adapter) = self.class.adapter() {
            adapter.new_collection()?;
        }
        Ok(EntityCollection::from_keys(
            Arc::clone(&self.class),
            Arc::clone(&self.inner),
            Vec::new(),
            keep_sorted,
        ))
    }

    /// Loads the entity at a position of the class extent. `Ok(None)` past
    /// the end.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn get_entity_by_pos(
        &self,
        ctx: &ExecutionContext,
        pos: usize,
    ) -> DbResult<Option<Entity>> {
        if let Some(adapter) = self.class.adapter() {
            return match adapter.get_entity_by_pos(pos)? {
                Some(row) => {
                    let key = self.class.row_key(&row)?;
                    let stamp = adapter.get_stamp(&key)?;
                    Ok(Some(Entity::loaded(
                        Arc::clone(&self.class),
                        Arc::clone(&self.inner),
                        key,
                        row,
                        stamp,
                    )))
                }
                None => Ok(None),
            };
        }
        let keys = self.inner.class_extent(ctx, &self.class)?;
        match keys.get(pos) {
            Some(key) => self.get_entity_by_key(ctx, key),
            None => Ok(None),
        }
    }

    /// Loads one entity by primary key. `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn get_entity_by_key(
        &self,
        ctx: &ExecutionContext,
        key: &EntityKey,
    ) -> DbResult<Option<Entity>> {
        match self.inner.load_record(ctx, &self.class, key)? {
            Some((values, stamp)) => Ok(Some(Entity::loaded(
                Arc::clone(&self.class),
                Arc::clone(&self.inner),
                key.clone(),
                values,
                stamp,
            ))),
            None => Ok(None),
        }
    }

    /// Generates and saves one entity per row, returning the new collection.
    /// Rows carrying `__KEY` (and optionally `__STAMP`) update existing
    /// entities instead.
    ///
    /// # Errors
    ///
    /// Propagates validation and backend failures.
    pub fn from_array(
        &self,
        ctx: &ExecutionContext,
        rows: &[serde_json::Value],
    ) -> DbResult<EntityCollection> {
        export::from_array(&self.inner, ctx, &self.class, rows)
    }

    /// Projects the whole class extent into flat rows; see
    /// [`EntityCollection::to_array`].
    ///
    /// # Errors
    ///
    /// Propagates path-resolution and backend failures.
    pub fn to_array(
        &self,
        ctx: &ExecutionContext,
        attribute_list: &str,
        sort_list: Option<&str>,
        include_key_stamp: bool,
        skip: Option<usize>,
        top: Option<usize>,
    ) -> DbResult<Vec<serde_json::Value>> {
        self.all(ctx)?
            .to_array(ctx, attribute_list, sort_list, include_key_stamp, skip, top)
    }

    /// Removes every entity of the class. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn remove(&self, ctx: &ExecutionContext) -> DbResult<usize> {
        self.all(ctx)?.remove(ctx)
    }

    /// (Re)sets the autosequence counter.
    pub fn set_auto_sequence_number(&self, counter: i64) {
        self.class.store.set_sequence(counter);
    }

    /// Default page length for query results of this class.
    #[must_use]
    pub fn get_collection_page_length(&self) -> usize {
        self.class.page_length()
    }

    /// Sets the default page length for query results of this class.
    pub fn set_collection_page_length(&self, len: usize) {
        self.class.set_page_length(len);
    }

    /// Exports the class extent to one JSON file.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn export_as_json(&self, dir: &Path) -> DbResult<()> {
        export::export_class_json(&self.inner, &self.class, dir)
    }

    /// Imports the class's JSON file from `dir`.
    ///
    /// # Errors
    ///
    /// Propagates I/O and format failures.
    pub fn import_from_json(&self, dir: &Path) -> DbResult<()> {
        export::import_class_json(&self.inner, &self.class, dir)
    }

    /// Exports the class extent to one SQL file.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn export_as_sql(&self, dir: &Path) -> DbResult<()> {
        export::export_class_sql(&self.inner, &self.class, dir)
    }
}

impl DataClass {
    pub(crate) fn class(&self) -> &Arc<ClassRt> {
        &self.class
    }
}

impl std::fmt::Debug for DataClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataClass")
            .field("name", &self.get_name())
            .field("virtual", &self.class.is_virtual())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use savanna_model::{Attribute, Catalog, DataClassDef, ScalarType};

    fn employee_ds() -> Datastore {
        let catalog = Catalog::new()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::storage("lastName", ScalarType::Text))
                    .attribute(Attribute::storage("salary", ScalarType::Number)),
            )
            .unwrap()
            .seal()
            .unwrap();
        Datastore::new(catalog)
    }

    #[test]
    fn unknown_class_is_an_error() {
        let ds = employee_ds();
        assert!(matches!(
            ds.dataclass("Nope"),
            Err(DbError::UnknownClass { .. })
        ));
    }

    #[test]
    fn assign_key_draws_from_autosequence() {
        let ds = employee_ds();
        let class = Arc::clone(ds.inner.class("Employee").unwrap());
        let mut values = IndexMap::new();
        let k1 = ds.inner.assign_key(&class, &mut values).unwrap();
        let mut values2 = IndexMap::new();
        let k2 = ds.inner.assign_key(&class, &mut values2).unwrap();
        assert_eq!(k1, EntityKey::Long(1));
        assert_eq!(k2, EntityKey::Long(2));
        assert_eq!(values.get("ID"), Some(&Value::Long(1)));
    }

    #[test]
    fn commit_writes_stamps_and_stores() {
        let ds = employee_ds();
        let class = Arc::clone(ds.inner.class("Employee").unwrap());
        let mut values = IndexMap::new();
        values.insert("lastName".to_owned(), Value::Text("Smith".into()));
        let key = ds.inner.assign_key(&class, &mut values).unwrap();

        let mut writes = IndexMap::new();
        writes.insert(
            (class.id(), key.clone()),
            Pending::Save {
                values,
                expected_stamp: 0,
                was_new: true,
            },
        );
        let applied = ds.inner.commit_writes(writes).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].2, 1);
        assert_eq!(class.store.get(&key).unwrap().stamp, 1);
    }

    #[test]
    fn stale_batch_rejects_everything() {
        let ds = employee_ds();
        let class = Arc::clone(ds.inner.class("Employee").unwrap());

        // seed one committed record
        let mut seed = IndexMap::new();
        seed.insert("lastName".to_owned(), Value::Text("A".into()));
        let key = ds.inner.assign_key(&class, &mut seed).unwrap();
        let mut writes = IndexMap::new();
        writes.insert(
            (class.id(), key.clone()),
            Pending::Save {
                values: seed.clone(),
                expected_stamp: 0,
                was_new: true,
            },
        );
        ds.inner.commit_writes(writes).unwrap();

        // a batch with one good write and one stale write
        let mut fresh = IndexMap::new();
        fresh.insert("lastName".to_owned(), Value::Text("B".into()));
        let key2 = ds.inner.assign_key(&class, &mut fresh).unwrap();
        let mut batch = IndexMap::new();
        batch.insert(
            (class.id(), key2.clone()),
            Pending::Save {
                values: fresh,
                expected_stamp: 0,
                was_new: true,
            },
        );
        batch.insert(
            (class.id(), key.clone()),
            Pending::Save {
                values: seed,
                expected_stamp: 0, // stale: committed stamp is 1
                was_new: true,
            },
        );
        let err = ds.inner.commit_writes(batch).unwrap_err();
        assert!(matches!(err, DbError::StampConflict { .. }));
        // nothing from the batch landed
        assert!(class.store.get(&key2).is_none());
    }
}
