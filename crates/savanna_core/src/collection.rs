//! Entity collections: set algebra, ordering, iteration, aggregation and
//! projection.

use crate::adapter::SortDirective;
use crate::context::ExecutionContext;
use crate::engine::{ClassRt, DatastoreInner};
use crate::entity::Entity;
use crate::error::{DbError, DbResult};
use crate::export::value_to_json;
use crate::query::{self, QueryOptions};
use crate::types::EntityKey;
use indexmap::{IndexMap, IndexSet};
use savanna_model::{AttributeKind, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// Statistics produced by [`EntityCollection::compute`] for one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeStats {
    /// Number of non-null values.
    pub count: usize,
    /// Number of distinct non-null values.
    pub count_distinct: usize,
    /// Sum of the numeric values.
    pub sum: f64,
    /// Sum over distinct values only.
    pub sum_distinct: f64,
    /// Arithmetic average, `None` when no values.
    pub average: Option<f64>,
    /// Average over distinct values only.
    pub average_distinct: Option<f64>,
    /// Smallest value.
    pub min: Option<Value>,
    /// Largest value.
    pub max: Option<Value>,
}

/// An ordered or unordered multiset of entity references.
///
/// Unordered collections permit duplicate membership; sorted collections
/// (`keep_sorted`) are deduplicated and ordered by the last applied
/// `order_by`. Set algebra always yields unsorted results. Removing an
/// entity elsewhere leaves its key in outstanding collections; the key is
/// treated as logically absent on the next access.
pub struct EntityCollection {
    class: Arc<ClassRt>,
    inner: Arc<DatastoreInner>,
    keys: Vec<EntityKey>,
    keep_sorted: bool,
    query_path: Option<String>,
    query_plan: Option<String>,
}

impl EntityCollection {
    pub(crate) fn from_keys(
        class: Arc<ClassRt>,
        inner: Arc<DatastoreInner>,
        keys: Vec<EntityKey>,
        keep_sorted: bool,
    ) -> Self {
        let keys = if keep_sorted { dedup(keys) } else { keys };
        Self {
            class,
            inner,
            keys,
            keep_sorted,
            query_path: None,
            query_plan: None,
        }
    }

    pub(crate) fn set_diagnostics(&mut self, path: Option<String>, plan: Option<String>) {
        self.query_path = path;
        self.query_plan = plan;
    }

    /// The owning class name.
    #[must_use]
    pub fn get_data_class(&self) -> &str {
        self.class.name()
    }

    /// Description of the query as actually performed, when requested.
    #[must_use]
    pub fn query_path(&self) -> Option<&str> {
        self.query_path.as_deref()
    }

    /// Description of the planned query, when requested.
    #[must_use]
    pub fn query_plan(&self) -> Option<&str> {
        self.query_plan.as_deref()
    }

    /// True when the collection keeps sorted (deduplicated) membership.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.keep_sorted
    }

    /// The member keys in collection order.
    #[must_use]
    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }

    /// Number of member references.
    #[must_use]
    pub fn length(&self) -> usize {
        if let Some(adapter) = self.class.adapter() {
            if let Ok(Some(len)) = adapter.get_collection_length(&self.keys) {
                return len;
            }
        }
        self.keys.len()
    }

    /// True when the collection holds no references.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Materializes the entity at a position. `Ok(None)` when the position
    /// is out of range or the entity was removed since.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn entity(&self, ctx: &ExecutionContext, pos: usize) -> DbResult<Option<Entity>> {
        let Some(key) = self.keys.get(pos) else {
            return Ok(None);
        };
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

    /// The first live entity, skipping removed members.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn first(&self, ctx: &ExecutionContext) -> DbResult<Option<Entity>> {
        for pos in 0..self.keys.len() {
            if let Some(entity) = self.entity(ctx, pos)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// The next live entity after `current`, driving entity iteration.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn next(&self, ctx: &ExecutionContext, current: usize) -> DbResult<Option<Entity>> {
        if let Some(adapter) = self.class.adapter() {
            if let Some(step) = adapter.next_in_collection(&self.keys, current)? {
                return match step {
                    Some(key) => match self.inner.load_record(ctx, &self.class, &key)? {
                        Some((values, stamp)) => Ok(Some(Entity::loaded(
                            Arc::clone(&self.class),
                            Arc::clone(&self.inner),
                            key,
                            values,
                            stamp,
                        ))),
                        None => Ok(None),
                    },
                    None => Ok(None),
                };
            }
        }
        for pos in current + 1..self.keys.len() {
            if let Some(entity) = self.entity(ctx, pos)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Number of live entities (skips members removed since).
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn count(&self, ctx: &ExecutionContext) -> DbResult<usize> {
        let mut n = 0;
        for key in dedup(self.keys.clone()) {
            if self.inner.load_record(ctx, &self.class, &key)?.is_some() {
                n += 1;
            }
        }
        Ok(n)
    }

    fn same_class(&self, other: &EntityCollection) -> DbResult<()> {
        if self.class.id() == other.class.id() {
            Ok(())
        } else {
            Err(DbError::invalid_operation(format!(
                "collections of {} and {} cannot combine",
                self.class.name(),
                other.class.name()
            )))
        }
    }

    fn unsorted(&self, keys: Vec<EntityKey>) -> EntityCollection {
        EntityCollection {
            class: Arc::clone(&self.class),
            inner: Arc::clone(&self.inner),
            keys,
            keep_sorted: false,
            query_path: None,
            query_plan: None,
        }
    }

    /// Entities present in both collections, by identity. The result is
    /// always unsorted and duplicate-free.
    ///
    /// # Errors
    ///
    /// The operands must belong to the same class.
    pub fn and(&self, other: &EntityCollection) -> DbResult<EntityCollection> {
        self.same_class(other)?;
        let right: IndexSet<&EntityKey> = other.keys.iter().collect();
        let keys = dedup(
            self.keys
                .iter()
                .filter(|k| right.contains(k))
                .cloned()
                .collect(),
        );
        Ok(self.unsorted(keys))
    }

    /// Entities present in either collection. Always unsorted,
    /// duplicate-free.
    ///
    /// # Errors
    ///
    /// The operands must belong to the same class.
    pub fn or(&self, other: &EntityCollection) -> DbResult<EntityCollection> {
        self.same_class(other)?;
        let mut keys = self.keys.clone();
        keys.extend(other.keys.iter().cloned());
        Ok(self.unsorted(dedup(keys)))
    }

    /// Entities of this collection absent from `other`. Always unsorted,
    /// duplicate-free.
    ///
    /// # Errors
    ///
    /// The operands must belong to the same class.
    pub fn minus(&self, other: &EntityCollection) -> DbResult<EntityCollection> {
        self.same_class(other)?;
        let right: IndexSet<&EntityKey> = other.keys.iter().collect();
        let keys = dedup(
            self.keys
                .iter()
                .filter(|k| !right.contains(k))
                .cloned()
                .collect(),
        );
        Ok(self.unsorted(keys))
    }

    /// Adds one entity. The receiver's sortedness characteristic is
    /// preserved: a sorted collection deduplicates, an unsorted one permits
    /// duplicate membership. Placement is at the end (deterministic
    /// regardless of `at_the_end`).
    ///
    /// # Errors
    ///
    /// The entity must belong to the same class and have a key.
    pub fn add(&mut self, entity: &Entity, _at_the_end: bool) -> DbResult<()> {
        if entity.get_data_class() != self.class.name() {
            return Err(DbError::invalid_operation("entity belongs to another class"));
        }
        let key = entity
            .get_key()
            .ok_or_else(|| DbError::invalid_operation("entity has no key"))?
            .clone();
        if let Some(adapter) = self.class.adapter() {
            adapter.add_entity_to_collection(&key)?;
        }
        if !self.keep_sorted || !self.keys.contains(&key) {
            self.keys.push(key);
        }
        Ok(())
    }

    /// Adds every member of another collection, preserving the receiver's
    /// sortedness characteristic.
    ///
    /// # Errors
    ///
    /// The collections must belong to the same class.
    pub fn add_collection(
        &mut self,
        other: &EntityCollection,
        _at_the_end: bool,
    ) -> DbResult<()> {
        self.same_class(other)?;
        for key in &other.keys {
            if !self.keep_sorted || !self.keys.contains(key) {
                self.keys.push(key.clone());
            }
        }
        Ok(())
    }

    /// A shallow copy of a portion of the collection, half-open, with
    /// negative indexes counting from the end. Never mutates the source.
    #[must_use]
    pub fn slice(&self, begin: Option<isize>, end: Option<isize>) -> EntityCollection {
        let len = self.keys.len() as isize;
        let norm = |idx: isize| -> usize {
            let n = if idx < 0 { len + idx } else { idx };
            n.clamp(0, len) as usize
        };
        let begin = norm(begin.unwrap_or(0));
        let end = norm(end.unwrap_or(len));
        let keys = if begin < end {
            self.keys[begin..end].to_vec()
        } else {
            Vec::new()
        };
        EntityCollection {
            class: Arc::clone(&self.class),
            inner: Arc::clone(&self.inner),
            keys,
            keep_sorted: self.keep_sorted,
            query_path: None,
            query_plan: None,
        }
    }

    /// Sorts into a NEW sorted collection. The spec is a comma-separated
    /// attribute list, each with an optional `asc`/`desc` direction
    /// (`"salary desc, city"`); ties resolve left to right. Sorting a
    /// calculated attribute routes through its `on_sort` hook for a
    /// surrogate expression.
    ///
    /// # Errors
    ///
    /// Unknown attributes, calculated attributes without `on_sort`, backend
    /// failures.
    pub fn order_by(&self, ctx: &ExecutionContext, spec: &str) -> DbResult<EntityCollection> {
        let sort_keys = self.expand_sort_spec(spec)?;
        if sort_keys.is_empty() {
            return Err(DbError::invalid_operation("empty orderBy attribute list"));
        }

        if let Some(adapter) = self.class.adapter() {
            let directives: Vec<SortDirective> = sort_keys
                .iter()
                .map(|k| SortDirective {
                    attname: k.path.clone(),
                    ascending: k.ascending,
                })
                .collect();
            let mut rows = Vec::new();
            for key in &self.keys {
                if let Some((values, _)) = self.inner.load_record(ctx, &self.class, key)? {
                    rows.push(values);
                }
            }
            if let Some(sorted) = adapter.order_by(rows, &directives)? {
                let keys = sorted
                    .iter()
                    .map(|row| self.class.row_key(row))
                    .collect::<DbResult<Vec<_>>>()?;
                return Ok(EntityCollection::from_keys(
                    Arc::clone(&self.class),
                    Arc::clone(&self.inner),
                    keys,
                    true,
                ));
            }
        }

        let mut decorated: Vec<(EntityKey, Vec<Value>)> = Vec::new();
        for key in dedup(self.keys.clone()) {
            let Some((values, _)) = self.inner.load_record(ctx, &self.class, &key)? else {
                continue;
            };
            let mut sort_values = Vec::with_capacity(sort_keys.len());
            for sk in &sort_keys {
                let mut found =
                    self.inner
                        .record_path_values(ctx, &self.class, &values, &sk.path)?;
                sort_values.push(found.drain(..).next().unwrap_or(Value::Null));
            }
            decorated.push((key, sort_values));
        }
        decorated.sort_by(|(_, a), (_, b)| {
            for (i, sk) in sort_keys.iter().enumerate() {
                let ord = a[i].sort_cmp(&b[i]);
                let ord = if sk.ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        Ok(EntityCollection::from_keys(
            Arc::clone(&self.class),
            Arc::clone(&self.inner),
            decorated.into_iter().map(|(k, _)| k).collect(),
            true,
        ))
    }

    fn expand_sort_spec(&self, spec: &str) -> DbResult<Vec<SortKey>> {
        let mut out = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (path, ascending) = match part.rsplit_once(char::is_whitespace) {
                Some((p, dir)) if dir.eq_ignore_ascii_case("desc") => (p.trim(), false),
                Some((p, dir)) if dir.eq_ignore_ascii_case("asc") => (p.trim(), true),
                _ => (part, true),
            };
            let head = path.split('.').next().unwrap_or_default();
            let attr = self
                .class
                .def
                .attribute(head)
                .ok_or_else(|| DbError::unknown_attribute(self.class.name(), head))?;
            if attr.kind == AttributeKind::Calculated && !path.contains('.') {
                let hook = attr.on_sort.as_ref().ok_or_else(|| {
                    DbError::invalid_operation(format!(
                        "calculated attribute {} has no on_sort hook",
                        attr.name
                    ))
                })?;
                let surrogate = hook(ascending);
                out.extend(self.expand_sort_spec(&surrogate)?);
            } else {
                out.push(SortKey {
                    path: path.to_owned(),
                    ascending,
                });
            }
        }
        Ok(out)
    }

    /// Visits every live entity in collection order. An entity left
    /// modified by the callback is saved automatically afterwards, unless
    /// the callback already saved it itself.
    ///
    /// # Errors
    ///
    /// Propagates callback, validation and backend failures.
    pub fn for_each<F>(&self, ctx: &ExecutionContext, mut f: F) -> DbResult<()>
    where
        F: FnMut(&mut Entity, usize) -> DbResult<()>,
    {
        for pos in 0..self.keys.len() {
            let Some(mut entity) = self.entity(ctx, pos)? else {
                continue;
            };
            entity.begin_pass();
            f(&mut entity, pos)?;
            if entity.is_modified() && !entity.saved_in_pass() {
                entity.save(ctx)?;
            }
        }
        Ok(())
    }

    /// Queries within this collection's members.
    ///
    /// # Errors
    ///
    /// Same failure modes as a class-level query.
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
            Some(&self.keys),
        )
    }

    /// `query` scoped to the collection, then the first result.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`EntityCollection::query`].
    pub fn find(
        &self,
        ctx: &ExecutionContext,
        query_string: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> DbResult<Option<Entity>> {
        self.query(ctx, query_string, params, options)?.first(ctx)
    }

    /// Every value reachable through `attribute` across the live members,
    /// nulls excluded.
    fn attribute_values(
        &self,
        ctx: &ExecutionContext,
        attribute: &str,
    ) -> DbResult<Vec<Value>> {
        if let Some(adapter) = self.class.adapter() {
            if let Some(values) = adapter.compute_attribute(attribute)? {
                return Ok(values.into_iter().filter(|v| !v.is_null()).collect());
            }
        }
        let mut out = Vec::new();
        for key in dedup(self.keys.clone()) {
            if let Some((values, _)) = self.inner.load_record(ctx, &self.class, &key)? {
                out.extend(
                    self.inner
                        .record_path_values(ctx, &self.class, &values, attribute)?
                        .into_iter()
                        .filter(|v| !v.is_null()),
                );
            }
        }
        Ok(out)
    }

    /// Sum of the attribute's numeric values.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn sum(&self, ctx: &ExecutionContext, attribute: &str, distinct: bool) -> DbResult<f64> {
        let values = self.collect_for_stats(ctx, attribute, distinct)?;
        Ok(values.iter().filter_map(Value::as_f64).sum())
    }

    /// Arithmetic average of the attribute's non-null values; `None` when
    /// there are none.
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
        let values = self.collect_for_stats(ctx, attribute, distinct)?;
        let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
        if numbers.is_empty() {
            return Ok(None);
        }
        Ok(Some(numbers.iter().sum::<f64>() / numbers.len() as f64))
    }

    /// Smallest non-null value of the attribute.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn min(&self, ctx: &ExecutionContext, attribute: &str) -> DbResult<Option<Value>> {
        let values = self.attribute_values(ctx, attribute)?;
        Ok(values.into_iter().min_by(|a, b| a.sort_cmp(b)))
    }

    /// Largest non-null value of the attribute.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn max(&self, ctx: &ExecutionContext, attribute: &str) -> DbResult<Option<Value>> {
        let values = self.attribute_values(ctx, attribute)?;
        Ok(values.into_iter().max_by(|a, b| a.sort_cmp(b)))
    }

    /// Number of entities whose attribute is non-null; `distinct` counts
    /// different values instead.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn count_values(
        &self,
        ctx: &ExecutionContext,
        attribute: &str,
        distinct: bool,
    ) -> DbResult<usize> {
        Ok(self.collect_for_stats(ctx, attribute, distinct)?.len())
    }

    fn collect_for_stats(
        &self,
        ctx: &ExecutionContext,
        attribute: &str,
        distinct: bool,
    ) -> DbResult<Vec<Value>> {
        let values = self.attribute_values(ctx, attribute)?;
        Ok(if distinct { distinct_sorted(values) } else { values })
    }

    /// All the statistical calculations for one or more attributes
    /// (comma-separated) in a single pass.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn compute(
        &self,
        ctx: &ExecutionContext,
        attributes: &str,
    ) -> DbResult<IndexMap<String, ComputeStats>> {
        let mut report = IndexMap::new();
        for attribute in attributes.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let values = self.attribute_values(ctx, attribute)?;
            let distinct = distinct_sorted(values.clone());
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            let distinct_numbers: Vec<f64> = distinct.iter().filter_map(Value::as_f64).collect();
            let stats = ComputeStats {
                count: values.len(),
                count_distinct: distinct.len(),
                sum: numbers.iter().sum(),
                sum_distinct: distinct_numbers.iter().sum(),
                average: (!numbers.is_empty())
                    .then(|| numbers.iter().sum::<f64>() / numbers.len() as f64),
                average_distinct: (!distinct_numbers.is_empty()).then(|| {
                    distinct_numbers.iter().sum::<f64>() / distinct_numbers.len() as f64
                }),
                min: values.iter().cloned().min_by(|a, b| a.sort_cmp(b)),
                max: values.iter().cloned().max_by(|a, b| a.sort_cmp(b)),
            };
            report.insert(attribute.to_owned(), stats);
        }
        Ok(report)
    }

    /// The distinct values stored in `attribute`, sorted.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn distinct_values(
        &self,
        ctx: &ExecutionContext,
        attribute: &str,
    ) -> DbResult<Vec<Value>> {
        Ok(distinct_sorted(self.attribute_values(ctx, attribute)?))
    }

    /// All property paths of an object attribute carrying an objectPath
    /// index, sorted.
    ///
    /// # Errors
    ///
    /// The attribute must carry an objectPath index.
    pub fn distinct_paths(&self, attribute: &str) -> DbResult<Vec<String>> {
        self.class
            .indexes
            .read()
            .distinct_paths(attribute)
            .ok_or_else(|| {
                DbError::invalid_operation(format!(
                    "{}.{attribute} has no objectPath index",
                    self.class.name()
                ))
            })
    }

    /// Projects the collection into flat JSON rows.
    ///
    /// `attribute_list` is comma-separated; relation paths nest
    /// (`"employer.name"`), `RelatedAttr:N` caps related sub-arrays, and an
    /// empty list means every storage attribute. `include_key_stamp` adds
    /// `__KEY` / `__STAMP`; `sort_list` pre-sorts; `skip`/`top` page.
    ///
    /// # Errors
    ///
    /// Unknown attributes and backend failures.
    pub fn to_array(
        &self,
        ctx: &ExecutionContext,
        attribute_list: &str,
        sort_list: Option<&str>,
        include_key_stamp: bool,
        skip: Option<usize>,
        top: Option<usize>,
    ) -> DbResult<Vec<serde_json::Value>> {
        let source = match sort_list {
            Some(spec) => self.order_by(ctx, spec)?,
            None => self.slice(None, None),
        };
        if let Some(adapter) = self.class.adapter() {
            if let Some(rows) = adapter.collection_to_array(&source.keys)? {
                return Ok(rows
                    .iter()
                    .map(|row| {
                        serde_json::Value::Object(
                            row.iter()
                                .map(|(k, v)| (k.clone(), value_to_json(v)))
                                .collect(),
                        )
                    })
                    .collect());
            }
        }

        let spec = ProjectionSpec::parse(&self.class, attribute_list)?;
        let mut rows = Vec::new();
        let skip = skip.unwrap_or(0);
        let mut taken = 0usize;
        for (pos, key) in source.keys.iter().enumerate() {
            if pos < skip {
                continue;
            }
            if let Some(limit) = top {
                if taken >= limit {
                    break;
                }
            }
            let Some((values, stamp)) = self.inner.load_record(ctx, &self.class, key)? else {
                continue;
            };
            let mut row = self.project_record(ctx, &self.class, &values, &spec)?;
            if include_key_stamp {
                row.insert("__KEY".to_owned(), serde_json::Value::String(key.to_string()));
                row.insert("__STAMP".to_owned(), serde_json::Value::from(stamp));
            }
            rows.push(serde_json::Value::Object(row));
            taken += 1;
        }
        Ok(rows)
    }

    fn project_record(
        &self,
        ctx: &ExecutionContext,
        class: &Arc<ClassRt>,
        values: &IndexMap<String, Value>,
        spec: &ProjectionSpec,
    ) -> DbResult<serde_json::Map<String, serde_json::Value>> {
        let mut row = serde_json::Map::new();
        for (name, entry) in &spec.entries {
            let attr = class
                .def
                .attribute(name)
                .ok_or_else(|| DbError::unknown_attribute(class.name(), name))?;
            match attr.kind {
                AttributeKind::RelatedEntity if !entry.sub.is_empty() => {
                    let fk = values.get(name).cloned().unwrap_or(Value::Null);
                    let target = self.inner.class(attr.related_class().unwrap_or_default())?;
                    let nested = match EntityKey::from_value(&fk) {
                        Some(key) => match self.inner.load_record(ctx, target, &key)? {
                            Some((related, _)) => {
                                let sub_spec = ProjectionSpec::from_entries(&entry.sub);
                                serde_json::Value::Object(self.project_record(
                                    ctx, target, &related, &sub_spec,
                                )?)
                            }
                            None => serde_json::Value::Null,
                        },
                        None => serde_json::Value::Null,
                    };
                    row.insert(name.clone(), nested);
                }
                AttributeKind::RelatedEntities => {
                    let target = self.inner.class(attr.related_class().unwrap_or_default())?;
                    let keys = self
                        .inner
                        .related_entity_keys(ctx, class, values, name)?;
                    let capped = match entry.cap {
                        Some(cap) => &keys[..keys.len().min(cap)],
                        None => &keys[..],
                    };
                    let sub_spec = ProjectionSpec::from_entries(&entry.sub);
                    let mut items = Vec::new();
                    for key in capped {
                        if let Some((related, _)) = self.inner.load_record(ctx, target, key)? {
                            items.push(serde_json::Value::Object(self.project_record(
                                ctx, target, &related, &sub_spec,
                            )?));
                        }
                    }
                    row.insert(name.clone(), serde_json::Value::Array(items));
                }
                _ => {
                    let mut found =
                        self.inner.record_path_values(ctx, class, values, name)?;
                    let value = found.drain(..).next().unwrap_or(Value::Null);
                    row.insert(name.clone(), value_to_json(&value));
                }
            }
        }
        Ok(row)
    }

    /// Permanently removes every member entity. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; buffered inside a transaction for
    /// native classes. Adapter classes drop through `drop_entities` in one
    /// call.
    pub fn remove(&self, ctx: &ExecutionContext) -> DbResult<usize> {
        if let Some(adapter) = self.class.adapter() {
            let mut live = Vec::new();
            for key in dedup(self.keys.clone()) {
                if let Some((values, _)) = self.inner.load_record(ctx, &self.class, &key)? {
                    let mut doomed = values;
                    crate::entity::run_remove_hooks(&self.class, &mut doomed)?;
                    live.push(key);
                }
            }
            adapter.drop_entities(&live)?;
            return Ok(live.len());
        }
        let mut removed = 0;
        for pos in 0..self.keys.len() {
            if let Some(mut entity) = self.entity(ctx, pos)? {
                entity.remove(ctx)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for EntityCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCollection")
            .field("class", &self.class.name())
            .field("length", &self.keys.len())
            .field("keep_sorted", &self.keep_sorted)
            .finish()
    }
}

struct SortKey {
    path: String,
    ascending: bool,
}

struct ProjectionEntry {
    cap: Option<usize>,
    sub: Vec<(String, Option<usize>)>,
}

struct ProjectionSpec {
    entries: IndexMap<String, ProjectionEntry>,
}

impl ProjectionSpec {
    /// Groups `"a, rel.b, Rel:5, rel.c.d"` by head attribute.
    fn parse(class: &Arc<ClassRt>, list: &str) -> DbResult<Self> {
        let mut entries: IndexMap<String, ProjectionEntry> = IndexMap::new();
        let trimmed = list.trim();
        if trimmed.is_empty() {
            for name in class.def.storage_attribute_names() {
                entries.insert(
                    name.to_owned(),
                    ProjectionEntry {
                        cap: None,
                        sub: Vec::new(),
                    },
                );
            }
            return Ok(Self { entries });
        }
        for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (path, cap) = match part.rsplit_once(':') {
                Some((p, n)) if n.chars().all(|c| c.is_ascii_digit()) => {
                    (p.trim(), n.parse::<usize>().ok())
                }
                _ => (part, None),
            };
            let (head, rest) = match path.split_once('.') {
                Some((h, r)) => (h, Some(r)),
                None => (path, None),
            };
            let entry = entries.entry(head.to_owned()).or_insert(ProjectionEntry {
                cap: None,
                sub: Vec::new(),
            });
            if cap.is_some() {
                entry.cap = cap;
            }
            if let Some(rest) = rest {
                entry.sub.push((rest.to_owned(), None));
            }
        }
        Ok(Self { entries })
    }

    fn from_entries(sub: &[(String, Option<usize>)]) -> Self {
        let mut entries: IndexMap<String, ProjectionEntry> = IndexMap::new();
        for (path, cap) in sub {
            let (head, rest) = match path.split_once('.') {
                Some((h, r)) => (h, Some(r)),
                None => (path.as_str(), None),
            };
            let entry = entries.entry(head.to_owned()).or_insert(ProjectionEntry {
                cap: *cap,
                sub: Vec::new(),
            });
            if let Some(rest) = rest {
                entry.sub.push((rest.to_owned(), None));
            }
        }
        Self { entries }
    }
}

fn dedup(keys: Vec<EntityKey>) -> Vec<EntityKey> {
    let set: IndexSet<EntityKey> = keys.into_iter().collect();
    set.into_iter().collect()
}

fn distinct_sorted(values: Vec<Value>) -> Vec<Value> {
    let mut values = values;
    values.sort_by(|a, b| a.sort_cmp(b));
    values.dedup_by(|a, b| a.sort_cmp(b) == Ordering::Equal);
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let keys = vec![
            EntityKey::Long(3),
            EntityKey::Long(1),
            EntityKey::Long(3),
            EntityKey::Long(2),
            EntityKey::Long(1),
        ];
        assert_eq!(
            dedup(keys),
            vec![EntityKey::Long(3), EntityKey::Long(1), EntityKey::Long(2)]
        );
    }

    #[test]
    fn distinct_sorted_uses_the_engine_collation() {
        let values = vec![
            Value::Text("beta".into()),
            Value::Text("ALPHA".into()),
            Value::Text("alpha".into()),
        ];
        let distinct = distinct_sorted(values);
        // "ALPHA" and "alpha" collate equal; the sorted survivor comes first
        assert_eq!(distinct.len(), 2);
        assert_eq!(distinct[1], Value::Text("beta".into()));
    }
}
