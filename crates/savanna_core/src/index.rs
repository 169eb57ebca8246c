//! Secondary indexes for native classes.
//!
//! Three families back the query executor: ordered (btree/cluster) indexes
//! for equality, range and prefix scans; keyword indexes for the `%%`
//! comparator; and object-path indexes for structured attributes, which
//! also back `distinct_paths`.

use crate::types::EntityKey;
use indexmap::IndexMap;
use savanna_model::{fold_text, keywords, IndexKind, ResolvedClass, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Total-order wrapper over [`Value`] so it can key a `BTreeMap`.
///
/// Ordering delegates to the engine collation (`Value::sort_cmp`), so text
/// keys compare case/diacritic-insensitively and longs meet numbers on one
/// axis.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OrdKey(pub Value);

impl Eq for OrdKey {}

impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.sort_cmp(&other.0)
    }
}

type Postings = BTreeMap<OrdKey, Vec<EntityKey>>;

/// All secondary indexes of one native class.
pub(crate) struct ClassIndexes {
    ordered: HashMap<String, Postings>,
    keyword: HashMap<String, BTreeMap<String, Vec<EntityKey>>>,
    object: HashMap<String, BTreeMap<String, Postings>>,
}

impl ClassIndexes {
    /// Creates empty indexes for every indexed attribute of `def`.
    pub(crate) fn new(def: &ResolvedClass) -> Self {
        let mut ordered = HashMap::new();
        let mut keyword = HashMap::new();
        let mut object = HashMap::new();
        for attr in def.attributes.values() {
            match attr.index {
                IndexKind::BTree | IndexKind::Cluster => {
                    ordered.insert(attr.name.clone(), Postings::new());
                }
                IndexKind::Keywords => {
                    keyword.insert(attr.name.clone(), BTreeMap::new());
                }
                IndexKind::ObjectPath => {
                    object.insert(attr.name.clone(), BTreeMap::new());
                }
                IndexKind::None | IndexKind::Auto => {}
            }
        }
        Self {
            ordered,
            keyword,
            object,
        }
    }

    /// True when `attribute` has an ordered (btree/cluster) index.
    pub(crate) fn has_ordered(&self, attribute: &str) -> bool {
        self.ordered.contains_key(attribute)
    }

    /// True when `attribute` has a keyword index.
    pub(crate) fn has_keyword(&self, attribute: &str) -> bool {
        self.keyword.contains_key(attribute)
    }

    /// Indexes one record.
    pub(crate) fn insert_record(&mut self, key: &EntityKey, values: &IndexMap<String, Value>) {
        for (attr, postings) in &mut self.ordered {
            if let Some(value) = values.get(attr) {
                postings
                    .entry(OrdKey(value.clone()))
                    .or_default()
                    .push(key.clone());
            }
        }
        for (attr, words) in &mut self.keyword {
            if let Some(Value::Text(text)) = values.get(attr) {
                for word in keywords(text) {
                    words.entry(word).or_default().push(key.clone());
                }
            }
        }
        for (attr, paths) in &mut self.object {
            if let Some(value) = values.get(attr) {
                for (path, leaf) in object_leaves(value) {
                    paths
                        .entry(path)
                        .or_default()
                        .entry(OrdKey(leaf))
                        .or_default()
                        .push(key.clone());
                }
            }
        }
    }

    /// Unindexes one record.
    pub(crate) fn remove_record(&mut self, key: &EntityKey, values: &IndexMap<String, Value>) {
        for (attr, postings) in &mut self.ordered {
            if let Some(value) = values.get(attr) {
                prune(postings, &OrdKey(value.clone()), key);
            }
        }
        for (attr, words) in &mut self.keyword {
            if let Some(Value::Text(text)) = values.get(attr) {
                for word in keywords(text) {
                    if let Some(list) = words.get_mut(&word) {
                        list.retain(|k| k != key);
                        if list.is_empty() {
                            words.remove(&word);
                        }
                    }
                }
            }
        }
        for (attr, paths) in &mut self.object {
            if let Some(value) = values.get(attr) {
                for (path, leaf) in object_leaves(value) {
                    if let Some(postings) = paths.get_mut(&path) {
                        prune(postings, &OrdKey(leaf), key);
                        if postings.is_empty() {
                            paths.remove(&path);
                        }
                    }
                }
            }
        }
    }

    /// Exact-value lookup on an ordered index.
    pub(crate) fn lookup_eq(&self, attribute: &str, value: &Value) -> Option<Vec<EntityKey>> {
        self.ordered
            .get(attribute)
            .map(|p| p.get(&OrdKey(value.clone())).cloned().unwrap_or_default())
    }

    /// Range lookup on an ordered index. Bounds are inclusive/exclusive per
    /// the flags; `None` means unbounded.
    pub(crate) fn lookup_range(
        &self,
        attribute: &str,
        min: Option<(&Value, bool)>,
        max: Option<(&Value, bool)>,
    ) -> Option<Vec<EntityKey>> {
        let postings = self.ordered.get(attribute)?;
        let lower = match min {
            Some((v, true)) => Bound::Included(OrdKey(v.clone())),
            Some((v, false)) => Bound::Excluded(OrdKey(v.clone())),
            None => Bound::Unbounded,
        };
        let upper = match max {
            Some((v, true)) => Bound::Included(OrdKey(v.clone())),
            Some((v, false)) => Bound::Excluded(OrdKey(v.clone())),
            None => Bound::Unbounded,
        };
        let mut keys = Vec::new();
        for (entry, posting) in postings.range((lower, upper)) {
            // Null entries sort first but never satisfy a comparison.
            if !entry.0.is_null() {
                keys.extend(posting.iter().cloned());
            }
        }
        Some(keys)
    }

    /// Prefix lookup on an ordered text index.
    pub(crate) fn lookup_prefix(&self, attribute: &str, prefix: &str) -> Option<Vec<EntityKey>> {
        let folded = fold_text(prefix);
        let upper = format!("{folded}\u{10FFFF}");
        self.lookup_range(
            attribute,
            Some((&Value::Text(folded), true)),
            Some((&Value::Text(upper), true)),
        )
    }

    /// Keyword lookup (`%%` with a wildcard-free operand).
    pub(crate) fn lookup_keyword(&self, attribute: &str, word: &str) -> Option<Vec<EntityKey>> {
        self.keyword
            .get(attribute)
            .map(|words| words.get(&fold_text(word)).cloned().unwrap_or_default())
    }

    /// Sorted distinct property paths of an object-path index, including
    /// every intermediate prefix.
    pub(crate) fn distinct_paths(&self, attribute: &str) -> Option<Vec<String>> {
        let paths = self.object.get(attribute)?;
        let mut out = BTreeSet::new();
        for path in paths.keys() {
            let mut prefix = String::new();
            for segment in path.split('.') {
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(segment);
                out.insert(prefix.clone());
            }
        }
        Some(out.into_iter().collect())
    }
}

fn prune(postings: &mut Postings, entry: &OrdKey, key: &EntityKey) {
    if let Some(list) = postings.get_mut(entry) {
        list.retain(|k| k != key);
        if list.is_empty() {
            postings.remove(entry);
        }
    }
}

/// Flattens a structured value into `(property path, leaf value)` pairs.
/// Array elements contribute under their parent property's path.
pub(crate) fn object_leaves(value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    walk_leaves(value, String::new(), &mut out);
    out
}

fn walk_leaves(value: &Value, path: String, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}.{name}")
                };
                walk_leaves(child, child_path, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_leaves(item, path.clone(), out);
            }
        }
        _ if !path.is_empty() => out.push((path, value.clone())),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use savanna_model::{Attribute, Catalog, DataClassDef, ScalarType};

    fn indexed_class() -> ResolvedClass {
        Catalog::new()
            .class(
                DataClassDef::new("Employee")
                    .attribute(
                        Attribute::storage("lastName", ScalarType::Text).indexed(IndexKind::BTree),
                    )
                    .attribute(
                        Attribute::storage("bio", ScalarType::Text).indexed(IndexKind::Keywords),
                    )
                    .attribute(
                        Attribute::storage("profile", ScalarType::Object)
                            .indexed(IndexKind::ObjectPath),
                    ),
            )
            .unwrap()
            .seal()
            .unwrap()
            .get("Employee")
            .unwrap()
            .clone()
    }

    fn record(last: &str, bio: &str) -> IndexMap<String, Value> {
        IndexMap::from([
            ("lastName".to_owned(), Value::Text(last.to_owned())),
            ("bio".to_owned(), Value::Text(bio.to_owned())),
        ])
    }

    #[test]
    fn eq_lookup_is_case_insensitive() {
        let def = indexed_class();
        let mut idx = ClassIndexes::new(&def);
        idx.insert_record(&EntityKey::Long(1), &record("Smith", ""));

        let found = idx.lookup_eq("lastName", &Value::Text("SMITH".into())).unwrap();
        assert_eq!(found, vec![EntityKey::Long(1)]);
    }

    #[test]
    fn range_lookup_skips_nulls() {
        let def = indexed_class();
        let mut idx = ClassIndexes::new(&def);
        idx.insert_record(
            &EntityKey::Long(1),
            &IndexMap::from([("lastName".to_owned(), Value::Null)]),
        );
        idx.insert_record(&EntityKey::Long(2), &record("Adams", ""));

        let found = idx
            .lookup_range("lastName", None, Some((&Value::Text("z".into()), true)))
            .unwrap();
        assert_eq!(found, vec![EntityKey::Long(2)]);
    }

    #[test]
    fn prefix_lookup() {
        let def = indexed_class();
        let mut idx = ClassIndexes::new(&def);
        idx.insert_record(&EntityKey::Long(1), &record("Smith", ""));
        idx.insert_record(&EntityKey::Long(2), &record("Smooth", ""));
        idx.insert_record(&EntityKey::Long(3), &record("Jones", ""));

        let found = idx.lookup_prefix("lastName", "Sm").unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn keyword_lookup_folds() {
        let def = indexed_class();
        let mut idx = ClassIndexes::new(&def);
        idx.insert_record(&EntityKey::Long(1), &record("x", "writes embedded Rust"));

        assert_eq!(
            idx.lookup_keyword("bio", "RUST").unwrap(),
            vec![EntityKey::Long(1)]
        );
        assert!(idx.lookup_keyword("bio", "cobol").unwrap().is_empty());
    }

    #[test]
    fn remove_unindexes() {
        let def = indexed_class();
        let mut idx = ClassIndexes::new(&def);
        let values = record("Smith", "hello");
        idx.insert_record(&EntityKey::Long(1), &values);
        idx.remove_record(&EntityKey::Long(1), &values);

        assert!(idx.lookup_eq("lastName", &Value::Text("Smith".into())).unwrap().is_empty());
        assert!(idx.lookup_keyword("bio", "hello").unwrap().is_empty());
    }

    #[test]
    fn object_paths_include_prefixes() {
        let def = indexed_class();
        let mut idx = ClassIndexes::new(&def);
        let mut laptop = IndexMap::new();
        laptop.insert("laptop".to_owned(), Value::Bool(true));
        let mut profile = IndexMap::new();
        profile.insert("computer".to_owned(), Value::Object(laptop));
        idx.insert_record(
            &EntityKey::Long(1),
            &IndexMap::from([("profile".to_owned(), Value::Object(profile))]),
        );

        let paths = idx.distinct_paths("profile").unwrap();
        assert_eq!(paths, vec!["computer".to_owned(), "computer.laptop".to_owned()]);
    }

    #[test]
    fn leaves_flatten_arrays_under_parent_path() {
        let mut obj = IndexMap::new();
        obj.insert(
            "pages".to_owned(),
            Value::Array(vec![Value::Long(1), Value::Long(2)]),
        );
        let leaves = object_leaves(&Value::Object(obj));
        assert_eq!(
            leaves,
            vec![
                ("pages".to_owned(), Value::Long(1)),
                ("pages".to_owned(), Value::Long(2)),
            ]
        );
    }
}
