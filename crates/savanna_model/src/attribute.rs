//! Attribute metadata: kinds, types, indexing and constraints.

use crate::error::ModelError;
use crate::hooks::{EventChain, OnGet, OnQuery, OnSet, OnSort};
use crate::value::Value;
use regex::Regex;
use std::fmt;

/// How an attribute stores (or does not store) its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// A plain stored scalar value.
    Storage,
    /// No stored value; produced and consumed through hooks.
    Calculated,
    /// A value reached through a relation path.
    Alias,
    /// N -> 1 relation; stores the related entity's key.
    RelatedEntity,
    /// 1 -> N relation; resolved by querying the related class.
    RelatedEntities,
    /// Retracts an inherited attribute in a subclass.
    Removed,
}

/// Scalar types supported by storage, calculated and alias attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    /// Boolean.
    Bool,
    /// 8-bit integer (normalizes to long).
    Byte,
    /// 16-bit integer (normalizes to long).
    Word,
    /// 32-bit integer (normalizes to long).
    Long,
    /// 64-bit integer.
    Long64,
    /// Floating point number.
    Number,
    /// UTF-8 text.
    Text,
    /// Date-time.
    Date,
    /// Duration in milliseconds (normalizes to long).
    Duration,
    /// UUID.
    Uuid,
    /// Binary payload.
    Blob,
    /// Picture payload (byte-buffer-like, engine treats it as a blob).
    Image,
    /// Structured object value.
    Object,
}

impl ScalarType {
    /// True when the type lives on the numeric axis.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Word | Self::Long | Self::Long64 | Self::Number | Self::Duration
        )
    }
}

/// The declared type of an attribute: a scalar, or the related class name
/// for relation attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrType {
    /// A scalar type.
    Scalar(ScalarType),
    /// The target class of a relation attribute.
    Class(String),
}

/// Index kinds an attribute can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexKind {
    /// No index; queries fall back to a sequential scan.
    #[default]
    None,
    /// Pick a suitable kind from the attribute type at seal time.
    Auto,
    /// General-purpose ordered index.
    BTree,
    /// Ordered index with clustered postings; same query surface as btree.
    Cluster,
    /// Word index for the `%%` comparator (text attributes only).
    Keywords,
    /// Property-path index for object attributes.
    ObjectPath,
}

impl IndexKind {
    /// True when the index supports ordered scans (equality, range, prefix).
    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::BTree | Self::Cluster)
    }
}

/// Attribute metadata: storage kind, type, indexing, constraints and hooks.
#[derive(Clone)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Storage kind.
    pub kind: AttributeKind,
    /// Declared type.
    pub attr_type: AttrType,
    /// Index kind.
    pub index: IndexKind,
    /// True when this attribute is the primary key.
    pub prim_key: bool,
    /// Values must be unique across the class extent.
    pub unique: bool,
    /// Null values are rejected at save time.
    pub not_null: bool,
    /// Writable only through engine code paths, never by applications.
    pub read_only: bool,
    /// Numeric key assigned from the class autosequence on first save.
    pub autosequence: bool,
    /// UUID key generated on first save.
    pub autogenerate: bool,
    /// Minimum text length.
    pub min_length: Option<usize>,
    /// Maximum text length; longer values are rejected.
    pub max_length: Option<usize>,
    /// Exact required text length.
    pub fixed_length: Option<usize>,
    /// Silent truncation length applied on set.
    pub limiting_length: Option<usize>,
    /// Minimum numeric value.
    pub min_value: Option<f64>,
    /// Maximum numeric value.
    pub max_value: Option<f64>,
    /// Entry pattern for text attributes.
    pub pattern: Option<Regex>,
    /// Default value assigned to new entities.
    pub default_value: Option<Value>,
    /// Relation path for alias and reverse-relation attributes.
    pub path: Option<String>,
    /// Value hook for calculated attributes.
    pub on_get: Option<OnGet>,
    /// Write hook for calculated attributes.
    pub on_set: Option<OnSet>,
    /// Query-rewrite hook for calculated attributes.
    pub on_query: Option<OnQuery>,
    /// Sort-surrogate hook for calculated attributes.
    pub on_sort: Option<OnSort>,
    /// Attribute-level event handlers.
    pub events: EventChain,
}

impl Attribute {
    fn new(name: impl Into<String>, kind: AttributeKind, attr_type: AttrType) -> Self {
        Self {
            name: name.into(),
            kind,
            attr_type,
            index: IndexKind::None,
            prim_key: false,
            unique: false,
            not_null: false,
            read_only: false,
            autosequence: false,
            autogenerate: false,
            min_length: None,
            max_length: None,
            fixed_length: None,
            limiting_length: None,
            min_value: None,
            max_value: None,
            pattern: None,
            default_value: None,
            path: None,
            on_get: None,
            on_set: None,
            on_query: None,
            on_sort: None,
            events: EventChain::new(),
        }
    }

    /// Creates a storage attribute.
    #[must_use]
    pub fn storage(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, AttributeKind::Storage, AttrType::Scalar(scalar))
    }

    /// Creates a calculated attribute. An `on_get` hook is mandatory before
    /// the catalog seals.
    #[must_use]
    pub fn calculated(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, AttributeKind::Calculated, AttrType::Scalar(scalar))
    }

    /// Creates an alias attribute reading through `path`.
    #[must_use]
    pub fn alias(name: impl Into<String>, scalar: ScalarType, path: impl Into<String>) -> Self {
        let mut attr = Self::new(name, AttributeKind::Alias, AttrType::Scalar(scalar));
        attr.path = Some(path.into());
        attr
    }

    /// Creates an N -> 1 relation attribute targeting `class`.
    #[must_use]
    pub fn related_entity(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::RelatedEntity, AttrType::Class(class.into()))
    }

    /// Creates a 1 -> N relation attribute targeting `class`, resolved
    /// through the named reverse relation attribute on the target class.
    #[must_use]
    pub fn related_entities(
        name: impl Into<String>,
        class: impl Into<String>,
        reverse: impl Into<String>,
    ) -> Self {
        let mut attr =
            Self::new(name, AttributeKind::RelatedEntities, AttrType::Class(class.into()));
        attr.path = Some(reverse.into());
        attr
    }

    /// Retracts an inherited attribute in a subclass.
    #[must_use]
    pub fn removed(name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Removed, AttrType::Scalar(ScalarType::Bool))
    }

    /// Sets the index kind.
    #[must_use]
    pub fn indexed(mut self, kind: IndexKind) -> Self {
        self.index = kind;
        self
    }

    /// Marks this attribute as the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.prim_key = true;
        self
    }

    /// Requires values to be unique across the class.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Rejects null values at save time.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Marks the attribute read-only for application code.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Assigns keys from the class autosequence.
    #[must_use]
    pub fn autosequence(mut self) -> Self {
        self.autosequence = true;
        self
    }

    /// Generates UUID keys on first save.
    #[must_use]
    pub fn autogenerate(mut self) -> Self {
        self.autogenerate = true;
        self
    }

    /// Sets the minimum text length.
    #[must_use]
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    /// Sets the maximum text length.
    #[must_use]
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Requires an exact text length.
    #[must_use]
    pub fn fixed_length(mut self, len: usize) -> Self {
        self.fixed_length = Some(len);
        self
    }

    /// Truncates text to `len` on set instead of rejecting it.
    #[must_use]
    pub fn limiting_length(mut self, len: usize) -> Self {
        self.limiting_length = Some(len);
        self
    }

    /// Sets the allowed numeric range (either bound optional).
    #[must_use]
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    /// Sets the entry pattern for text values.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::BadPattern`] when the expression does not
    /// compile.
    pub fn pattern(mut self, pattern: &str) -> Result<Self, ModelError> {
        let compiled = Regex::new(pattern).map_err(|e| ModelError::BadPattern {
            attribute: self.name.clone(),
            message: e.to_string(),
        })?;
        self.pattern = Some(compiled);
        Ok(self)
    }

    /// Sets the default value for new entities.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Installs the `on_get` hook.
    #[must_use]
    pub fn on_get(mut self, hook: OnGet) -> Self {
        self.on_get = Some(hook);
        self
    }

    /// Installs the `on_set` hook.
    #[must_use]
    pub fn on_set(mut self, hook: OnSet) -> Self {
        self.on_set = Some(hook);
        self
    }

    /// Installs the `on_query` hook.
    #[must_use]
    pub fn on_query(mut self, hook: OnQuery) -> Self {
        self.on_query = Some(hook);
        self
    }

    /// Installs the `on_sort` hook.
    #[must_use]
    pub fn on_sort(mut self, hook: OnSort) -> Self {
        self.on_sort = Some(hook);
        self
    }

    /// The scalar type, when the attribute has one.
    #[must_use]
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match &self.attr_type {
            AttrType::Scalar(s) => Some(*s),
            AttrType::Class(_) => None,
        }
    }

    /// The related class name, for relation attributes.
    #[must_use]
    pub fn related_class(&self) -> Option<&str> {
        match &self.attr_type {
            AttrType::Class(name) => Some(name),
            AttrType::Scalar(_) => None,
        }
    }

    /// True for kinds that hold a directly stored value.
    #[must_use]
    pub fn is_stored(&self) -> bool {
        matches!(self.kind, AttributeKind::Storage | AttributeKind::RelatedEntity)
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("type", &self.attr_type)
            .field("index", &self.index)
            .field("prim_key", &self.prim_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let attr = Attribute::storage("lastName", ScalarType::Text)
            .indexed(IndexKind::BTree)
            .not_null()
            .max_length(80);
        assert_eq!(attr.kind, AttributeKind::Storage);
        assert_eq!(attr.index, IndexKind::BTree);
        assert!(attr.not_null);
        assert_eq!(attr.max_length, Some(80));
    }

    #[test]
    fn pattern_rejects_bad_regex() {
        let result = Attribute::storage("code", ScalarType::Text).pattern("([");
        assert!(result.is_err());
    }

    #[test]
    fn relation_attribute_has_class_type() {
        let attr = Attribute::related_entity("employer", "Company");
        assert_eq!(attr.related_class(), Some("Company"));
        assert!(attr.is_stored());
    }

    #[test]
    fn alias_carries_path() {
        let attr = Attribute::alias("employerCity", ScalarType::Text, "employer.city");
        assert_eq!(attr.path.as_deref(), Some("employer.city"));
        assert!(!attr.is_stored());
    }
}
