//! The class catalog: registration, inheritance resolution and sealing.

use crate::attribute::{Attribute, AttributeKind, IndexKind, ScalarType};
use crate::class::{ClassScope, DataClassDef};
use crate::error::{ModelError, ModelResult};
use crate::hooks::EventChain;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;

/// Stable identifier of a class inside a sealed catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Creates a class ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class:{}", self.0)
    }
}

/// A class after inheritance resolution and schema validation.
#[derive(Clone)]
pub struct ResolvedClass {
    /// Stable identifier.
    pub id: ClassId,
    /// Class name.
    pub name: String,
    /// Visibility scope.
    pub scope: ClassScope,
    /// Parent class name, for derived classes.
    pub extends: Option<String>,
    /// Flattened attributes: inherited first, `removed` retractions applied,
    /// index kinds resolved.
    pub attributes: IndexMap<String, Attribute>,
    /// Name of the primary key attribute.
    pub primary_key: String,
    /// Class-level event handlers.
    pub events: EventChain,
    /// First autosequence value.
    pub auto_sequence_start: i64,
    /// Default collection page length.
    pub page_length: usize,
}

impl ResolvedClass {
    /// Resolves an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// The primary key attribute.
    #[must_use]
    pub fn primary_key_attribute(&self) -> &Attribute {
        &self.attributes[&self.primary_key]
    }

    /// Storage-kind attribute names in declaration order (what exports and
    /// projections operate on).
    pub fn storage_attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .values()
            .filter(|a| a.is_stored())
            .map(|a| a.name.as_str())
    }
}

impl fmt::Debug for ResolvedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A mutable catalog of class definitions.
#[derive(Default)]
pub struct Catalog {
    classes: IndexMap<String, DataClassDef>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class definition (builder form).
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateClass`] when the name is taken.
    pub fn class(mut self, def: DataClassDef) -> ModelResult<Self> {
        self.add_class(def)?;
        Ok(self)
    }

    /// Registers a class definition.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateClass`] when the name is taken.
    pub fn add_class(&mut self, def: DataClassDef) -> ModelResult<()> {
        if self.classes.contains_key(&def.name) {
            return Err(ModelError::DuplicateClass { name: def.name });
        }
        self.classes.insert(def.name.clone(), def);
        Ok(())
    }

    /// Validates the schema and freezes it for the engine.
    ///
    /// Resolution order: inheritance chains are flattened (parent attributes
    /// first, `removed` retractions applied), a primary key is established
    /// (an implicit autosequenced `ID` when none is declared), `auto` index
    /// kinds are resolved, then relation targets, alias paths and hook
    /// requirements are checked.
    ///
    /// # Errors
    ///
    /// Any schema inconsistency aborts the seal with the matching
    /// [`ModelError`].
    pub fn seal(self) -> ModelResult<SealedCatalog> {
        // Pass 1: flatten every inheritance chain.
        let mut flattened: HashMap<String, IndexMap<String, Attribute>> = HashMap::new();
        for name in self.classes.keys() {
            self.flatten(name, &mut flattened, &mut Vec::new())?;
        }

        // Pass 2: per-class structural checks against the flattened maps.
        let mut resolved = IndexMap::new();
        for (idx, (name, def)) in self.classes.iter().enumerate() {
            let mut attributes = flattened[name].clone();
            let primary_key = Self::establish_primary_key(name, &mut attributes)?;
            for attr in attributes.values_mut() {
                Self::resolve_index(name, attr)?;
            }
            for attr in attributes.values() {
                self.check_attribute(name, attr, &flattened)?;
            }
            let id = ClassId::new(u32::try_from(idx).unwrap_or(u32::MAX));
            resolved.insert(
                name.clone(),
                ResolvedClass {
                    id,
                    name: name.clone(),
                    scope: def.scope,
                    extends: def.extends.clone(),
                    attributes,
                    primary_key,
                    events: def.events.clone(),
                    auto_sequence_start: def.auto_sequence_start,
                    page_length: def.page_length,
                },
            );
        }

        Ok(SealedCatalog { classes: resolved })
    }

    fn flatten(
        &self,
        name: &str,
        done: &mut HashMap<String, IndexMap<String, Attribute>>,
        visiting: &mut Vec<String>,
    ) -> ModelResult<()> {
        if done.contains_key(name) {
            return Ok(());
        }
        if visiting.iter().any(|v| v == name) {
            return Err(ModelError::InheritanceCycle {
                class: name.to_owned(),
            });
        }
        let def = self.classes.get(name).ok_or_else(|| ModelError::UnknownClass {
            class: visiting.last().cloned().unwrap_or_default(),
            target: name.to_owned(),
        })?;

        visiting.push(name.to_owned());
        let mut attributes = match &def.extends {
            Some(parent) => {
                self.flatten(parent, done, visiting)?;
                done[parent].clone()
            }
            None => IndexMap::new(),
        };
        visiting.pop();

        for (attr_name, attr) in &def.attributes {
            if attr.kind == AttributeKind::Removed {
                if attributes.shift_remove(attr_name).is_none() {
                    return Err(ModelError::RemovedNotInherited {
                        class: name.to_owned(),
                        attribute: attr_name.clone(),
                    });
                }
            } else {
                attributes.insert(attr_name.clone(), attr.clone());
            }
        }
        done.insert(name.to_owned(), attributes);
        Ok(())
    }

    fn establish_primary_key(
        class: &str,
        attributes: &mut IndexMap<String, Attribute>,
    ) -> ModelResult<String> {
        let keys: Vec<String> = attributes
            .values()
            .filter(|a| a.prim_key)
            .map(|a| a.name.clone())
            .collect();
        match keys.as_slice() {
            [] => {
                let id = Attribute::storage("ID", ScalarType::Long)
                    .primary_key()
                    .autosequence()
                    .indexed(IndexKind::BTree)
                    .read_only();
                attributes.shift_insert(0, id.name.clone(), id);
                Ok("ID".to_owned())
            }
            [one] => Ok(one.clone()),
            _ => Err(ModelError::MultiplePrimaryKeys {
                class: class.to_owned(),
            }),
        }
    }

    fn resolve_index(class: &str, attr: &mut Attribute) -> ModelResult<()> {
        if attr.index == IndexKind::None {
            return Ok(());
        }
        let attr_name = attr.name.clone();
        let bad = move |message: &str| ModelError::BadIndex {
            class: class.to_owned(),
            attribute: attr_name.clone(),
            message: message.to_owned(),
        };
        if !attr.is_stored() {
            return Err(bad("only stored attributes can be indexed"));
        }
        let scalar = attr.scalar_type();
        if attr.index == IndexKind::Auto {
            attr.index = match scalar {
                Some(ScalarType::Object) => IndexKind::ObjectPath,
                _ => IndexKind::BTree,
            };
        }
        match attr.index {
            IndexKind::Keywords if scalar != Some(ScalarType::Text) => {
                Err(bad("keywords indexes require a text attribute"))
            }
            IndexKind::ObjectPath if scalar != Some(ScalarType::Object) => {
                Err(bad("objectPath indexes require an object attribute"))
            }
            _ if matches!(scalar, Some(ScalarType::Blob | ScalarType::Image)) => {
                Err(bad("blob attributes cannot be indexed"))
            }
            _ => Ok(()),
        }
    }

    fn check_attribute(
        &self,
        class: &str,
        attr: &Attribute,
        flattened: &HashMap<String, IndexMap<String, Attribute>>,
    ) -> ModelResult<()> {
        if attr.pattern.is_some() && attr.scalar_type() != Some(ScalarType::Text) {
            return Err(ModelError::BadPattern {
                attribute: format!("{class}.{}", attr.name),
                message: "patterns apply to text attributes only".to_owned(),
            });
        }
        match attr.kind {
            AttributeKind::Calculated => {
                if attr.on_get.is_none() {
                    return Err(ModelError::CalculatedWithoutGet {
                        class: class.to_owned(),
                        attribute: attr.name.clone(),
                    });
                }
                Ok(())
            }
            AttributeKind::RelatedEntity => self.require_class(class, attr.related_class()),
            AttributeKind::RelatedEntities => {
                self.require_class(class, attr.related_class())?;
                let target = attr.related_class().unwrap_or_default();
                let reverse = attr.path.as_deref().ok_or_else(|| ModelError::BadPath {
                    class: class.to_owned(),
                    attribute: attr.name.clone(),
                    message: "missing reverse relation attribute".to_owned(),
                })?;
                let reverse_attr =
                    flattened
                        .get(target)
                        .and_then(|m| m.get(reverse))
                        .ok_or_else(|| ModelError::BadPath {
                            class: class.to_owned(),
                            attribute: attr.name.clone(),
                            message: format!("{target}.{reverse} does not exist"),
                        })?;
                if reverse_attr.kind != AttributeKind::RelatedEntity
                    || reverse_attr.related_class() != Some(class)
                {
                    return Err(ModelError::BadPath {
                        class: class.to_owned(),
                        attribute: attr.name.clone(),
                        message: format!("{target}.{reverse} is not a relation back to {class}"),
                    });
                }
                Ok(())
            }
            AttributeKind::Alias => self.check_alias_path(class, attr, flattened),
            AttributeKind::Storage | AttributeKind::Removed => Ok(()),
        }
    }

    fn require_class(&self, class: &str, target: Option<&str>) -> ModelResult<()> {
        let target = target.unwrap_or_default();
        if self.classes.contains_key(target) {
            Ok(())
        } else {
            Err(ModelError::UnknownClass {
                class: class.to_owned(),
                target: target.to_owned(),
            })
        }
    }

    fn check_alias_path(
        &self,
        class: &str,
        attr: &Attribute,
        flattened: &HashMap<String, IndexMap<String, Attribute>>,
    ) -> ModelResult<()> {
        let bad = |message: String| ModelError::BadPath {
            class: class.to_owned(),
            attribute: attr.name.clone(),
            message,
        };
        let path = attr
            .path
            .as_deref()
            .ok_or_else(|| bad("alias attribute has no path".to_owned()))?;
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = class.to_owned();
        for (i, segment) in segments.iter().enumerate() {
            let attrs = flattened
                .get(&current)
                .ok_or_else(|| bad(format!("unknown class {current}")))?;
            let seg_attr = attrs
                .get(*segment)
                .ok_or_else(|| bad(format!("{current}.{segment} does not exist")))?;
            let last = i + 1 == segments.len();
            if last {
                match seg_attr.kind {
                    AttributeKind::Storage | AttributeKind::Calculated => {}
                    _ => return Err(bad(format!("{current}.{segment} is not a value attribute"))),
                }
            } else {
                if seg_attr.kind != AttributeKind::RelatedEntity {
                    return Err(bad(format!("{current}.{segment} is not a relation")));
                }
                current = seg_attr.related_class().unwrap_or_default().to_owned();
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An immutable, validated catalog ready to back an engine.
#[derive(Debug, Clone)]
pub struct SealedCatalog {
    classes: IndexMap<String, ResolvedClass>,
}

impl SealedCatalog {
    /// Resolves a class by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResolvedClass> {
        self.classes.get(name)
    }

    /// Resolves a class by ID.
    #[must_use]
    pub fn get_by_id(&self, id: ClassId) -> Option<&ResolvedClass> {
        self.classes.get_index(id.as_u32() as usize).map(|(_, c)| c)
    }

    /// Iterates classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &ResolvedClass> {
        self.classes.values()
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// True when the catalog holds no classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Attribute, IndexKind, ScalarType};
    use crate::class::DataClassDef;
    use crate::hooks::HookResult;
    use crate::value::Value;
    use std::sync::Arc;

    fn simple_catalog() -> Catalog {
        Catalog::new()
            .class(
                DataClassDef::new("Company")
                    .attribute(Attribute::storage("name", ScalarType::Text)),
            )
            .unwrap()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::storage("lastName", ScalarType::Text))
                    .attribute(Attribute::related_entity("employer", "Company")),
            )
            .unwrap()
    }

    #[test]
    fn implicit_primary_key_is_inserted_first() {
        let sealed = simple_catalog().seal().unwrap();
        let employee = sealed.get("Employee").unwrap();
        assert_eq!(employee.primary_key, "ID");
        assert_eq!(employee.attributes.get_index(0).unwrap().0, "ID");
        assert!(employee.primary_key_attribute().autosequence);
    }

    #[test]
    fn explicit_primary_key_wins() {
        let sealed = Catalog::new()
            .class(
                DataClassDef::new("Country").attribute(
                    Attribute::storage("code", ScalarType::Text)
                        .primary_key()
                        .fixed_length(2),
                ),
            )
            .unwrap()
            .seal()
            .unwrap();
        assert_eq!(sealed.get("Country").unwrap().primary_key, "code");
    }

    #[test]
    fn unknown_relation_target_fails() {
        let result = Catalog::new()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::related_entity("employer", "Nowhere")),
            )
            .unwrap()
            .seal();
        assert!(matches!(result, Err(ModelError::UnknownClass { .. })));
    }

    #[test]
    fn inheritance_flattens_and_removed_retracts() {
        let sealed = Catalog::new()
            .class(
                DataClassDef::new("Person")
                    .attribute(Attribute::storage("name", ScalarType::Text))
                    .attribute(Attribute::storage("internalNote", ScalarType::Text)),
            )
            .unwrap()
            .class(
                DataClassDef::new("Manager")
                    .extends("Person")
                    .attribute(Attribute::storage("teamSize", ScalarType::Long))
                    .attribute(Attribute::removed("internalNote")),
            )
            .unwrap()
            .seal()
            .unwrap();

        let manager = sealed.get("Manager").unwrap();
        assert!(manager.attribute("name").is_some());
        assert!(manager.attribute("teamSize").is_some());
        assert!(manager.attribute("internalNote").is_none());
    }

    #[test]
    fn removed_without_parent_attribute_fails() {
        let result = Catalog::new()
            .class(DataClassDef::new("A").attribute(Attribute::removed("ghost")))
            .unwrap()
            .seal();
        assert!(matches!(result, Err(ModelError::RemovedNotInherited { .. })));
    }

    #[test]
    fn inheritance_cycle_detected() {
        let result = Catalog::new()
            .class(DataClassDef::new("A").extends("B"))
            .unwrap()
            .class(DataClassDef::new("B").extends("A"))
            .unwrap()
            .seal();
        assert!(matches!(result, Err(ModelError::InheritanceCycle { .. })));
    }

    #[test]
    fn calculated_requires_on_get() {
        let result = Catalog::new()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::calculated("fullName", ScalarType::Text)),
            )
            .unwrap()
            .seal();
        assert!(matches!(result, Err(ModelError::CalculatedWithoutGet { .. })));
    }

    #[test]
    fn auto_index_resolves_by_type() {
        let sealed = Catalog::new()
            .class(
                DataClassDef::new("Article")
                    .attribute(Attribute::storage("title", ScalarType::Text).indexed(IndexKind::Auto))
                    .attribute(
                        Attribute::storage("keywords", ScalarType::Object)
                            .indexed(IndexKind::Auto),
                    ),
            )
            .unwrap()
            .seal()
            .unwrap();
        let article = sealed.get("Article").unwrap();
        assert_eq!(article.attribute("title").unwrap().index, IndexKind::BTree);
        assert_eq!(
            article.attribute("keywords").unwrap().index,
            IndexKind::ObjectPath
        );
    }

    #[test]
    fn keywords_index_requires_text() {
        let result = Catalog::new()
            .class(
                DataClassDef::new("Box").attribute(
                    Attribute::storage("size", ScalarType::Long).indexed(IndexKind::Keywords),
                ),
            )
            .unwrap()
            .seal();
        assert!(matches!(result, Err(ModelError::BadIndex { .. })));
    }

    #[test]
    fn alias_path_resolves_through_relations() {
        let sealed = Catalog::new()
            .class(
                DataClassDef::new("City").attribute(Attribute::storage("name", ScalarType::Text)),
            )
            .unwrap()
            .class(
                DataClassDef::new("Company")
                    .attribute(Attribute::storage("name", ScalarType::Text))
                    .attribute(Attribute::related_entity("location", "City")),
            )
            .unwrap()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::related_entity("employer", "Company"))
                    .attribute(Attribute::alias(
                        "employerCity",
                        ScalarType::Text,
                        "employer.location.name",
                    )),
            )
            .unwrap()
            .seal()
            .unwrap();
        assert!(sealed.get("Employee").unwrap().attribute("employerCity").is_some());
    }

    #[test]
    fn bad_alias_path_fails() {
        let result = Catalog::new()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::storage("name", ScalarType::Text))
                    .attribute(Attribute::alias(
                        "broken",
                        ScalarType::Text,
                        "name.deeper",
                    )),
            )
            .unwrap()
            .seal();
        assert!(matches!(result, Err(ModelError::BadPath { .. })));
    }

    #[test]
    fn reverse_relation_checked() {
        let sealed = Catalog::new()
            .class(
                DataClassDef::new("Company")
                    .attribute(Attribute::storage("name", ScalarType::Text))
                    .attribute(Attribute::related_entities("staff", "Employee", "employer")),
            )
            .unwrap()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::related_entity("employer", "Company")),
            )
            .unwrap()
            .seal()
            .unwrap();
        assert!(sealed.get("Company").unwrap().attribute("staff").is_some());
    }

    #[test]
    fn calculated_with_hook_seals() {
        let sealed = Catalog::new()
            .class(
                DataClassDef::new("Employee")
                    .attribute(Attribute::storage("firstName", ScalarType::Text))
                    .attribute(Attribute::storage("lastName", ScalarType::Text))
                    .attribute(
                        Attribute::calculated("fullName", ScalarType::Text).on_get(Arc::new(
                            |record| -> HookResult<Value> {
                                let first = record
                                    .attribute("firstName")
                                    .and_then(|v| v.as_text().map(str::to_owned))
                                    .unwrap_or_default();
                                let last = record
                                    .attribute("lastName")
                                    .and_then(|v| v.as_text().map(str::to_owned))
                                    .unwrap_or_default();
                                Ok(Value::Text(format!("{first} {last}")))
                            },
                        )),
                    ),
            )
            .unwrap()
            .seal()
            .unwrap();
        assert_eq!(sealed.len(), 1);
    }
}
