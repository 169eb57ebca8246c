//! Data class definitions.

use crate::attribute::Attribute;
use crate::hooks::EventChain;
use indexmap::IndexMap;
use std::fmt;

/// Visibility scope of a data class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassScope {
    /// Reachable from anywhere, including remote callers.
    #[default]
    Public,
    /// Reachable only from server-side code.
    PublicOnServer,
}

impl fmt::Display for ClassScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::PublicOnServer => write!(f, "public on server"),
        }
    }
}

/// Default number of entities a query page holds.
pub const DEFAULT_PAGE_LENGTH: usize = 40;

/// Definition of one data class: name, scope, ordered attributes, optional
/// parent class, event handlers and the autosequence start value.
#[derive(Clone)]
pub struct DataClassDef {
    /// Class name.
    pub name: String,
    /// Visibility scope.
    pub scope: ClassScope,
    /// Parent class for derived classes.
    pub extends: Option<String>,
    /// Attributes in declaration order.
    pub attributes: IndexMap<String, Attribute>,
    /// Class-level event handlers.
    pub events: EventChain,
    /// First value handed out by the autosequence counter.
    pub auto_sequence_start: i64,
    /// Default collection page length for this class.
    pub page_length: usize,
}

impl DataClassDef {
    /// Creates an empty public class.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: ClassScope::Public,
            extends: None,
            attributes: IndexMap::new(),
            events: EventChain::new(),
            auto_sequence_start: 1,
            page_length: DEFAULT_PAGE_LENGTH,
        }
    }

    /// Sets the visibility scope.
    #[must_use]
    pub fn scope(mut self, scope: ClassScope) -> Self {
        self.scope = scope;
        self
    }

    /// Derives this class from a parent class.
    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    /// Adds an attribute. A later declaration with the same name replaces
    /// the earlier one, mirroring plain assignment on a model object.
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }

    /// Sets the autosequence start value.
    #[must_use]
    pub fn auto_sequence_start(mut self, start: i64) -> Self {
        self.auto_sequence_start = start;
        self
    }

    /// Sets the default collection page length.
    #[must_use]
    pub fn page_length(mut self, len: usize) -> Self {
        self.page_length = len;
        self
    }

    /// Installs the class event chain.
    #[must_use]
    pub fn events(mut self, events: EventChain) -> Self {
        self.events = events;
        self
    }
}

impl fmt::Debug for DataClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataClassDef")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("extends", &self.extends)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Attribute, ScalarType};

    #[test]
    fn builder_keeps_declaration_order() {
        let def = DataClassDef::new("Employee")
            .attribute(Attribute::storage("lastName", ScalarType::Text))
            .attribute(Attribute::storage("salary", ScalarType::Number));
        let names: Vec<_> = def.attributes.keys().cloned().collect();
        assert_eq!(names, ["lastName", "salary"]);
    }

    #[test]
    fn scope_display() {
        assert_eq!(ClassScope::Public.to_string(), "public");
        assert_eq!(ClassScope::PublicOnServer.to_string(), "public on server");
    }
}
