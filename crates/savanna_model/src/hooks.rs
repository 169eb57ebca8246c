//! Hook signatures and event handler chains.
//!
//! Hooks receive record views ([`Record`] / [`RecordMut`]) instead of engine
//! types, so the schema crate stays independent of the engine that executes
//! them.

use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Read-only view of a record a hook runs against.
pub trait Record {
    /// Returns the current value of a storage attribute, or `None` when the
    /// attribute does not exist on the record's class.
    fn attribute(&self, name: &str) -> Option<Value>;
}

/// Mutable view of a record for hooks that write back.
pub trait RecordMut: Record {
    /// Overwrites the value of a storage attribute.
    fn set_attribute(&mut self, name: &str, value: Value);
}

/// Error raised from inside a hook; surfaces as a validation failure or an
/// adapter error depending on the calling site.
#[derive(Debug, Clone)]
pub struct HookError {
    /// Application-defined error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl HookError {
    /// Creates a hook error.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for HookError {}

/// Result type for fallible hooks.
pub type HookResult<T> = Result<T, HookError>;

/// Computes the value of a calculated attribute.
pub type OnGet = Arc<dyn Fn(&dyn Record) -> HookResult<Value> + Send + Sync>;

/// Routes a write to a calculated attribute onto storage attributes.
pub type OnSet = Arc<dyn Fn(&mut dyn RecordMut, Value) -> HookResult<()> + Send + Sync>;

/// Rewrites a query clause on a calculated attribute.
///
/// Receives the comparator symbol and the compared value, and returns a
/// predicate string over storage attributes that replaces the clause.
pub type OnQuery = Arc<dyn Fn(&str, &Value) -> HookResult<String> + Send + Sync>;

/// Produces a surrogate sort expression for a calculated attribute, e.g.
/// `"birthdate desc"` when asked to sort an `age` attribute ascending.
pub type OnSort = Arc<dyn Fn(bool) -> String + Send + Sync>;

/// Outcome of a validate handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The record passed this handler.
    Ok,
    /// The record was rejected.
    Fail {
        /// Application-defined error code.
        code: i64,
        /// Message pushed onto the validation error stack.
        message: String,
    },
}

impl ValidationOutcome {
    /// Convenience constructor for a rejection.
    pub fn fail(code: i64, message: impl Into<String>) -> Self {
        Self::Fail {
            code,
            message: message.into(),
        }
    }
}

/// A validate event handler.
pub type ValidateHandler = Arc<dyn Fn(&dyn Record) -> ValidationOutcome + Send + Sync>;

/// A save / init / remove / set event handler.
pub type MutateHandler = Arc<dyn Fn(&mut dyn RecordMut) -> HookResult<()> + Send + Sync>;

/// An ordered chain of event handlers for one class or attribute.
///
/// `add_*` appends to the chain (listeners registered repeatedly all fire,
/// in registration order); `set_*` replaces the chain with a single handler,
/// which is what a plain `events.<name> = f` assignment amounts to.
#[derive(Clone, Default)]
pub struct EventChain {
    init: Vec<MutateHandler>,
    validate: Vec<ValidateHandler>,
    save: Vec<MutateHandler>,
    remove: Vec<MutateHandler>,
    set: Vec<MutateHandler>,
}

impl EventChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an init handler (fired when a new entity is created).
    pub fn add_init(&mut self, handler: MutateHandler) {
        self.init.push(handler);
    }

    /// Replaces the init chain with a single handler.
    pub fn set_init(&mut self, handler: MutateHandler) {
        self.init = vec![handler];
    }

    /// Appends a validate handler.
    pub fn add_validate(&mut self, handler: ValidateHandler) {
        self.validate.push(handler);
    }

    /// Replaces the validate chain with a single handler.
    pub fn set_validate(&mut self, handler: ValidateHandler) {
        self.validate = vec![handler];
    }

    /// Appends a save handler.
    pub fn add_save(&mut self, handler: MutateHandler) {
        self.save.push(handler);
    }

    /// Replaces the save chain with a single handler.
    pub fn set_save(&mut self, handler: MutateHandler) {
        self.save = vec![handler];
    }

    /// Appends a remove handler.
    pub fn add_remove(&mut self, handler: MutateHandler) {
        self.remove.push(handler);
    }

    /// Replaces the remove chain with a single handler.
    pub fn set_remove(&mut self, handler: MutateHandler) {
        self.remove = vec![handler];
    }

    /// Appends a set handler (fired after an attribute write).
    pub fn add_set(&mut self, handler: MutateHandler) {
        self.set.push(handler);
    }

    /// Replaces the set chain with a single handler.
    pub fn set_set(&mut self, handler: MutateHandler) {
        self.set = vec![handler];
    }

    /// Init handlers in registration order.
    #[must_use]
    pub fn init_handlers(&self) -> &[MutateHandler] {
        &self.init
    }

    /// Validate handlers in registration order.
    #[must_use]
    pub fn validate_handlers(&self) -> &[ValidateHandler] {
        &self.validate
    }

    /// Save handlers in registration order.
    #[must_use]
    pub fn save_handlers(&self) -> &[MutateHandler] {
        &self.save
    }

    /// Remove handlers in registration order.
    #[must_use]
    pub fn remove_handlers(&self) -> &[MutateHandler] {
        &self.remove
    }

    /// Set handlers in registration order.
    #[must_use]
    pub fn set_handlers(&self) -> &[MutateHandler] {
        &self.set
    }

    /// True when no handler is registered for any event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.init.is_empty()
            && self.validate.is_empty()
            && self.save.is_empty()
            && self.remove.is_empty()
            && self.set.is_empty()
    }
}

impl fmt::Debug for EventChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChain")
            .field("init", &self.init.len())
            .field("validate", &self.validate.len())
            .field("save", &self.save.len())
            .field("remove", &self.remove.len())
            .field("set", &self.set.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeRecord(HashMap<String, Value>);

    impl Record for FakeRecord {
        fn attribute(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    #[test]
    fn add_appends_set_replaces() {
        let mut chain = EventChain::new();
        chain.add_validate(Arc::new(|_| ValidationOutcome::Ok));
        chain.add_validate(Arc::new(|_| ValidationOutcome::fail(1, "no")));
        assert_eq!(chain.validate_handlers().len(), 2);

        chain.set_validate(Arc::new(|_| ValidationOutcome::Ok));
        assert_eq!(chain.validate_handlers().len(), 1);
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let mut chain = EventChain::new();
        chain.add_validate(Arc::new(|r| {
            if r.attribute("name").is_some() {
                ValidationOutcome::Ok
            } else {
                ValidationOutcome::fail(10, "missing name")
            }
        }));
        chain.add_validate(Arc::new(|_| ValidationOutcome::fail(20, "always")));

        let record = FakeRecord(HashMap::from([("name".to_owned(), Value::from("x"))]));
        let outcomes: Vec<_> = chain
            .validate_handlers()
            .iter()
            .map(|h| h(&record))
            .collect();
        assert_eq!(outcomes[0], ValidationOutcome::Ok);
        assert!(matches!(outcomes[1], ValidationOutcome::Fail { code: 20, .. }));
    }
}
