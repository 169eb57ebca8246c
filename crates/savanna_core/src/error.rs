//! Error types for the Savanna engine.

use crate::types::{EntityKey, Stamp};
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors raised while parsing or executing a query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The predicate text did not parse.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset into the predicate text.
        offset: usize,
        /// What went wrong.
        message: String,
    },

    /// A placeholder has no matching argument.
    #[error("placeholder :{index} has no bound value")]
    UnboundPlaceholder {
        /// 1-based placeholder index.
        index: usize,
    },

    /// The predicate names an attribute the class does not have.
    #[error("unknown attribute {attribute} on class {class}")]
    UnknownAttribute {
        /// The queried class.
        class: String,
        /// The missing attribute.
        attribute: String,
    },

    /// A calculated attribute was queried without an `on_query` rewrite.
    #[error("attribute {attribute} is calculated and has no on_query hook")]
    NoQueryHook {
        /// The calculated attribute.
        attribute: String,
    },

    /// A `$`-clause was used without a script evaluator installed.
    #[error("javascript clause used without an evaluator (allowJavascript)")]
    NoScriptEvaluator,

    /// A regular expression operand did not compile.
    #[error("invalid regex operand: {message}")]
    BadRegex {
        /// Compiler message.
        message: String,
    },
}

/// Errors raised by the Savanna engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// A save was rejected by the validation chain or a structural
    /// constraint. Carries the code of the first failure and the ordered
    /// message stack.
    #[error("validation failed ({code}): {}", messages.join("; "))]
    Validation {
        /// Code of the first failing handler or constraint.
        code: i64,
        /// Ordered failure messages.
        messages: Vec<String>,
    },

    /// Optimistic concurrency conflict: the stored stamp moved since load.
    #[error("stamp conflict on {class}[{key}]: expected {expected}, found {found}")]
    StampConflict {
        /// Class name.
        class: String,
        /// Entity key.
        key: EntityKey,
        /// The stamp the saving context loaded.
        expected: Stamp,
        /// The stamp currently stored.
        found: Stamp,
    },

    /// Query parsing or planning failed.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// A virtual backend control method failed; the message is propagated
    /// verbatim.
    #[error("adapter error: {message}")]
    Adapter {
        /// The adapter's error text.
        message: String,
    },

    /// The named class is not in the catalog.
    #[error("unknown class: {name}")]
    UnknownClass {
        /// The class name.
        name: String,
    },

    /// The named attribute is not on the class.
    #[error("unknown attribute {attribute} on class {class}")]
    UnknownAttribute {
        /// The class name.
        class: String,
        /// The attribute name.
        attribute: String,
    },

    /// Writing to a read-only attribute.
    #[error("attribute {class}.{attribute} is read-only")]
    ReadOnlyAttribute {
        /// The class name.
        class: String,
        /// The attribute name.
        attribute: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },

    /// I/O failure during export or import.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON failure during export or import.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<savanna_model::HookError> for DbError {
    fn from(err: savanna_model::HookError) -> Self {
        Self::Validation {
            code: err.code,
            messages: vec![err.message],
        }
    }
}

impl DbError {
    /// Creates a validation error with a single message.
    pub fn validation(code: i64, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            messages: vec![message.into()],
        }
    }

    /// Creates an adapter error.
    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unknown-class error.
    pub fn unknown_class(name: impl Into<String>) -> Self {
        Self::UnknownClass { name: name.into() }
    }

    /// Creates an unknown-attribute error.
    pub fn unknown_attribute(class: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::UnknownAttribute {
            class: class.into(),
            attribute: attribute.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_stack_renders() {
        let err = DbError::Validation {
            code: 100,
            messages: vec!["first".into(), "second".into()],
        };
        let text = err.to_string();
        assert!(text.contains("100"));
        assert!(text.contains("first; second"));
    }

    #[test]
    fn stamp_conflict_names_the_entity() {
        let err = DbError::StampConflict {
            class: "Employee".into(),
            key: EntityKey::Long(4),
            expected: Stamp::new(5),
            found: Stamp::new(6),
        };
        assert!(err.to_string().contains("Employee[4]"));
    }
}
