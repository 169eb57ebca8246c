//! Schema definition errors.

use thiserror::Error;

/// Result type for schema operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while defining or sealing a catalog.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A class name was registered twice.
    #[error("duplicate class: {name}")]
    DuplicateClass {
        /// The class name.
        name: String,
    },

    /// A class references an unknown parent or relation target.
    #[error("class {class} references unknown class {target}")]
    UnknownClass {
        /// The referencing class.
        class: String,
        /// The missing class.
        target: String,
    },

    /// The inheritance chain loops.
    #[error("inheritance cycle through class {class}")]
    InheritanceCycle {
        /// A class on the cycle.
        class: String,
    },

    /// More than one attribute is marked as the primary key.
    #[error("class {class} declares more than one primary key")]
    MultiplePrimaryKeys {
        /// The class name.
        class: String,
    },

    /// An index kind does not fit the attribute type.
    #[error("invalid index on {class}.{attribute}: {message}")]
    BadIndex {
        /// The class name.
        class: String,
        /// The attribute name.
        attribute: String,
        /// What is wrong.
        message: String,
    },

    /// An alias or reverse-relation path does not resolve.
    #[error("invalid path on {class}.{attribute}: {message}")]
    BadPath {
        /// The class name.
        class: String,
        /// The attribute name.
        attribute: String,
        /// What is wrong.
        message: String,
    },

    /// An entry pattern failed to compile.
    #[error("invalid pattern on attribute {attribute}: {message}")]
    BadPattern {
        /// The attribute name.
        attribute: String,
        /// Compiler message.
        message: String,
    },

    /// A calculated attribute is missing its `on_get` hook.
    #[error("calculated attribute {class}.{attribute} has no on_get hook")]
    CalculatedWithoutGet {
        /// The class name.
        class: String,
        /// The attribute name.
        attribute: String,
    },

    /// A `removed` attribute does not retract anything.
    #[error("attribute {class}.{attribute} is marked removed but is not inherited")]
    RemovedNotInherited {
        /// The class name.
        class: String,
        /// The attribute name.
        attribute: String,
    },
}
