//! Core identifier types.

use savanna_model::Value;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Identifier of an execution context (one logical worker).
///
/// Context IDs are monotonically increasing and never reused; lock
/// ownership and transaction stacks are keyed by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Creates a context ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

/// Optimistic-concurrency version counter of an entity.
///
/// Incremented by exactly 1 on every durable save; a save whose expected
/// stamp no longer matches the stored stamp fails with a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Stamp(pub u64);

impl Stamp {
    /// Creates a stamp.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The next stamp.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stamp:{}", self.0)
    }
}

/// The primary-key value of an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EntityKey {
    /// Numeric key (autosequence keys land here).
    Long(i64),
    /// Text key.
    Text(String),
    /// UUID key (autogenerate keys land here).
    Uuid(Uuid),
}

impl EntityKey {
    /// Builds a key from an attribute value. Returns `None` for value types
    /// that cannot identify an entity.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Long(n) => Some(Self::Long(*n)),
            Value::Text(s) => Some(Self::Text(s.clone())),
            Value::Uuid(u) => Some(Self::Uuid(*u)),
            Value::Number(n) if n.fract() == 0.0 => Some(Self::Long(*n as i64)),
            _ => None,
        }
    }

    /// Converts the key back into an attribute value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Long(n) => Value::Long(*n),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Uuid(u) => Value::Uuid(*u),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<i64> for EntityKey {
    fn from(n: i64) -> Self {
        Self::Long(n)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<Uuid> for EntityKey {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_next() {
        assert_eq!(Stamp::new(5).next(), Stamp::new(6));
    }

    #[test]
    fn key_from_value_roundtrip() {
        let key = EntityKey::from_value(&Value::Long(7)).unwrap();
        assert_eq!(key.to_value(), Value::Long(7));

        let key = EntityKey::from_value(&Value::Text("ab".into())).unwrap();
        assert_eq!(key, EntityKey::Text("ab".into()));

        assert!(EntityKey::from_value(&Value::Bool(true)).is_none());
    }

    #[test]
    fn integral_number_is_a_long_key() {
        assert_eq!(
            EntityKey::from_value(&Value::Number(3.0)),
            Some(EntityKey::Long(3))
        );
        assert_eq!(EntityKey::from_value(&Value::Number(3.5)), None);
    }

    #[test]
    fn context_display() {
        assert_eq!(ContextId::new(9).to_string(), "ctx:9");
    }
}
