//! Type descriptors used by the graph validator (spec §3, §4.4).
//!
//! `Value` itself is never inspected by the engine; it only carries
//! [`serde_json::Value`] payloads between phases. A [`TypeDescriptor`] is
//! the declared *shape name* a node promises to produce/consume, checked
//! statically before a `Run` ever begins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The payload carried between phases and across edges. An alias rather
/// than a newtype: nodes build and destructure `serde_json::Value`
/// directly, and the engine never does more than move it around.
pub type Value = serde_json::Value;

/// Either a concrete named type or the universal top-type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDescriptor {
    /// A concrete, named type identity (e.g. `"string"`, `"order.v1"`).
    Concrete(String),
    /// The universal top-type: assignable to and from anything.
    Any,
}

impl TypeDescriptor {
    pub fn concrete(name: impl Into<String>) -> Self {
        TypeDescriptor::Concrete(name.into())
    }

    pub fn any() -> Self {
        TypeDescriptor::Any
    }

    /// `T -> any`, `any -> T`, and `T -> T` hold; anything else doesn't
    /// (spec §3, Type descriptor).
    pub fn assignable_to(&self, other: &TypeDescriptor) -> bool {
        match (self, other) {
            (TypeDescriptor::Any, _) | (_, TypeDescriptor::Any) => true,
            (TypeDescriptor::Concrete(a), TypeDescriptor::Concrete(b)) => a == b,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Concrete(name) => write!(f, "{name}"),
            TypeDescriptor::Any => write!(f, "any"),
        }
    }
}

impl Default for TypeDescriptor {
    fn default() -> Self {
        TypeDescriptor::Any
    }
}

impl From<&str> for TypeDescriptor {
    fn from(value: &str) -> Self {
        TypeDescriptor::Concrete(value.to_string())
    }
}

impl From<String> for TypeDescriptor {
    fn from(value: String) -> Self {
        TypeDescriptor::Concrete(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_is_assignable_both_ways() {
        let any = TypeDescriptor::any();
        let t = TypeDescriptor::concrete("order");
        assert!(t.assignable_to(&any));
        assert!(any.assignable_to(&t));
    }

    #[test]
    fn identical_concrete_types_are_assignable() {
        let a = TypeDescriptor::concrete("order");
        let b = TypeDescriptor::concrete("order");
        assert!(a.assignable_to(&b));
    }

    #[test]
    fn distinct_concrete_types_are_not_assignable() {
        let a = TypeDescriptor::concrete("order");
        let b = TypeDescriptor::concrete("invoice");
        assert!(!a.assignable_to(&b));
    }
}
