//! Runtime type identity

use crate::metadata::TypeRef;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Cheaply clonable full type name used as the runtime identity of a type.
///
/// Keys are produced from metadata references ([`TypeRef::full_name`]) so a
/// type woven in one module and referenced from another maps to the same key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(Arc<str>);

impl TypeKey {
    /// Create a key from a full type name
    #[inline]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The full type name
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without its namespace (`Game.Player` gives `Player`)
    pub fn short_name(&self) -> &str {
        let name = self.0.split('<').next().unwrap_or(&self.0);
        let start = name.rfind(['.', '/']).map(|i| i + 1).unwrap_or(0);
        &self.0[start..]
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.0)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TypeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TypeKey {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&TypeRef> for TypeKey {
    fn from(type_ref: &TypeRef) -> Self {
        Self::from(type_ref.full_name())
    }
}

impl From<&TypeKey> for TypeKey {
    fn from(key: &TypeKey) -> Self {
        key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(TypeKey::new("Game.Systems.Player").short_name(), "Player");
        assert_eq!(TypeKey::new("Game.Outer/Inner").short_name(), "Inner");
        assert_eq!(TypeKey::new("Plain").short_name(), "Plain");
    }

    #[test]
    fn test_lookup_by_str() {
        let mut keys = std::collections::HashSet::new();
        keys.insert(TypeKey::from(String::from("Game.Player")));
        assert!(keys.contains("Game.Player"));
        assert_eq!(TypeKey::from(&TypeKey::new("Game.Player")).to_string(), "Game.Player");
    }

    #[test]
    fn test_from_type_ref_uses_full_name() {
        let type_ref = TypeRef::generic(
            "Injection",
            "Injection.IItemObserver",
            vec![TypeRef::new("Game", "Game.Enemy")],
        );
        assert_eq!(
            TypeKey::from(&type_ref).as_str(),
            "Injection.IItemObserver<Game.Enemy>"
        );
    }
}
