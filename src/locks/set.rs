use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use crate::tree::ResourceKey;

/// How a node wants to use a resource.
///
/// Ordered so that `Exclusive > Shared`; merging two requests for the same
/// key keeps the stronger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Shared,
    Exclusive,
}

impl AccessMode {
    pub fn merge(self, other: AccessMode) -> AccessMode {
        self.max(other)
    }

    /// Whether holding `self` already satisfies a request for `requested`
    pub fn covers(self, requested: AccessMode) -> bool {
        self >= requested
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Shared => write!(f, "shared"),
            AccessMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A single declared need for a named resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub key: ResourceKey,
    pub mode: AccessMode,
}

impl ResourceRequirement {
    pub fn new(key: impl Into<ResourceKey>, mode: AccessMode) -> Self {
        Self {
            key: key.into(),
            mode,
        }
    }

    pub fn exclusive(key: impl Into<ResourceKey>) -> Self {
        Self::new(key, AccessMode::Exclusive)
    }

    pub fn shared(key: impl Into<ResourceKey>) -> Self {
        Self::new(key, AccessMode::Shared)
    }
}

/// Resource keys with their access mode, iterated in ascending key order.
///
/// The iteration order is the global acquisition order used by the
/// [`LockRegistry`](super::LockRegistry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockSet(BTreeMap<ResourceKey, AccessMode>);

impl LockSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a requirement, keeping the stronger mode on collision
    pub fn insert(&mut self, key: impl Into<ResourceKey>, mode: AccessMode) {
        self.0
            .entry(key.into())
            .and_modify(|held| *held = held.merge(mode))
            .or_insert(mode);
    }

    pub fn extend_from(&mut self, other: &LockSet) {
        for (key, mode) in other.iter() {
            self.insert(key.clone(), *mode);
        }
    }

    pub fn merged(&self, other: &LockSet) -> LockSet {
        let mut out = self.clone();
        out.extend_from(other);
        out
    }

    pub fn get(&self, key: &str) -> Option<AccessMode> {
        self.0.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_exclusive(&self) -> bool {
        self.0.values().any(|mode| *mode == AccessMode::Exclusive)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ResourceKey, AccessMode> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.0.keys()
    }
}

impl FromIterator<ResourceRequirement> for LockSet {
    fn from_iter<I: IntoIterator<Item = ResourceRequirement>>(iter: I) -> Self {
        let mut set = LockSet::new();
        for req in iter {
            set.insert(req.key, req.mode);
        }
        set
    }
}

impl<K: Into<ResourceKey>> FromIterator<(K, AccessMode)> for LockSet {
    fn from_iter<I: IntoIterator<Item = (K, AccessMode)>>(iter: I) -> Self {
        let mut set = LockSet::new();
        for (key, mode) in iter {
            set.insert(key, mode);
        }
        set
    }
}

impl<'a> IntoIterator for &'a LockSet {
    type Item = (&'a ResourceKey, &'a AccessMode);
    type IntoIter = btree_map::Iter<'a, ResourceKey, AccessMode>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (key, mode)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}:{mode}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_keeps_stronger_mode() {
        let mut set = LockSet::new();
        set.insert("db", AccessMode::Shared);
        set.insert("db", AccessMode::Exclusive);
        set.insert("db", AccessMode::Shared);
        assert_eq!(set.get("db"), Some(AccessMode::Exclusive));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_iteration_is_key_ordered() {
        let set: LockSet = vec![
            ResourceRequirement::shared("zeta"),
            ResourceRequirement::exclusive("alpha"),
            ResourceRequirement::shared("mid"),
        ]
        .into_iter()
        .collect();
        let keys: Vec<&str> = set.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
        assert_eq!(set.to_string(), "[alpha:exclusive, mid:shared, zeta:shared]");
    }

    #[test]
    fn test_covers() {
        assert!(AccessMode::Exclusive.covers(AccessMode::Shared));
        assert!(AccessMode::Shared.covers(AccessMode::Shared));
        assert!(!AccessMode::Shared.covers(AccessMode::Exclusive));
    }

    #[test]
    fn test_merged_and_has_exclusive() {
        let a: LockSet = [("a", AccessMode::Shared)].into_iter().collect();
        let b: LockSet = [("b", AccessMode::Exclusive)].into_iter().collect();
        assert!(!a.has_exclusive());
        let both = a.merged(&b);
        assert!(both.has_exclusive());
        assert_eq!(both.len(), 2);
        assert_eq!(a.len(), 1);
    }
}
