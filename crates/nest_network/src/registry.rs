//! Nest registry: every nest of one network, keyed by id.

use std::collections::BTreeMap;

use crate::error::NestError;
use crate::identity::NestId;
use crate::nest::Nest;

/// Registry of all nests in a network.
///
/// Filled while the topology is built and only read afterwards.
#[derive(Debug, Default)]
pub struct NestRegistry {
    nests: BTreeMap<NestId, Nest>,
}

impl NestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a nest. Ids are unique within a network.
    pub fn add_nest(&mut self, nest: Nest) -> Result<(), NestError> {
        if self.nests.contains_key(nest.id()) {
            return Err(NestError::DuplicateNest(nest.id().clone()));
        }
        self.nests.insert(nest.id().clone(), nest);
        Ok(())
    }

    /// Get a nest by id, treating an unknown id as an error.
    pub fn require(&self, id: &NestId) -> Result<&Nest, NestError> {
        self.nests
            .get(id)
            .ok_or_else(|| NestError::NoSuchNode(id.clone()))
    }

    pub fn contains(&self, id: &NestId) -> bool {
        self.nests.contains_key(id)
    }

    /// All nests, ordered by id.
    pub fn list_all(&self) -> Vec<&Nest> {
        self.nests.values().collect()
    }

    pub fn ids(&self) -> Vec<NestId> {
        self.nests.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_nest(name: &str) -> Nest {
        Nest::new(NestId::from(name), 8)
    }

    #[test]
    fn test_registry_add_and_get() {
        let mut registry = NestRegistry::new();
        registry.add_nest(make_nest("Big Oak")).unwrap();
        assert_eq!(registry.ids(), vec![NestId::from("Big Oak")]);
        assert!(registry.require(&NestId::from("Big Oak")).is_ok());
        assert!(registry.contains(&NestId::from("Big Oak")));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = NestRegistry::new();
        registry.add_nest(make_nest("Chateau")).unwrap();
        let err = registry.add_nest(make_nest("Chateau")).unwrap_err();
        assert_eq!(err, NestError::DuplicateNest(NestId::from("Chateau")));
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn test_registry_require_unknown() {
        let registry = NestRegistry::new();
        let err = registry.require(&NestId::from("Woods")).unwrap_err();
        assert_eq!(err, NestError::NoSuchNode(NestId::from("Woods")));
    }

    #[test]
    fn test_registry_lists_in_id_order() {
        let mut registry = NestRegistry::new();
        for name in ["c", "a", "b"] {
            registry.add_nest(make_nest(name)).unwrap();
        }
        let ids: Vec<String> = registry.ids().into_iter().map(|id| id.0).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(registry.list_all().len(), 3);
    }
}
