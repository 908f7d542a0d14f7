//! Registry mapping facilitator types to implementations.

use super::{
    AsyncFacilitator, ChildFacilitator, ChildrenFacilitator, Facilitator, SkipFacilitator,
    SyncFacilitator,
};
use crate::errors::{EngineError, EngineResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory registry of facilitators.
#[derive(Default)]
pub struct FacilitatorRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Facilitator>>>,
}

impl FacilitatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with one built-in facilitator per execution mode.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        {
            let mut entries = registry.entries.write();
            for facilitator in [
                Arc::new(SyncFacilitator) as Arc<dyn Facilitator>,
                Arc::new(AsyncFacilitator),
                Arc::new(ChildFacilitator),
                Arc::new(ChildrenFacilitator),
                Arc::new(SkipFacilitator),
            ] {
                entries.insert(facilitator.facilitator_type().to_string(), facilitator);
            }
        }
        registry
    }

    /// Registers a facilitator under its type.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error when the type is already bound.
    pub fn register(&self, facilitator: Arc<dyn Facilitator>) -> EngineResult<()> {
        let facilitator_type = facilitator.facilitator_type().to_string();
        let mut entries = self.entries.write();
        if entries.contains_key(&facilitator_type) {
            return Err(EngineError::duplicate_registration(
                "facilitator",
                facilitator_type,
            ));
        }
        entries.insert(facilitator_type, facilitator);
        Ok(())
    }

    /// Looks up a facilitator by type.
    ///
    /// # Errors
    ///
    /// Returns a not-registered error when the type is unbound.
    pub fn obtain(&self, facilitator_type: &str) -> EngineResult<Arc<dyn Facilitator>> {
        self.entries
            .read()
            .get(facilitator_type)
            .cloned()
            .ok_or_else(|| EngineError::not_registered("facilitator", facilitator_type))
    }

    /// Returns the registered types, sorted.
    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtins_cover_every_mode() {
        let registry = FacilitatorRegistry::with_builtins();
        assert_eq!(
            registry.registered_types(),
            vec!["async", "child", "children", "skip", "sync"]
        );
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let registry = FacilitatorRegistry::with_builtins();
        let err = registry.register(Arc::new(SyncFacilitator)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRegistration { .. }));
    }

    #[test]
    fn test_unregistered_lookup_is_an_error() {
        let registry = FacilitatorRegistry::new();
        assert!(matches!(
            registry.obtain("sync"),
            Err(EngineError::NotRegistered { .. })
        ));
    }
}
