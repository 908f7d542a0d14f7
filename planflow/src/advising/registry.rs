//! Registry mapping adviser types to implementations.

use super::{
    Adviser, ManualInterventionAdviser, OnAbortAdviser, OnFailAdviser, OnSuccessAdviser,
    RetryAdviser,
};
use crate::errors::{EngineError, EngineResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory registry of advisers.
#[derive(Default)]
pub struct AdviserRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Adviser>>>,
}

impl AdviserRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in advisers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        {
            let mut entries = registry.entries.write();
            for adviser in [
                Arc::new(OnFailAdviser) as Arc<dyn Adviser>,
                Arc::new(OnSuccessAdviser),
                Arc::new(OnAbortAdviser),
                Arc::new(RetryAdviser),
                Arc::new(ManualInterventionAdviser),
            ] {
                entries.insert(adviser.adviser_type().to_string(), adviser);
            }
        }
        registry
    }

    /// Registers an adviser under its type.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error when the type is already bound.
    pub fn register(&self, adviser: Arc<dyn Adviser>) -> EngineResult<()> {
        let adviser_type = adviser.adviser_type().to_string();
        let mut entries = self.entries.write();
        if entries.contains_key(&adviser_type) {
            return Err(EngineError::duplicate_registration("adviser", adviser_type));
        }
        entries.insert(adviser_type, adviser);
        Ok(())
    }

    /// Looks up an adviser by type.
    ///
    /// # Errors
    ///
    /// Returns a not-registered error when the type is unbound.
    pub fn obtain(&self, adviser_type: &str) -> EngineResult<Arc<dyn Adviser>> {
        self.entries
            .read()
            .get(adviser_type)
            .cloned()
            .ok_or_else(|| EngineError::not_registered("adviser", adviser_type))
    }

    /// Returns the registered types, sorted.
    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.read().keys().cloned().collect();
        types.sort();
        types
    }
}
