//! Registry mapping step types to implementations.

use super::{BarrierStep, ForkStep, NoOpStep, RestraintStep, SectionStep, Step};
use crate::errors::{EngineError, EngineResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory registry of steps.
#[derive(Default)]
pub struct StepRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Step>>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in steps.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        {
            let mut entries = registry.entries.write();
            for step in [
                Arc::new(NoOpStep) as Arc<dyn Step>,
                Arc::new(SectionStep),
                Arc::new(ForkStep),
                Arc::new(BarrierStep),
                Arc::new(RestraintStep),
            ] {
                entries.insert(step.step_type().to_string(), step);
            }
        }
        registry
    }

    /// Registers a step under its type.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error when the type is already bound.
    pub fn register(&self, step: Arc<dyn Step>) -> EngineResult<()> {
        let step_type = step.step_type().to_string();
        let mut entries = self.entries.write();
        if entries.contains_key(&step_type) {
            return Err(EngineError::duplicate_registration("step", step_type));
        }
        entries.insert(step_type, step);
        Ok(())
    }

    /// Looks up a step by type.
    ///
    /// # Errors
    ///
    /// Returns a not-registered error when the type is unbound.
    pub fn obtain(&self, step_type: &str) -> EngineResult<Arc<dyn Step>> {
        self.entries
            .read()
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::not_registered("step", step_type))
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
    use crate::steps::{StepContext, StepResponse};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct DeployStep;

    #[async_trait]
    impl Step for DeployStep {
        fn step_type(&self) -> &str {
            "deploy"
        }

        async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
            Ok(StepResponse::succeeded())
        }
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = StepRegistry::with_builtins();
        assert_eq!(
            registry.registered_types(),
            vec!["barrier", "fork", "noop", "restraint", "section"]
        );
    }

    #[test]
    fn test_register_and_obtain() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(DeployStep)).unwrap();

        let step = registry.obtain("deploy").unwrap();
        assert_eq!(step.step_type(), "deploy");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(DeployStep)).unwrap();

        let err = registry.register(Arc::new(DeployStep)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRegistration { .. }));
    }

    #[test]
    fn test_obtain_unregistered_fails() {
        let registry = StepRegistry::new();
        let err = registry.obtain("missing").unwrap_err();
        assert!(matches!(err, EngineError::NotRegistered { .. }));
    }
}
