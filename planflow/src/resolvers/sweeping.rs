//! Resolver for cross-node scratch data published into enclosing scopes.

use super::{consume_instance, resolve_instance, Resolver};
use crate::ambiance::Ambiance;
use crate::core::{RefObject, RefType};
use crate::errors::EngineResult;
use crate::store::ExecutionStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Resolves [`RefType::SweepingOutput`] references.
///
/// Sweeping outputs are looked up by name and scope only; they carry no
/// producer-qualified form.
pub struct SweepingOutputResolver {
    store: Arc<dyn ExecutionStore>,
}

impl SweepingOutputResolver {
    /// Creates a sweeping-output resolver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Resolver for SweepingOutputResolver {
    fn ref_type(&self) -> RefType {
        RefType::SweepingOutput
    }

    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> EngineResult<Value> {
        resolve_instance(
            &self.store,
            ambiance,
            RefType::SweepingOutput,
            ref_object,
            false,
        )
        .await
    }

    async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: Value,
        levels_to_keep: usize,
    ) -> EngineResult<String> {
        consume_instance(
            &self.store,
            ambiance,
            RefType::SweepingOutput,
            name,
            value,
            levels_to_keep,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Level, StepCategory};
    use crate::plan::PlanNode;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn level(setup_id: &str, category: StepCategory) -> Level {
        Level::from_plan_node(&PlanNode::new(setup_id, setup_id, "noop").with_category(category))
    }

    #[tokio::test]
    async fn test_stage_scope_is_invisible_outside_the_stage() {
        let resolver = SweepingOutputResolver::new(Arc::new(InMemoryStore::new()));
        let root = Ambiance::new(
            "pe-1",
            "plan",
            HashMap::new(),
            level("pipeline", StepCategory::Pipeline),
        );
        let stage_a = root.clone_for_child(level("stage-a", StepCategory::Stage));
        let stage_b = root.clone_for_child(level("stage-b", StepCategory::Stage));

        let producer = stage_a.clone_for_child(level("init", StepCategory::Step));
        resolver
            .consume(&producer, "workdir", json!("/tmp/a"), 2)
            .await
            .unwrap();

        let sibling = stage_a.clone_for_child(level("run", StepCategory::Step));
        let resolved = resolver
            .resolve(&sibling, &RefObject::sweeping_output("workdir"))
            .await
            .unwrap();
        assert_eq!(resolved, json!("/tmp/a"));

        let outside = stage_b.clone_for_child(level("run-b", StepCategory::Step));
        assert!(resolver
            .resolve(&outside, &RefObject::sweeping_output("workdir"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dotted_names_are_taken_literally() {
        let resolver = SweepingOutputResolver::new(Arc::new(InMemoryStore::new()));
        let root = Ambiance::new(
            "pe-1",
            "plan",
            HashMap::new(),
            level("pipeline", StepCategory::Pipeline),
        );
        let producer = root.clone_for_child(level("init", StepCategory::Step));
        resolver
            .consume(&producer, "app.config", json!({"retries": 2}), 1)
            .await
            .unwrap();

        let consumer = root.clone_for_child(level("run", StepCategory::Step));
        let resolved = resolver
            .resolve(&consumer, &RefObject::sweeping_output("app.config"))
            .await
            .unwrap();
        assert_eq!(resolved, json!({"retries": 2}));
    }
}
