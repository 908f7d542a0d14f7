//! Resolver for named node results.

use super::{consume_instance, resolve_instance, Resolver};
use crate::ambiance::Ambiance;
use crate::core::{RefInstance, RefObject, RefType};
use crate::errors::EngineResult;
use crate::store::ExecutionStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Resolves [`RefType::Outcome`] references.
///
/// Outcomes support producer-qualified lookup (`"<producer>.<name>"` or an
/// explicit producer setup id) in addition to scope-path resolution, and are
/// queryable by producer for the graph projection.
pub struct OutcomeResolver {
    store: Arc<dyn ExecutionStore>,
}

impl OutcomeResolver {
    /// Creates an outcome resolver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Returns every outcome produced by a node execution.
    pub async fn produced_by(
        &self,
        plan_execution_id: &str,
        producer_runtime_id: &str,
    ) -> EngineResult<Vec<RefInstance>> {
        let instances = self.store.fetch_ref_instances(plan_execution_id).await?;
        Ok(instances
            .into_iter()
            .filter(|i| {
                i.ref_type == RefType::Outcome && i.producer_runtime_id == producer_runtime_id
            })
            .collect())
    }
}

#[async_trait]
impl Resolver for OutcomeResolver {
    fn ref_type(&self) -> RefType {
        RefType::Outcome
    }

    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> EngineResult<Value> {
        resolve_instance(&self.store, ambiance, RefType::Outcome, ref_object, true).await
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
            RefType::Outcome,
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
    use crate::errors::EngineError;
    use crate::plan::PlanNode;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn level(setup_id: &str, category: StepCategory) -> Level {
        Level::from_plan_node(&PlanNode::new(setup_id, setup_id, "noop").with_category(category))
    }

    fn root() -> Ambiance {
        Ambiance::new(
            "pe-1",
            "plan",
            HashMap::new(),
            level("pipeline", StepCategory::Pipeline),
        )
    }

    #[tokio::test]
    async fn test_producer_qualified_resolution() {
        let resolver = OutcomeResolver::new(Arc::new(InMemoryStore::new()));
        let root = root();

        let producer = root.clone_for_child(level("fetch", StepCategory::Step));
        resolver
            .consume(&producer, "artifact", json!({"tag": "v2"}), 1)
            .await
            .unwrap();

        let consumer = root.clone_for_child(level("deploy", StepCategory::Step));
        let resolved = resolver
            .resolve(&consumer, &RefObject::outcome("fetch.artifact"))
            .await
            .unwrap();
        assert_eq!(resolved, json!({"tag": "v2"}));

        let explicit = resolver
            .resolve(
                &consumer,
                &RefObject::outcome("artifact").produced_by("fetch"),
            )
            .await
            .unwrap();
        assert_eq!(explicit, json!({"tag": "v2"}));
    }

    #[tokio::test]
    async fn test_outcomes_are_immutable_per_scope() {
        let resolver = OutcomeResolver::new(Arc::new(InMemoryStore::new()));
        let producer = root().clone_for_child(level("fetch", StepCategory::Step));

        resolver
            .consume(&producer, "artifact", json!(1), 1)
            .await
            .unwrap();
        let err = resolver
            .consume(&producer, "artifact", json!(2), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[tokio::test]
    async fn test_produced_by_query() {
        let resolver = OutcomeResolver::new(Arc::new(InMemoryStore::new()));
        let root = root();
        let producer = root.clone_for_child(level("fetch", StepCategory::Step));
        let producer_runtime_id = producer.current_runtime_id().unwrap().to_string();

        resolver
            .consume(&producer, "artifact", json!(1), 1)
            .await
            .unwrap();
        resolver
            .consume(&producer, "digest", json!("abc"), 1)
            .await
            .unwrap();

        let produced = resolver.produced_by("pe-1", &producer_runtime_id).await.unwrap();
        assert_eq!(produced.len(), 2);
        assert!(produced.iter().all(|i| i.producer_setup_id == "fetch"));
    }
}
