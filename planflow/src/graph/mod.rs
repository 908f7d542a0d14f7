//! Read-side projection of a plan execution as a node arena.
//!
//! [`GraphService::generate`] folds the persisted node executions of one plan
//! run into an [`ExecutionGraph`]: a flat map keyed by node-execution id in
//! which parent/child/sibling relations are id references only. Retried
//! attempts stay in the arena with `old_retry` set so a consumer can render
//! either the live chain or the full attempt history. Outcome names published
//! by each node are attached from the stored reference instances.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::ambiance::StepCategory;
use crate::core::{FailureInfo, NodeStatus, PlanStatus, RefType};
use crate::engine::NodeExecution;
use crate::errors::EngineResult;
use crate::store::ExecutionStore;
use crate::utils::Timestamp;

/// One projected node. Every relation field holds node-execution ids into
/// the owning [`ExecutionGraph::nodes`] arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// The node execution id, also the arena key.
    pub node_execution_id: String,
    /// The static plan node id.
    pub setup_id: String,
    /// Human-readable identifier.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// The step type the node dispatched to.
    pub step_type: String,
    /// The structural category of the node.
    pub step_category: StepCategory,
    /// Current status.
    pub status: NodeStatus,
    /// When execution began, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the node concluded, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Failure details for broken conclusions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    /// Why the node was skipped, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_info: Option<String>,
    /// Zero-based retry attempt index.
    pub retry_index: u32,
    /// True for attempts superseded by a retry.
    pub old_retry: bool,
    /// The spawning parent, absent for root-chain nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The sibling that ran before this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    /// The sibling that ran after this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,
    /// Direct children in creation order.
    pub child_ids: Vec<String>,
    /// Names of the outcomes this node published.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub outcome_names: Vec<String>,
}

impl GraphNode {
    fn from_execution(
        record: &NodeExecution,
        child_ids: Vec<String>,
        outcome_names: Vec<String>,
    ) -> Self {
        let level = record.ambiance.levels.last();
        Self {
            node_execution_id: record.id.clone(),
            setup_id: record.setup_id.clone(),
            identifier: record.identifier().to_string(),
            name: record.name.clone(),
            step_type: level.map_or_else(String::new, |l| l.step_type.clone()),
            step_category: level.map_or(StepCategory::Step, |l| l.step_category),
            status: record.status,
            started_at: record.started_at,
            ended_at: record.ended_at,
            failure_info: record.failure_info.clone(),
            skip_info: record.skip_info.clone(),
            retry_index: record.retry_index,
            old_retry: record.old_retry,
            parent_id: record.parent_id.clone(),
            previous_id: record.previous_id.clone(),
            next_id: record.next_id.clone(),
            child_ids,
            outcome_names,
        }
    }
}

/// The projected graph of one plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    /// The plan execution the graph describes.
    pub plan_execution_id: String,
    /// The static plan id.
    pub plan_id: String,
    /// Plan status at projection time.
    pub status: PlanStatus,
    /// The live root node, absent before the first node is persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_node_id: Option<String>,
    /// Arena of every node execution, retried attempts included.
    pub nodes: HashMap<String, GraphNode>,
}

impl ExecutionGraph {
    /// Looks up a node by execution id.
    #[must_use]
    pub fn node(&self, node_execution_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_execution_id)
    }

    /// Returns the direct children of a node in creation order.
    #[must_use]
    pub fn children_of(&self, node_execution_id: &str) -> Vec<&GraphNode> {
        self.nodes
            .get(node_execution_id)
            .map(|node| {
                node.child_ids
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Walks the `next_id` links starting from a node, inclusive.
    #[must_use]
    pub fn chain_from(&self, node_execution_id: &str) -> Vec<&GraphNode> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(node_execution_id);
        while let Some(node) = cursor {
            chain.push(node);
            cursor = node.next_id.as_deref().and_then(|id| self.nodes.get(id));
        }
        chain
    }
}

/// Builds [`ExecutionGraph`] projections from stored execution state.
pub struct GraphService {
    store: Arc<dyn ExecutionStore>,
}

impl GraphService {
    /// Creates a service over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Projects the current state of a plan execution.
    ///
    /// The root is the live node with neither parent nor predecessor; a
    /// retried root keeps that slot because the superseded attempt carries
    /// `old_retry`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::EngineError::NotFound`] when the plan
    /// execution does not exist.
    pub async fn generate(&self, plan_execution_id: &str) -> EngineResult<ExecutionGraph> {
        let plan = self.store.fetch_plan_execution(plan_execution_id).await?;
        let records = self.store.fetch_nodes_for_plan(plan_execution_id).await?;
        let refs = self.store.fetch_ref_instances(plan_execution_id).await?;

        let mut outcome_names: HashMap<String, Vec<String>> = HashMap::new();
        for instance in refs {
            if instance.ref_type == RefType::Outcome {
                outcome_names
                    .entry(instance.producer_runtime_id)
                    .or_default()
                    .push(instance.name);
            }
        }

        let mut child_ids: HashMap<String, Vec<String>> = HashMap::new();
        let mut root_node_id = None;
        for record in &records {
            if let Some(parent) = &record.parent_id {
                child_ids.entry(parent.clone()).or_default().push(record.id.clone());
            }
            if record.parent_id.is_none() && record.previous_id.is_none() && !record.old_retry {
                root_node_id = Some(record.id.clone());
            }
        }

        let mut nodes = HashMap::with_capacity(records.len());
        for record in &records {
            let node = GraphNode::from_execution(
                record,
                child_ids.remove(&record.id).unwrap_or_default(),
                outcome_names.remove(&record.id).unwrap_or_default(),
            );
            nodes.insert(record.id.clone(), node);
        }

        Ok(ExecutionGraph {
            plan_execution_id: plan.id,
            plan_id: plan.plan.plan_id,
            status: plan.status,
            root_node_id,
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use crate::core::RefInstance;
    use crate::engine::PlanExecution;
    use crate::plan::{Plan, PlanNode};
    use crate::store::InMemoryStore;
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn plan() -> Plan {
        Plan::builder("deploy")
            .node(PlanNode::new("a", "Build", "shell"))
            .node(PlanNode::new("b", "Push", "shell"))
            .starting_node("a")
            .build()
            .unwrap()
    }

    async fn seeded_store() -> (Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::new());
        let execution = PlanExecution::new(plan(), HashMap::new());
        let plan_execution_id = execution.id.clone();
        store.save_plan_execution(execution).await.unwrap();
        (store, plan_execution_id)
    }

    fn root_node(plan_execution_id: &str, plan_node: &PlanNode) -> NodeExecution {
        let ambiance = Ambiance::new(
            plan_execution_id,
            "deploy",
            HashMap::new(),
            Level::from_plan_node(plan_node),
        );
        NodeExecution::new(ambiance, plan_node, None).unwrap()
    }

    #[tokio::test]
    async fn test_generate_links_siblings_and_finds_the_root() {
        let (store, plan_execution_id) = seeded_store().await;
        let source = plan();
        let mut first = root_node(&plan_execution_id, source.node("a").unwrap());
        let second_level = Level::from_plan_node(source.node("b").unwrap());
        let second_ambiance = first.ambiance.clone_for_sibling(second_level).unwrap();
        let mut second =
            NodeExecution::new(second_ambiance, source.node("b").unwrap(), None).unwrap();
        first.next_id = Some(second.id.clone());
        second.previous_id = Some(first.id.clone());
        store.insert_node_execution(first.clone()).await.unwrap();
        store.insert_node_execution(second.clone()).await.unwrap();

        let graph = GraphService::new(store)
            .generate(&plan_execution_id)
            .await
            .unwrap();

        assert_eq!(graph.plan_id, "deploy");
        assert_eq!(graph.root_node_id, Some(first.id.clone()));
        assert_eq!(graph.nodes.len(), 2);
        let chain = graph.chain_from(&first.id);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].setup_id, "a");
        assert_eq!(chain[1].setup_id, "b");
        assert_eq!(chain[1].previous_id, Some(first.id.clone()));
    }

    #[tokio::test]
    async fn test_generate_collects_children_in_creation_order() {
        let (store, plan_execution_id) = seeded_store().await;
        let source = plan();
        let parent = root_node(&plan_execution_id, source.node("a").unwrap());
        store.insert_node_execution(parent.clone()).await.unwrap();

        let mut child_ids = Vec::new();
        for setup in ["b", "a"] {
            let plan_node = source.node(setup).unwrap();
            let ambiance = parent
                .ambiance
                .clone_for_child(Level::from_plan_node(plan_node));
            let child =
                NodeExecution::new(ambiance, plan_node, Some(parent.id.clone())).unwrap();
            child_ids.push(child.id.clone());
            store.insert_node_execution(child).await.unwrap();
        }

        let graph = GraphService::new(store)
            .generate(&plan_execution_id)
            .await
            .unwrap();

        let projected = graph.node(&parent.id).unwrap();
        assert_eq!(projected.child_ids, child_ids);
        let children = graph.children_of(&parent.id);
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].setup_id, "b");
        assert!(children.iter().all(|c| c.parent_id == Some(parent.id.clone())));
    }

    #[tokio::test]
    async fn test_generate_keeps_retried_attempts_but_roots_the_live_one() {
        let (store, plan_execution_id) = seeded_store().await;
        let source = plan();
        let plan_node = source.node("a").unwrap();
        let mut first = root_node(&plan_execution_id, plan_node);
        first.old_retry = true;
        store.insert_node_execution(first.clone()).await.unwrap();

        let retry_level = Level::from_plan_node(plan_node).with_retry_index(1);
        let retry_ambiance = first.ambiance.clone_for_sibling(retry_level).unwrap();
        let mut retry = NodeExecution::new(retry_ambiance, plan_node, None).unwrap();
        retry.retried_ids = vec![first.id.clone()];
        store.insert_node_execution(retry.clone()).await.unwrap();

        let graph = GraphService::new(store)
            .generate(&plan_execution_id)
            .await
            .unwrap();

        assert_eq!(graph.root_node_id, Some(retry.id.clone()));
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.node(&first.id).unwrap().old_retry);
        assert_eq!(graph.node(&retry.id).unwrap().retry_index, 1);
    }

    #[tokio::test]
    async fn test_generate_attaches_published_outcome_names() {
        let (store, plan_execution_id) = seeded_store().await;
        let source = plan();
        let node = root_node(&plan_execution_id, source.node("a").unwrap());
        store.insert_node_execution(node.clone()).await.unwrap();
        store
            .save_ref_instance(RefInstance {
                id: "ref-1".to_string(),
                plan_execution_id: plan_execution_id.clone(),
                ref_type: RefType::Outcome,
                name: "image_digest".to_string(),
                value: json!("sha256:abc"),
                producer_runtime_id: node.id.clone(),
                producer_setup_id: "a".to_string(),
                scope_path: node.id.clone(),
                levels_kept: 1,
                created_at: now_utc(),
            })
            .await
            .unwrap();

        let graph = GraphService::new(store)
            .generate(&plan_execution_id)
            .await
            .unwrap();

        assert_eq!(
            graph.node(&node.id).unwrap().outcome_names,
            vec!["image_digest".to_string()]
        );
    }

    #[tokio::test]
    async fn test_generate_unknown_plan_execution_is_not_found() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryStore::new());
        let result = GraphService::new(store).generate("missing").await;
        assert!(matches!(
            result,
            Err(crate::errors::EngineError::NotFound { .. })
        ));
    }
}
