//! Static plan definitions: an arena of nodes plus barrier setups.
//!
//! A [`Plan`] is the immutable description the engine executes. Nodes are
//! stored in an arena keyed by `setup_id`; parent/child and next/previous
//! relations are expressed as id references only, so a plan is acyclic by
//! construction and trivially serializable.

use crate::advising::AdviserObtainment;
use crate::ambiance::StepCategory;
use crate::errors::{EngineError, EngineResult};
use crate::facilitation::FacilitatorObtainment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A single static node of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique id of this node within the plan.
    pub setup_id: String,
    /// Human-readable identifier, defaults to the setup id.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// The step type the node dispatches to.
    pub step_type: String,
    /// The structural category of the node.
    #[serde(default = "default_category")]
    pub step_category: StepCategory,
    /// Optional grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Parameters handed to facilitators and the step.
    #[serde(default)]
    pub step_parameters: Value,
    /// Facilitators attached to this node, in invocation order.
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
    /// Advisers attached to this node, in precedence order.
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    /// Absolute execution timeout for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// When true, a failed child does not abort its running siblings; the
    /// parent waits for all children and reports the worst status.
    #[serde(default)]
    pub continue_on_children_failure: bool,
}

fn default_category() -> StepCategory {
    StepCategory::Step
}

impl PlanNode {
    /// Creates a plan node with the given setup id, display name and step
    /// type. The identifier defaults to the setup id.
    #[must_use]
    pub fn new(
        setup_id: impl Into<String>,
        name: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        let setup_id = setup_id.into();
        Self {
            identifier: setup_id.clone(),
            setup_id,
            name: name.into(),
            step_type: step_type.into(),
            step_category: StepCategory::Step,
            group: None,
            step_parameters: Value::Null,
            facilitator_obtainments: Vec::new(),
            adviser_obtainments: Vec::new(),
            timeout: None,
            continue_on_children_failure: false,
        }
    }

    /// Sets the identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Sets the structural category.
    #[must_use]
    pub fn with_category(mut self, category: StepCategory) -> Self {
        self.step_category = category;
        self
    }

    /// Sets the grouping label.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the step parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    /// Appends a facilitator obtainment.
    #[must_use]
    pub fn with_facilitator(mut self, obtainment: FacilitatorObtainment) -> Self {
        self.facilitator_obtainments.push(obtainment);
        self
    }

    /// Appends an adviser obtainment.
    #[must_use]
    pub fn with_adviser(mut self, obtainment: AdviserObtainment) -> Self {
        self.adviser_obtainments.push(obtainment);
        self
    }

    /// Sets the absolute execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keeps siblings running when one child of a CHILDREN node breaks.
    #[must_use]
    pub fn with_continue_on_children_failure(mut self, continue_on: bool) -> Self {
        self.continue_on_children_failure = continue_on;
        self
    }
}

/// A position a node occupies at a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierPositionSetup {
    /// The stage the participating node belongs to.
    pub stage_setup_id: String,
    /// The participating node itself.
    pub step_setup_id: String,
}

/// A rendezvous barrier definition.
///
/// `positions` fixes the participant count at setup time; the engine never
/// infers liveness. Participants that will never arrive must be excluded
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSetup {
    /// Unique barrier identifier within the plan.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// The participating positions.
    pub positions: Vec<BarrierPositionSetup>,
}

impl BarrierSetup {
    /// Creates a barrier setup with no positions.
    #[must_use]
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            positions: Vec::new(),
        }
    }

    /// Appends a participating position.
    #[must_use]
    pub fn with_position(
        mut self,
        stage_setup_id: impl Into<String>,
        step_setup_id: impl Into<String>,
    ) -> Self {
        self.positions.push(BarrierPositionSetup {
            stage_setup_id: stage_setup_id.into(),
            step_setup_id: step_setup_id.into(),
        });
        self
    }
}

/// An immutable, validated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The plan id.
    pub plan_id: String,
    /// The node arena, keyed by setup id.
    pub nodes: HashMap<String, PlanNode>,
    /// The setup id of the first node to execute.
    pub starting_node_id: String,
    /// Barrier definitions.
    #[serde(default)]
    pub barriers: Vec<BarrierSetup>,
}

impl Plan {
    /// Starts building a plan.
    #[must_use]
    pub fn builder(plan_id: impl Into<String>) -> PlanBuilder {
        PlanBuilder::new(plan_id)
    }

    /// Looks up a node by setup id.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no node has the given setup id.
    pub fn node(&self, setup_id: &str) -> EngineResult<&PlanNode> {
        self.nodes
            .get(setup_id)
            .ok_or_else(|| EngineError::not_found("plan node", setup_id))
    }
}

/// Builder for creating validated plans.
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    plan_id: String,
    nodes: Vec<PlanNode>,
    starting_node_id: Option<String>,
    barriers: Vec<BarrierSetup>,
}

impl PlanBuilder {
    /// Creates a new plan builder.
    #[must_use]
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            nodes: Vec::new(),
            starting_node_id: None,
            barriers: Vec::new(),
        }
    }

    /// Adds a node to the plan.
    #[must_use]
    pub fn node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Sets the starting node.
    #[must_use]
    pub fn starting_node(mut self, setup_id: impl Into<String>) -> Self {
        self.starting_node_id = Some(setup_id.into());
        self
    }

    /// Adds a barrier definition.
    #[must_use]
    pub fn barrier(mut self, barrier: BarrierSetup) -> Self {
        self.barriers.push(barrier);
        self
    }

    /// Validates and builds the plan.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on duplicate node ids, a missing or
    /// unknown starting node, or a barrier position that references an
    /// unknown node.
    pub fn build(self) -> EngineResult<Plan> {
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.setup_id) {
                return Err(EngineError::configuration(format!(
                    "duplicate plan node '{}'",
                    node.setup_id
                )));
            }
            nodes.insert(node.setup_id.clone(), node);
        }

        let starting_node_id = self.starting_node_id.ok_or_else(|| {
            EngineError::configuration("plan has no starting node")
        })?;
        if !nodes.contains_key(&starting_node_id) {
            return Err(EngineError::configuration(format!(
                "starting node '{starting_node_id}' is not part of the plan"
            )));
        }

        for barrier in &self.barriers {
            if barrier.positions.is_empty() {
                return Err(EngineError::configuration(format!(
                    "barrier '{}' has no positions",
                    barrier.identifier
                )));
            }
            for position in &barrier.positions {
                if !nodes.contains_key(&position.step_setup_id) {
                    return Err(EngineError::configuration(format!(
                        "barrier '{}' references unknown node '{}'",
                        barrier.identifier, position.step_setup_id
                    )));
                }
            }
        }

        Ok(Plan {
            plan_id: self.plan_id,
            nodes,
            starting_node_id,
            barriers: self.barriers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder_happy_path() {
        let plan = Plan::builder("deploy")
            .node(PlanNode::new("fetch", "Fetch artifact", "http"))
            .node(PlanNode::new("deploy", "Deploy", "shell"))
            .starting_node("fetch")
            .build()
            .unwrap();

        assert_eq!(plan.plan_id, "deploy");
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.starting_node_id, "fetch");
        assert_eq!(plan.node("deploy").unwrap().step_type, "shell");
    }

    #[test]
    fn test_builder_rejects_duplicate_nodes() {
        let result = Plan::builder("p")
            .node(PlanNode::new("a", "A", "noop"))
            .node(PlanNode::new("a", "A again", "noop"))
            .starting_node("a")
            .build();

        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_builder_requires_starting_node() {
        let missing = Plan::builder("p")
            .node(PlanNode::new("a", "A", "noop"))
            .build();
        assert!(missing.is_err());

        let unknown = Plan::builder("p")
            .node(PlanNode::new("a", "A", "noop"))
            .starting_node("b")
            .build();
        assert!(unknown.is_err());
    }

    #[test]
    fn test_builder_validates_barrier_positions() {
        let result = Plan::builder("p")
            .node(PlanNode::new("a", "A", "noop"))
            .starting_node("a")
            .barrier(BarrierSetup::new("sync", "Sync point").with_position("stage", "missing"))
            .build();

        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_node_lookup_error() {
        let plan = Plan::builder("p")
            .node(PlanNode::new("a", "A", "noop"))
            .starting_node("a")
            .build()
            .unwrap();

        assert!(matches!(plan.node("nope"), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_plan_node_builder_chain() {
        let node = PlanNode::new("limit", "Limit", "resource_restraint")
            .with_identifier("limit-db")
            .with_group("db")
            .with_parameters(serde_json::json!({"resource_unit": "db"}))
            .with_timeout(Duration::from_secs(30))
            .with_continue_on_children_failure(true);

        assert_eq!(node.identifier, "limit-db");
        assert_eq!(node.group, Some("db".to_string()));
        assert_eq!(node.timeout, Some(Duration::from_secs(30)));
        assert!(node.continue_on_children_failure);
    }

    #[test]
    fn test_plan_serialization_round_trip() {
        let plan = Plan::builder("p")
            .node(PlanNode::new("a", "A", "noop"))
            .starting_node("a")
            .barrier(BarrierSetup::new("sync", "Sync").with_position("stage", "a"))
            .build()
            .unwrap();

        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
    }
}
