//! A single frame of the ambiance stack.

use crate::plan::PlanNode;
use crate::utils::{epoch_millis, generate_id};
use serde::{Deserialize, Serialize};

/// The structural category of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    /// The root of a plan.
    Pipeline,
    /// A grouping node that runs its members as children.
    Stage,
    /// A leaf unit of work.
    Step,
    /// A node that fans out into parallel children.
    Fork,
}

impl std::fmt::Display for StepCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pipeline => "pipeline",
            Self::Stage => "stage",
            Self::Step => "step",
            Self::Fork => "fork",
        };
        write!(f, "{s}")
    }
}

/// One frame of the ambiance stack: the identity of a node at a nesting depth.
///
/// `setup_id` names the static plan node; `runtime_id` names this specific
/// runtime instance. Retries of the same plan node produce distinct runtime
/// ids sharing one setup id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// The static plan node id.
    pub setup_id: String,
    /// The runtime instance id, unique per attempt.
    pub runtime_id: String,
    /// Human-readable identifier of the node.
    pub identifier: String,
    /// Optional grouping label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// The step type the node dispatches to.
    pub step_type: String,
    /// The structural category of the node.
    pub step_category: StepCategory,
    /// Zero-based retry attempt index.
    pub retry_index: u32,
    /// Epoch milliseconds when this level was entered.
    pub start_ts: i64,
}

impl Level {
    /// Creates a level for a plan node with a freshly generated runtime id.
    #[must_use]
    pub fn from_plan_node(node: &PlanNode) -> Self {
        Self {
            setup_id: node.setup_id.clone(),
            runtime_id: generate_id(),
            identifier: node.identifier.clone(),
            group: node.group.clone(),
            step_type: node.step_type.clone(),
            step_category: node.step_category,
            retry_index: 0,
            start_ts: epoch_millis(),
        }
    }

    /// Sets the retry attempt index.
    #[must_use]
    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanNode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_level_from_plan_node() {
        let node = PlanNode::new("build", "Build", "shell")
            .with_category(StepCategory::Step)
            .with_group("ci");
        let level = Level::from_plan_node(&node);

        assert_eq!(level.setup_id, "build");
        assert_eq!(level.identifier, "build");
        assert_eq!(level.step_type, "shell");
        assert_eq!(level.group, Some("ci".to_string()));
        assert_eq!(level.retry_index, 0);
        assert!(!level.runtime_id.is_empty());
        assert!(level.start_ts > 0);
    }

    #[test]
    fn test_level_runtime_ids_are_unique_per_attempt() {
        let node = PlanNode::new("build", "Build", "shell");
        let first = Level::from_plan_node(&node);
        let second = Level::from_plan_node(&node).with_retry_index(1);

        assert_eq!(first.setup_id, second.setup_id);
        assert_ne!(first.runtime_id, second.runtime_id);
        assert_eq!(second.retry_index, 1);
    }

    #[test]
    fn test_step_category_serialization() {
        let json = serde_json::to_string(&StepCategory::Pipeline).unwrap();
        assert_eq!(json, "\"pipeline\"");
        let back: StepCategory = serde_json::from_str("\"fork\"").unwrap();
        assert_eq!(back, StepCategory::Fork);
    }

    #[test]
    fn test_step_category_display() {
        assert_eq!(StepCategory::Stage.to_string(), "stage");
    }
}
