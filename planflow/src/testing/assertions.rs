//! Test assertions over step responses and node executions.

use crate::core::{FailureType, NodeStatus};
use crate::engine::NodeExecution;
use crate::steps::{StepResponse, StepResult};

/// Asserts that the response concluded with [`NodeStatus::Succeeded`].
pub fn assert_response_succeeded(response: &StepResponse) {
    match response {
        StepResponse::Terminal(StepResult { status, .. }) if *status == NodeStatus::Succeeded => {
        }
        other => panic!("Expected a succeeded response, got {other:?}"),
    }
}

/// Asserts that the response concluded with [`NodeStatus::Failed`].
pub fn assert_response_failed(response: &StepResponse) {
    match response {
        StepResponse::Terminal(StepResult { status, .. }) if *status == NodeStatus::Failed => {}
        other => panic!("Expected a failed response, got {other:?}"),
    }
}

/// Asserts that the response suspended under the expected correlation id.
pub fn assert_response_suspended(response: &StepResponse, correlation_id: &str) {
    match response {
        StepResponse::Async {
            correlation_id: actual,
            ..
        } => assert_eq!(
            actual, correlation_id,
            "Expected suspension under '{correlation_id}', got '{actual}'"
        ),
        other => panic!("Expected a suspension, got {other:?}"),
    }
}

/// Asserts that the response spawns exactly the expected single child.
pub fn assert_response_child(response: &StepResponse, child_setup_id: &str) {
    match response {
        StepResponse::Child {
            child_setup_id: actual,
        } => assert_eq!(
            actual, child_setup_id,
            "Expected child '{child_setup_id}', got '{actual}'"
        ),
        other => panic!("Expected a single-child response, got {other:?}"),
    }
}

/// Asserts that the response fans out into the expected children, in order.
pub fn assert_response_children(response: &StepResponse, child_setup_ids: &[&str]) {
    match response {
        StepResponse::Children {
            child_setup_ids: actual,
        } => assert_eq!(
            actual, child_setup_ids,
            "Expected children {child_setup_ids:?}, got {actual:?}"
        ),
        other => panic!("Expected a parallel-children response, got {other:?}"),
    }
}

/// Asserts that the node execution holds the expected status.
pub fn assert_node_status(node: &NodeExecution, expected: NodeStatus) {
    assert_eq!(
        node.status, expected,
        "Expected node '{}' in status {expected}, got {}",
        node.setup_id, node.status
    );
}

/// Asserts that the node execution has concluded: terminal status with an
/// end timestamp.
pub fn assert_node_concluded(node: &NodeExecution) {
    assert!(
        node.status.is_terminal(),
        "Expected node '{}' to be terminal, got {}",
        node.setup_id,
        node.status
    );
    assert!(
        node.ended_at.is_some(),
        "Expected node '{}' to carry an end timestamp",
        node.setup_id
    );
}

/// Asserts that the node execution carries a failure of the given type.
pub fn assert_node_failed_with(node: &NodeExecution, failure_type: FailureType) {
    match &node.failure_info {
        Some(info) => assert!(
            info.has_type(failure_type),
            "Expected failure type {failure_type} on node '{}', got {:?}",
            node.setup_id,
            info.failure_types
        ),
        None => panic!(
            "Expected node '{}' to carry failure info, but it has none",
            node.setup_id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use crate::core::FailureInfo;
    use crate::plan::PlanNode;
    use crate::utils::now_utc;
    use std::collections::HashMap;

    fn node_in(status: NodeStatus) -> NodeExecution {
        let plan_node = PlanNode::new("build", "Build", "shell");
        let ambiance = Ambiance::new(
            "pe-1",
            "deploy",
            HashMap::new(),
            Level::from_plan_node(&plan_node),
        );
        let mut node = NodeExecution::new(ambiance, &plan_node, None).unwrap();
        node.status = status;
        node
    }

    #[test]
    fn test_assert_response_succeeded() {
        assert_response_succeeded(&StepResponse::succeeded());
    }

    #[test]
    #[should_panic(expected = "Expected a succeeded response")]
    fn test_assert_response_succeeded_rejects_failure() {
        assert_response_succeeded(&StepResponse::failed(FailureInfo::application("boom")));
    }

    #[test]
    fn test_assert_response_failed() {
        assert_response_failed(&StepResponse::failed(FailureInfo::application("boom")));
    }

    #[test]
    fn test_assert_response_suspended() {
        assert_response_suspended(&StepResponse::suspend("cb-1"), "cb-1");
    }

    #[test]
    #[should_panic(expected = "Expected a suspension")]
    fn test_assert_response_suspended_rejects_terminal() {
        assert_response_suspended(&StepResponse::succeeded(), "cb-1");
    }

    #[test]
    fn test_assert_response_child() {
        assert_response_child(&StepResponse::child("unit"), "unit");
    }

    #[test]
    fn test_assert_response_children() {
        let response =
            StepResponse::children(vec!["unit".to_string(), "lint".to_string()]);
        assert_response_children(&response, &["unit", "lint"]);
    }

    #[test]
    fn test_assert_node_status() {
        assert_node_status(&node_in(NodeStatus::Running), NodeStatus::Running);
    }

    #[test]
    fn test_assert_node_concluded() {
        let mut node = node_in(NodeStatus::Succeeded);
        node.ended_at = Some(now_utc());
        assert_node_concluded(&node);
    }

    #[test]
    #[should_panic(expected = "to be terminal")]
    fn test_assert_node_concluded_rejects_active_nodes() {
        assert_node_concluded(&node_in(NodeStatus::Running));
    }

    #[test]
    fn test_assert_node_failed_with() {
        let mut node = node_in(NodeStatus::Failed);
        node.failure_info = Some(FailureInfo::connectivity("socket reset"));
        assert_node_failed_with(&node, FailureType::Connectivity);
    }

    #[test]
    #[should_panic(expected = "carry failure info")]
    fn test_assert_node_failed_with_requires_failure_info() {
        assert_node_failed_with(&node_in(NodeStatus::Failed), FailureType::Timeout);
    }
}
