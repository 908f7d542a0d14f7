//! Persisted execution records: one per node attempt and one per plan run.

use crate::ambiance::Ambiance;
use crate::core::{FailureInfo, InterruptEffect, NodeStatus, PlanStatus};
use crate::errors::EngineResult;
use crate::facilitation::FacilitatorResponse;
use crate::plan::{Plan, PlanNode};
use crate::steps::AsyncWaitKind;
use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the executable phase of a node produced, when not a terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponseInfo {
    /// The node suspended under a wait correlation id.
    Async {
        /// The correlation id a notify must carry to resume the node.
        correlation_id: String,
        /// Whether the wait is for external work or a resource grant.
        wait_kind: AsyncWaitKind,
    },
    /// The node spawned a single child.
    Child {
        /// The child's node execution id.
        child_execution_id: String,
    },
    /// The node fanned out into parallel children.
    Children {
        /// The children's node execution ids.
        child_execution_ids: Vec<String>,
    },
}

/// The execution-time record for one level of the ambiance stack.
///
/// Created when a plan node is entered, mutated on every status transition
/// under an optimistic version check. A retry never reuses a record: it
/// creates a new one sharing `setup_id` with a fresh id and
/// `retry_index + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique id of this attempt; equals the runtime id of its level.
    pub id: String,
    /// The ambiance snapshot this node runs under.
    pub ambiance: Ambiance,
    /// The static plan node id.
    pub setup_id: String,
    /// Display name of the plan node.
    pub name: String,
    /// Current status.
    pub status: NodeStatus,
    /// The node execution that spawned this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The sibling that ran before this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    /// The sibling that ran after this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,
    /// When the record was created.
    pub created_at: Timestamp,
    /// When the node entered Running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the node reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// The facilitator response the node ran under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilitator_response: Option<FacilitatorResponse>,
    /// What the executable phase produced, when not terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_response: Option<ExecutableResponseInfo>,
    /// Failure details for broken statuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    /// The reason recorded when the node was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_info: Option<String>,
    /// External interrupts that landed on this node.
    #[serde(default)]
    pub interrupt_effects: Vec<InterruptEffect>,
    /// Zero-based retry attempt index.
    pub retry_index: u32,
    /// Node execution ids of prior attempts of the same plan node.
    #[serde(default)]
    pub retried_ids: Vec<String>,
    /// True once a later attempt superseded this record.
    #[serde(default)]
    pub old_retry: bool,
    /// Children still running, for CHILDREN aggregation.
    #[serde(default)]
    pub pending_children: u32,
    /// Worst terminal status seen among children so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_child_status: Option<NodeStatus>,
    /// Optimistic concurrency version, bumped by the store on update.
    pub version: u64,
}

impl NodeExecution {
    /// Creates a queued record for the deepest level of `ambiance`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the ambiance has no levels.
    pub fn new(
        ambiance: Ambiance,
        node: &PlanNode,
        parent_id: Option<String>,
    ) -> EngineResult<Self> {
        let level = ambiance.current_level()?.clone();
        Ok(Self {
            id: level.runtime_id,
            setup_id: level.setup_id,
            name: node.name.clone(),
            status: NodeStatus::Queued,
            parent_id,
            previous_id: None,
            next_id: None,
            created_at: now_utc(),
            started_at: None,
            ended_at: None,
            facilitator_response: None,
            executable_response: None,
            failure_info: None,
            skip_info: None,
            interrupt_effects: Vec::new(),
            retry_index: level.retry_index,
            retried_ids: Vec::new(),
            old_retry: false,
            pending_children: 0,
            worst_child_status: None,
            version: 0,
            ambiance,
        })
    }

    /// Returns the plan execution this node belongs to.
    #[must_use]
    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }

    /// Returns the human-readable identifier of the node's level.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.ambiance
            .levels
            .last()
            .map_or(self.setup_id.as_str(), |l| l.identifier.as_str())
    }
}

/// One record per started plan.
///
/// Status rolls up from node statuses: Running while work is active,
/// terminal when the engine applies EndPlan or the root node concludes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    /// Unique id of this run.
    pub id: String,
    /// The static plan being executed.
    pub plan: Plan,
    /// Scope-identifying key/value pairs for the run.
    pub setup_abstractions: HashMap<String, String>,
    /// Current rolled-up status.
    pub status: PlanStatus,
    /// When the run started.
    pub created_at: Timestamp,
    /// When the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Optimistic concurrency version, bumped by the store on update.
    pub version: u64,
}

impl PlanExecution {
    /// Creates a running record with a generated id.
    #[must_use]
    pub fn new(plan: Plan, setup_abstractions: HashMap<String, String>) -> Self {
        Self {
            id: generate_id(),
            plan,
            setup_abstractions,
            status: PlanStatus::Running,
            created_at: now_utc(),
            ended_at: None,
            version: 0,
        }
    }
}
