//! Node and plan status enums with the legal transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a single node execution.
///
/// A node moves from `Queued` through `Running` into either a terminal
/// status or one of the waiting statuses. Waiting nodes hold no task; they
/// are resumed exclusively by an external signal (notify, child conclusion,
/// restraint promotion, interrupt, timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created and waiting to be picked up by the dispatcher.
    Queued,
    /// A worker task is executing the node.
    Running,
    /// Suspended until an external notify arrives for its correlation id.
    AsyncWaiting,
    /// Suspended until a resource restraint promotes its instance.
    ResourceWaiting,
    /// Suspended until its single child reaches a terminal status.
    ChildWaiting,
    /// Suspended until all spawned children reach terminal statuses.
    ChildrenWaiting,
    /// Suspended until a human (or a timeout) resolves a failure.
    InterventionWaiting,
    /// Externally paused before execution started.
    Paused,
    /// An abort or expiry is landing; the next transition is terminal.
    Discontinuing,
    /// Completed successfully.
    Succeeded,
    /// Completed with an application failure.
    Failed,
    /// Completed with a system error.
    Errored,
    /// Terminated by an abort interrupt.
    Aborted,
    /// Terminated because a timeout expired.
    Expired,
    /// Bypassed without executing.
    Skipped,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AsyncWaiting => "async_waiting",
            Self::ResourceWaiting => "resource_waiting",
            Self::ChildWaiting => "child_waiting",
            Self::ChildrenWaiting => "children_waiting",
            Self::InterventionWaiting => "intervention_waiting",
            Self::Paused => "paused",
            Self::Discontinuing => "discontinuing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl NodeStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::Errored
                | Self::Aborted
                | Self::Expired
                | Self::Skipped
        )
    }

    /// Returns true for terminal statuses that count as success.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Returns true for the broken statuses fail-path advisers react to.
    ///
    /// `Aborted` is intentionally excluded: aborts have their own adviser
    /// path and are never retried.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Failed | Self::Errored | Self::Expired)
    }

    /// Returns true for suspended statuses that hold no running task.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::AsyncWaiting
                | Self::ResourceWaiting
                | Self::ChildWaiting
                | Self::ChildrenWaiting
                | Self::InterventionWaiting
                | Self::Paused
        )
    }

    /// Returns the statuses a transition into `self` may legally start from.
    #[must_use]
    pub fn allowed_start_set(&self) -> &'static [Self] {
        match self {
            Self::Queued => &[Self::Paused],
            Self::Running => &[Self::Queued, Self::AsyncWaiting, Self::ResourceWaiting],
            Self::AsyncWaiting | Self::ResourceWaiting | Self::ChildWaiting | Self::ChildrenWaiting => {
                &[Self::Running]
            }
            Self::InterventionWaiting => &[Self::Failed, Self::Errored, Self::Expired],
            Self::Paused => &[Self::Queued],
            Self::Discontinuing => &[
                Self::Queued,
                Self::Running,
                Self::AsyncWaiting,
                Self::ResourceWaiting,
                Self::ChildWaiting,
                Self::ChildrenWaiting,
                Self::InterventionWaiting,
                Self::Paused,
            ],
            Self::Succeeded => &[
                Self::Running,
                Self::ChildWaiting,
                Self::ChildrenWaiting,
                Self::InterventionWaiting,
            ],
            Self::Failed => &[
                Self::Queued,
                Self::Running,
                Self::ChildWaiting,
                Self::ChildrenWaiting,
                Self::InterventionWaiting,
            ],
            Self::Errored => &[
                Self::Queued,
                Self::Running,
                Self::ChildWaiting,
                Self::ChildrenWaiting,
            ],
            Self::Aborted | Self::Expired => &[Self::Discontinuing],
            Self::Skipped => &[Self::Queued, Self::Running],
        }
    }

    /// Returns true when moving from `self` to `to` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        to.allowed_start_set().contains(self)
    }

    /// Severity rank used when aggregating sibling statuses; higher is worse.
    pub(crate) fn severity(self) -> u8 {
        match self {
            Self::Errored => 6,
            Self::Aborted => 5,
            Self::Expired => 4,
            Self::Failed => 3,
            Self::Succeeded => 1,
            _ => 0,
        }
    }

    /// Returns the worse of two statuses for aggregation purposes.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// The rolled-up status of an entire plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// At least one node is active or able to become active.
    Running,
    /// Externally paused; queued nodes will not start.
    Paused,
    /// The plan completed successfully.
    Succeeded,
    /// The plan completed with an application failure.
    Failed,
    /// The plan completed with a system error.
    Errored,
    /// The plan was aborted.
    Aborted,
    /// The plan timed out.
    Expired,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl PlanStatus {
    /// Returns true if the plan status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::Paused)
    }

    /// Rolls a terminal node status up into the plan status it implies.
    #[must_use]
    pub fn from_node_status(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Succeeded | NodeStatus::Skipped => Self::Succeeded,
            NodeStatus::Failed => Self::Failed,
            NodeStatus::Errored => Self::Errored,
            NodeStatus::Aborted => Self::Aborted,
            NodeStatus::Expired => Self::Expired,
            _ => Self::Running,
        }
    }
}
