//! The step contract: what the engine dispatches a node's work to.
//!
//! A [`Step`] is looked up by the node's `step_type` and handed a
//! [`StepContext`] carrying the ambiance, the resolved inputs and the
//! facilitation pass-through, plus the wait registrar and resolver access.
//! It answers with a [`StepResponse`]: a terminal result, a suspension under
//! a correlation id, or the children the node fans out into. Suspended steps
//! are re-entered through [`Step::handle_resume`] with the notify payload.

mod builtin;
mod context;
mod registry;

pub use builtin::{BarrierStep, ForkStep, NoOpStep, RestraintStep, SectionStep};
pub use context::{StepContext, StepServices};
pub use registry::StepRegistry;

use crate::core::{FailureInfo, NodeStatus};
use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a suspended node is waiting for.
///
/// The kind decides the waiting status the node parks in: external work
/// parks in [`NodeStatus::AsyncWaiting`], a restraint grant parks in
/// [`NodeStatus::ResourceWaiting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncWaitKind {
    /// An out-of-process notify will resume the node.
    External,
    /// A restraint promotion will resume the node.
    ResourceGrant,
}

impl AsyncWaitKind {
    /// Returns the waiting status a node with this wait kind parks in.
    #[must_use]
    pub fn waiting_status(self) -> NodeStatus {
        match self {
            Self::External => NodeStatus::AsyncWaiting,
            Self::ResourceGrant => NodeStatus::ResourceWaiting,
        }
    }
}

/// The terminal outcome of a step's work.
///
/// The status must be terminal; the engine records a non-terminal status as
/// a system error on the node rather than parking it in an undefined state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The terminal status to record on the node.
    pub status: NodeStatus,
    /// Failure details when the status is broken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

impl StepResult {
    /// Creates a result with the given terminal status.
    #[must_use]
    pub fn new(status: NodeStatus) -> Self {
        Self {
            status,
            failure_info: None,
        }
    }

    /// A successful result.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::new(NodeStatus::Succeeded)
    }

    /// A failed result carrying the failure description.
    #[must_use]
    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: NodeStatus::Failed,
            failure_info: Some(failure_info),
        }
    }

    /// An errored result carrying the failure description.
    #[must_use]
    pub fn errored(failure_info: FailureInfo) -> Self {
        Self {
            status: NodeStatus::Errored,
            failure_info: Some(failure_info),
        }
    }
}

/// What a step's execution phase produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    /// The step finished inline with a terminal result.
    Terminal(StepResult),
    /// The step suspended under an already registered correlation id.
    Async {
        /// The correlation id a notify must carry to resume the node.
        correlation_id: String,
        /// What the node is waiting for.
        wait_kind: AsyncWaitKind,
    },
    /// The node spawns one child plan node and waits for it.
    Child {
        /// The setup id of the plan node to run as the child.
        child_setup_id: String,
    },
    /// The node fans out into parallel children and waits for all of them.
    Children {
        /// The setup ids of the plan nodes to run in parallel.
        child_setup_ids: Vec<String>,
    },
}

impl StepResponse {
    /// A successful terminal response.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::Terminal(StepResult::succeeded())
    }

    /// A failed terminal response.
    #[must_use]
    pub fn failed(failure_info: FailureInfo) -> Self {
        Self::Terminal(StepResult::failed(failure_info))
    }

    /// A suspension awaiting an external notify.
    #[must_use]
    pub fn suspend(correlation_id: impl Into<String>) -> Self {
        Self::Async {
            correlation_id: correlation_id.into(),
            wait_kind: AsyncWaitKind::External,
        }
    }

    /// A suspension awaiting a restraint promotion.
    #[must_use]
    pub fn resource_wait(correlation_id: impl Into<String>) -> Self {
        Self::Async {
            correlation_id: correlation_id.into(),
            wait_kind: AsyncWaitKind::ResourceGrant,
        }
    }

    /// A single-child response.
    #[must_use]
    pub fn child(child_setup_id: impl Into<String>) -> Self {
        Self::Child {
            child_setup_id: child_setup_id.into(),
        }
    }

    /// A parallel-children response.
    #[must_use]
    pub fn children(child_setup_ids: Vec<String>) -> Self {
        Self::Children { child_setup_ids }
    }
}

/// A unit of node work, registered under a step type.
///
/// Implementations must register every wait correlation id through the
/// context before issuing the external call that could answer it; the
/// engine refuses to park a node under an unregistered id.
#[async_trait]
pub trait Step: Send + Sync {
    /// The step type this implementation registers under.
    fn step_type(&self) -> &str;

    /// Runs the node's work.
    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse>;

    /// Interprets the notify payload that resumed a suspended node.
    ///
    /// The default rejects the payload: a step that never suspends has
    /// nothing to resume, and an uninterpretable payload must fail the node
    /// rather than be dropped.
    async fn handle_resume(
        &self,
        _ctx: &StepContext,
        payload: Value,
    ) -> EngineResult<StepResponse> {
        Err(EngineError::execution(FailureInfo::application(format!(
            "step '{}' cannot interpret resume payload: {payload}",
            self.step_type()
        ))))
    }
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("step_type", &self.step_type())
            .finish_non_exhaustive()
    }
}

/// A step built from a synchronous closure, for tests and simple inline work.
pub struct FnStep<F>
where
    F: Fn(&StepContext) -> EngineResult<StepResult> + Send + Sync,
{
    step_type: String,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(&StepContext) -> EngineResult<StepResult> + Send + Sync,
{
    /// Creates a step that runs the closure inline.
    #[must_use]
    pub fn new(step_type: impl Into<String>, func: F) -> Self {
        Self {
            step_type: step_type.into(),
            func,
        }
    }
}

impl<F> std::fmt::Debug for FnStep<F>
where
    F: Fn(&StepContext) -> EngineResult<StepResult> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep")
            .field("step_type", &self.step_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&StepContext) -> EngineResult<StepResult> + Send + Sync,
{
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        Ok(StepResponse::Terminal((self.func)(ctx)?))
    }
}
