//! Advising: post-completion strategies that choose the next transition.
//!
//! When a node reaches a terminal status, the engine builds an
//! [`AdviseEvent`] per configured [`AdviserObtainment`] and tries them in
//! precedence order. The first adviser whose `can_advise` returns true wins;
//! the losers are never executed, even when the winner produces no advise.
//! No applicable adviser is not an error: the engine falls back to plain
//! status propagation.

mod builtin;
mod registry;

pub use builtin::{
    ManualInterventionAdviser, OnAbortAdviser, OnFailAdviser, OnSuccessAdviser, PostRetryAction,
    RetryAdviser,
};
pub use registry::AdviserRegistry;

use crate::ambiance::Ambiance;
use crate::core::{FailureInfo, InterventionAction, NodeStatus};
use crate::errors::EngineResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// What an adviser saw: one terminal transition of one node, paired with the
/// parameters of the obtainment being consulted.
#[derive(Debug, Clone)]
pub struct AdviseEvent {
    /// The ambiance of the concluded node.
    pub ambiance: Ambiance,
    /// The status the node left.
    pub from_status: NodeStatus,
    /// The terminal status the node reached.
    pub to_status: NodeStatus,
    /// Failure details for broken statuses.
    pub failure_info: Option<FailureInfo>,
    /// How many retries the node has already consumed.
    pub retry_count: u32,
    /// The parameters of the obtainment being consulted.
    pub parameters: Value,
}

impl AdviseEvent {
    /// Creates an event for a transition.
    #[must_use]
    pub fn new(ambiance: Ambiance, from_status: NodeStatus, to_status: NodeStatus) -> Self {
        Self {
            ambiance,
            from_status,
            to_status,
            failure_info: None,
            retry_count: 0,
            parameters: Value::Null,
        }
    }

    /// Sets the failure details.
    #[must_use]
    pub fn with_failure_info(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }

    /// Sets the consumed retry count.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the obtainment parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// What the engine does after a node concludes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advise {
    /// Start the named plan node as the next sibling.
    NextStep {
        /// The setup id of the node to start.
        next_node_id: String,
    },
    /// Re-run the concluded plan node after a wait.
    Retry {
        /// Delay before the new attempt starts.
        wait: Duration,
    },
    /// End the whole plan with the concluded node's status.
    EndPlan,
    /// Park the node awaiting a human decision, under a deadline.
    InterventionWait {
        /// How long to wait for the decision.
        timeout: Duration,
        /// What to apply when the deadline passes.
        on_timeout: InterventionAction,
    },
}

/// Attaches an adviser to a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    /// The registered adviser type to consult.
    pub adviser_type: String,
    /// Parameters for this node.
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    /// Creates an obtainment with null parameters.
    #[must_use]
    pub fn new(adviser_type: impl Into<String>) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters: Value::Null,
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Chooses the next transition after a node concludes.
pub trait Adviser: Send + Sync {
    /// The type this adviser registers under.
    fn adviser_type(&self) -> &str;

    /// Returns true when this adviser applies to the event. Applicability
    /// consumes the event's precedence slot even when `on_advise_event`
    /// later produces no advise.
    fn can_advise(&self, event: &AdviseEvent) -> bool;

    /// Produces the advise for an applicable event, or `None` to fall back
    /// to plain status propagation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable parameters.
    fn on_advise_event(&self, event: &AdviseEvent) -> EngineResult<Option<Advise>>;
}
