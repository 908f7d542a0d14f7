//! Facilitation: pre-execution strategies that choose how a node runs.
//!
//! Before a node executes, the engine asks its facilitators for an
//! [`ExecutionMode`]. Facilitators attach to plan nodes via
//! [`FacilitatorObtainment`]s and are invoked in configured order; the first
//! `Some` response wins. A node with no obtainments runs with the default
//! sync response. Obtainments that all decline are a fatal configuration
//! error, never retried.
//!
//! Facilitators must be pure with respect to engine state: facilitating
//! twice with identical inputs yields the same mode.

mod builtin;
mod registry;

pub use builtin::{
    AsyncFacilitator, ChildFacilitator, ChildrenFacilitator, SkipFacilitator, SyncFacilitator,
};
pub use registry::FacilitatorRegistry;

use crate::ambiance::Ambiance;
use crate::errors::EngineResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// How a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The step runs inline and returns a terminal result in the same call.
    Sync,
    /// The step registers a correlation id and the node suspends.
    Async,
    /// The node spawns exactly one child and waits for it.
    Child,
    /// The node fans out into parallel children and waits for all of them.
    Children,
    /// The node is bypassed and recorded as skipped.
    Skip,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Child => "child",
            Self::Children => "children",
            Self::Skip => "skip",
        };
        write!(f, "{s}")
    }
}

/// A facilitator's decision for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    /// Delay before the node starts executing.
    #[serde(default)]
    pub initial_wait: Duration,
    /// The chosen execution mode.
    pub mode: ExecutionMode,
    /// Facilitation-time data handed to the step, never recomputed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_through: Option<Value>,
}

impl FacilitatorResponse {
    /// Creates a response with the given mode and no wait.
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            initial_wait: Duration::ZERO,
            mode,
            pass_through: None,
        }
    }

    /// A sync response.
    #[must_use]
    pub fn sync() -> Self {
        Self::new(ExecutionMode::Sync)
    }

    /// An async response.
    #[must_use]
    pub fn asynchronous() -> Self {
        Self::new(ExecutionMode::Async)
    }

    /// A child response.
    #[must_use]
    pub fn child() -> Self {
        Self::new(ExecutionMode::Child)
    }

    /// A children response.
    #[must_use]
    pub fn children() -> Self {
        Self::new(ExecutionMode::Children)
    }

    /// A skip response.
    #[must_use]
    pub fn skip() -> Self {
        Self::new(ExecutionMode::Skip)
    }

    /// Sets the delay before execution starts.
    #[must_use]
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Sets the facilitation-time pass-through data.
    #[must_use]
    pub fn with_pass_through(mut self, pass_through: Value) -> Self {
        self.pass_through = Some(pass_through);
        self
    }
}

/// Attaches a facilitator to a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    /// The registered facilitator type to invoke.
    pub facilitator_type: String,
    /// Parameters for this node.
    #[serde(default)]
    pub parameters: Value,
}

impl FacilitatorObtainment {
    /// Creates an obtainment with null parameters.
    #[must_use]
    pub fn new(facilitator_type: impl Into<String>) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
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

/// Chooses how a node runs.
pub trait Facilitator: Send + Sync {
    /// The type this facilitator registers under.
    fn facilitator_type(&self) -> &str;

    /// Returns the response for a node, or `None` to decline and let the
    /// next configured facilitator decide.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable parameters.
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
        node_inputs: &Value,
    ) -> EngineResult<Option<FacilitatorResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_response_builders() {
        let response = FacilitatorResponse::asynchronous()
            .with_initial_wait(Duration::from_millis(250))
            .with_pass_through(serde_json::json!({"token": "t"}));

        assert_eq!(response.mode, ExecutionMode::Async);
        assert_eq!(response.initial_wait, Duration::from_millis(250));
        assert_eq!(response.pass_through, Some(serde_json::json!({"token": "t"})));
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Children).unwrap(),
            "\"children\""
        );
        let back: ExecutionMode = serde_json::from_str("\"skip\"").unwrap();
        assert_eq!(back, ExecutionMode::Skip);
    }

    #[test]
    fn test_response_serialization_round_trip() {
        let response = FacilitatorResponse::sync().with_initial_wait(Duration::from_secs(1));
        let json = serde_json::to_string(&response).unwrap();
        let back: FacilitatorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }
}
