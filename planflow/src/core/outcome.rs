//! Reference objects and the persisted instances they resolve to.
//!
//! A node publishes a named, immutable value (an outcome or a sweeping
//! output); later nodes consume it through a symbolic [`RefObject`] without
//! knowing which runtime instance produced it. Visibility is governed by the
//! producer's scope path: the runtime-id path of the ambiance levels it chose
//! to keep.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::utils::Timestamp;

/// The kind of reference a resolver handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    /// A named result produced by a node for its consumers.
    Outcome,
    /// Cross-node scratch data published into an enclosing scope.
    SweepingOutput,
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Outcome => "outcome",
            Self::SweepingOutput => "sweeping_output",
        };
        write!(f, "{s}")
    }
}

/// A symbolic reference to a published value.
///
/// The name may carry a producer prefix in dotted form
/// (`"<producer_setup_id>.<name>"`), or the producer may be named explicitly
/// in `producer_setup_id`; the explicit field wins when both are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefObject {
    /// Which resolver handles this reference.
    pub ref_type: RefType,
    /// The published name, optionally dotted with a producer setup id.
    pub name: String,
    /// Explicit producer setup id, when the reference is direct.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_setup_id: Option<String>,
}

impl RefObject {
    /// Creates an outcome reference.
    #[must_use]
    pub fn outcome(name: impl Into<String>) -> Self {
        Self {
            ref_type: RefType::Outcome,
            name: name.into(),
            producer_setup_id: None,
        }
    }

    /// Creates a sweeping-output reference.
    #[must_use]
    pub fn sweeping_output(name: impl Into<String>) -> Self {
        Self {
            ref_type: RefType::SweepingOutput,
            name: name.into(),
            producer_setup_id: None,
        }
    }

    /// Pins the reference to an explicit producer setup id.
    #[must_use]
    pub fn produced_by(mut self, setup_id: impl Into<String>) -> Self {
        self.producer_setup_id = Some(setup_id.into());
        self
    }

    /// Splits the reference into (producer setup id, plain name).
    ///
    /// A dotted name like `"deploy.service_ip"` yields
    /// `(Some("deploy"), "service_ip")`.
    #[must_use]
    pub fn producer_and_name(&self) -> (Option<&str>, &str) {
        if let Some(producer) = self.producer_setup_id.as_deref() {
            return (Some(producer), self.name.as_str());
        }
        match self.name.split_once('.') {
            Some((producer, rest)) if !producer.is_empty() && !rest.is_empty() => {
                (Some(producer), rest)
            }
            _ => (None, self.name.as_str()),
        }
    }
}

/// A persisted published value: one outcome or sweeping output instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefInstance {
    /// Unique instance id; returned by `consume` as the reference id.
    pub id: String,
    /// The plan execution the value belongs to.
    pub plan_execution_id: String,
    /// Which resolver owns the instance.
    pub ref_type: RefType,
    /// The published name (plain, never dotted).
    pub name: String,
    /// The published document.
    pub value: Value,
    /// Runtime id of the node execution that produced it.
    pub producer_runtime_id: String,
    /// Setup id of the plan node that produced it.
    pub producer_setup_id: String,
    /// Runtime-id path prefix the value is visible under.
    pub scope_path: String,
    /// How many ambiance levels the producer kept for visibility.
    pub levels_kept: usize,
    /// When the value was published.
    pub created_at: Timestamp,
}
