//! Error types for the orchestration engine.
//!
//! Configuration problems (unregistered strategy types, duplicate
//! registrations, plans that cannot be facilitated) are fatal and end the
//! plan. Execution failures carry a [`FailureInfo`] so advisers can filter on
//! failure type. Resource contention is never represented here: a blocked
//! restraint or standing barrier is a normal wait state, not an error.

use thiserror::Error;

use crate::core::{FailureInfo, FailureType, NodeStatus};

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// The main error type for orchestration operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan or engine wiring is invalid. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A strategy type was registered twice under the same key.
    #[error("{kind} '{key}' is already registered")]
    DuplicateRegistration {
        /// The registry the key belongs to (step, facilitator, adviser, resolver).
        kind: &'static str,
        /// The duplicated key.
        key: String,
    },

    /// A strategy type was looked up but never registered.
    #[error("no {kind} registered for '{key}'")]
    NotRegistered {
        /// The registry the key belongs to.
        kind: &'static str,
        /// The missing key.
        key: String,
    },

    /// An optimistic-concurrency update lost the race.
    #[error("version conflict on {entity} '{id}': expected {expected}, found {found}")]
    VersionConflict {
        /// The record kind.
        entity: &'static str,
        /// The record id.
        id: String,
        /// The version the writer held.
        expected: u64,
        /// The version actually stored.
        found: u64,
    },

    /// A persisted record was not found.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// The record kind.
        entity: &'static str,
        /// The record id.
        id: String,
    },

    /// A status transition outside the legal transition table was attempted.
    #[error("illegal status transition for node '{node_execution_id}': {from} -> {to}")]
    IllegalTransition {
        /// The node whose status was being updated.
        node_execution_id: String,
        /// The stored status.
        from: NodeStatus,
        /// The rejected target status.
        to: NodeStatus,
    },

    /// A correlation id is already pending for a different node.
    #[error("correlation id '{correlation_id}' is already registered for node '{node_execution_id}'")]
    CorrelationConflict {
        /// The contested correlation id.
        correlation_id: String,
        /// The node holding the pending wait.
        node_execution_id: String,
    },

    /// A node execution failed with a typed failure.
    #[error("execution failed: {0}")]
    Execution(FailureInfo),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a duplicate-registration error.
    #[must_use]
    pub fn duplicate_registration(kind: &'static str, key: impl Into<String>) -> Self {
        Self::DuplicateRegistration {
            kind,
            key: key.into(),
        }
    }

    /// Creates an unregistered-lookup error.
    #[must_use]
    pub fn not_registered(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotRegistered {
            kind,
            key: key.into(),
        }
    }

    /// Creates a missing-record error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an execution error from a failure description.
    #[must_use]
    pub fn execution(info: FailureInfo) -> Self {
        Self::Execution(info)
    }

    /// True when the error is a configuration problem that must end the plan.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::DuplicateRegistration { .. }
                | Self::NotRegistered { .. }
        )
    }

    /// Converts the error into the failure description recorded on a node.
    ///
    /// Execution errors keep their typed failure; everything else becomes an
    /// `Unknown` failure carrying the error message.
    #[must_use]
    pub fn to_failure_info(&self) -> FailureInfo {
        match self {
            Self::Execution(info) => info.clone(),
            Self::Serialization(err) => {
                FailureInfo::new(err.to_string(), vec![FailureType::Application])
            }
            other => FailureInfo::new(other.to_string(), vec![FailureType::Unknown]),
        }
    }
}
