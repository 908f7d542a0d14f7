//! Typed failure descriptions attached to broken node executions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an execution failure.
///
/// Advisers filter on these types: a fail-path adviser configured for
/// `Connectivity` failures ignores an `Application` failure entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The step's own logic failed.
    Application,
    /// The step ran out of time.
    Timeout,
    /// A downstream system was unreachable.
    Connectivity,
    /// Credentials or permissions were rejected.
    Authorization,
    /// A post-execution verification failed.
    Verification,
    /// The failure could not be classified.
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Application => "application",
            Self::Timeout => "timeout",
            Self::Connectivity => "connectivity",
            Self::Authorization => "authorization",
            Self::Verification => "verification",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// The failure description recorded on a node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Human-readable failure message.
    pub message: String,
    /// The failure classifications that apply.
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    /// Creates a failure description.
    #[must_use]
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
        }
    }

    /// Creates an application failure.
    #[must_use]
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Application])
    }

    /// Creates a timeout failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Timeout])
    }

    /// Creates a connectivity failure.
    #[must_use]
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Connectivity])
    }

    /// True when the failure carries the given type.
    #[must_use]
    pub fn has_type(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }

    /// True when any of the given types applies to this failure.
    #[must_use]
    pub fn intersects(&self, types: &[FailureType]) -> bool {
        types.iter().any(|t| self.has_type(*t))
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failure_types.is_empty() {
            write!(f, "{}", self.message)
        } else {
            let types: Vec<String> = self.failure_types.iter().map(ToString::to_string).collect();
            write!(f, "{} [{}]", self.message, types.join(", "))
        }
    }
}
