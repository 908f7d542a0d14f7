//! Deadline tracking independent of execution threads.
//!
//! A [`TimeoutTracker`] never owns a timer: its state is computed on read by
//! comparing `expires_at` against the caller's clock, so trackers survive
//! persistence and restarts without rescheduling. A single engine task
//! periodically calls [`TimeoutEngine::sweep`] and applies the configured
//! action to each expired entry.

use crate::core::InterventionAction;
use crate::utils::Timestamp;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// What a timeout guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutDimension {
    /// The absolute execution deadline of a node.
    Absolute,
    /// The waiting window of a manual intervention.
    Intervention,
}

impl std::fmt::Display for TimeoutDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absolute => "absolute",
            Self::Intervention => "intervention",
        };
        write!(f, "{s}")
    }
}

/// The observable state of a tracker at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutState {
    /// The deadline is in the future.
    Ticking,
    /// The deadline has passed.
    Expired,
}

/// A deadline with on-read state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutTracker {
    /// What this deadline guards.
    pub dimension: TimeoutDimension,
    /// When the deadline passes.
    pub expires_at: Timestamp,
}

impl TimeoutTracker {
    /// Creates a tracker for the given deadline.
    #[must_use]
    pub fn new(dimension: TimeoutDimension, expires_at: Timestamp) -> Self {
        Self {
            dimension,
            expires_at,
        }
    }

    /// Returns the state at `now`.
    #[must_use]
    pub fn state(&self, now: Timestamp) -> TimeoutState {
        if now > self.expires_at {
            TimeoutState::Expired
        } else {
            TimeoutState::Ticking
        }
    }

    /// Returns true when the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.state(now) == TimeoutState::Expired
    }
}

/// What the engine does when a tracker expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Discontinue the node and mark it Expired.
    ExpireNode,
    /// Resolve a pending manual intervention with the given action.
    Intervention(InterventionAction),
}

/// An expired entry returned by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredTimeout {
    /// The registration id.
    pub tracker_id: String,
    /// The node execution the deadline guarded.
    pub node_execution_id: String,
    /// The tracker that expired.
    pub tracker: TimeoutTracker,
    /// The action to apply.
    pub action: TimeoutAction,
}

#[derive(Debug, Clone)]
struct TrackedTimeout {
    node_execution_id: String,
    tracker: TimeoutTracker,
    action: TimeoutAction,
}

/// Registry of live trackers, swept by a single engine task.
#[derive(Debug, Default)]
pub struct TimeoutEngine {
    entries: DashMap<String, TrackedTimeout>,
}

impl TimeoutEngine {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tracker for a node execution and returns its id.
    pub fn register(
        &self,
        node_execution_id: impl Into<String>,
        tracker: TimeoutTracker,
        action: TimeoutAction,
    ) -> String {
        let tracker_id = crate::utils::generate_id();
        self.entries.insert(
            tracker_id.clone(),
            TrackedTimeout {
                node_execution_id: node_execution_id.into(),
                tracker,
                action,
            },
        );
        tracker_id
    }

    /// Removes every tracker guarding a node execution.
    pub fn cancel_for_node(&self, node_execution_id: &str) {
        self.entries
            .retain(|_, t| t.node_execution_id != node_execution_id);
    }

    /// Returns the live trackers guarding a node execution.
    #[must_use]
    pub fn trackers_for_node(&self, node_execution_id: &str) -> Vec<TimeoutTracker> {
        self.entries
            .iter()
            .filter(|e| e.node_execution_id == node_execution_id)
            .map(|e| e.tracker)
            .collect()
    }

    /// Removes and returns every entry expired at `now`.
    pub fn sweep(&self, now: Timestamp) -> Vec<ExpiredTimeout> {
        let expired_ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.tracker.is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|tracker_id| {
                self.entries.remove(&tracker_id).map(|(_, t)| ExpiredTimeout {
                    tracker_id,
                    node_execution_id: t.node_execution_id,
                    tracker: t.tracker,
                    action: t.action,
                })
            })
            .collect()
    }

    /// Returns the number of live trackers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no trackers are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
