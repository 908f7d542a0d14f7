//! Orchestration events and the sinks that receive them.
//!
//! The engine emits one event per observable transition: node status changes,
//! plan status changes, and interrupts taking effect. Sinks never fail the
//! transition that emitted the event.

use crate::core::{InterruptType, NodeStatus, PlanStatus};
use crate::utils::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, Level};

/// An observable engine transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A node execution changed status.
    NodeStatusUpdate {
        /// The owning plan execution.
        plan_execution_id: String,
        /// The node execution that transitioned.
        node_execution_id: String,
        /// The static plan node id.
        setup_id: String,
        /// The status before the transition.
        from_status: NodeStatus,
        /// The status after the transition.
        to_status: NodeStatus,
        /// When the transition was recorded.
        timestamp: Timestamp,
    },
    /// A plan execution changed status.
    PlanStatusUpdate {
        /// The plan execution that transitioned.
        plan_execution_id: String,
        /// The status after the transition.
        to_status: PlanStatus,
        /// When the transition was recorded.
        timestamp: Timestamp,
    },
    /// An external interrupt landed on a plan or node.
    InterruptTookEffect {
        /// The owning plan execution.
        plan_execution_id: String,
        /// The targeted node execution, if node-scoped.
        #[serde(skip_serializing_if = "Option::is_none")]
        node_execution_id: Option<String>,
        /// The interrupt that landed.
        interrupt_type: InterruptType,
        /// When the interrupt took effect.
        timestamp: Timestamp,
    },
}

impl OrchestrationEvent {
    /// Returns the event kind as a stable string.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeStatusUpdate { .. } => "node_status_update",
            Self::PlanStatusUpdate { .. } => "plan_status_update",
            Self::InterruptTookEffect { .. } => "interrupt_took_effect",
        }
    }

    /// Returns the plan execution id the event belongs to.
    #[must_use]
    pub fn plan_execution_id(&self) -> &str {
        match self {
            Self::NodeStatusUpdate {
                plan_execution_id, ..
            }
            | Self::PlanStatusUpdate {
                plan_execution_id, ..
            }
            | Self::InterruptTookEffect {
                plan_execution_id, ..
            } => plan_execution_id,
        }
    }
}

/// Trait for sinks that receive orchestration events.
///
/// Emission must never fail the transition that produced the event; sinks
/// log and suppress their own errors.
#[async_trait]
pub trait OrchestrationSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: OrchestrationEvent);
}

/// A no-op sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

#[async_trait]
impl OrchestrationSink for NoOpSink {
    async fn emit(&self, _event: OrchestrationEvent) {
        // Intentionally empty - discards all events
    }
}

/// A sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingSink {
    /// The log level to use.
    level: Level,
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingSink {
    /// Creates a new logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &OrchestrationEvent) {
        match self.level {
            Level::DEBUG => {
                debug!(
                    event_kind = %event.kind(),
                    plan_execution_id = %event.plan_execution_id(),
                    event = ?event,
                    "Event: {}", event.kind()
                );
            }
            _ => {
                info!(
                    event_kind = %event.kind(),
                    plan_execution_id = %event.plan_execution_id(),
                    event = ?event,
                    "Event: {}", event.kind()
                );
            }
        }
    }
}

#[async_trait]
impl OrchestrationSink for LoggingSink {
    async fn emit(&self, event: OrchestrationEvent) {
        self.log_event(&event);
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: parking_lot::RwLock<Vec<OrchestrationEvent>>,
}

impl CollectingSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of the given kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: &str) -> Vec<OrchestrationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrchestrationSink for CollectingSink {
    async fn emit(&self, event: OrchestrationEvent) {
        self.events.write().push(event);
    }
}
