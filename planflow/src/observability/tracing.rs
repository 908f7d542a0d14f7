//! Tracing integration for the orchestration engine.
//!
//! Provides the global subscriber initializer plus span-attribute builders
//! that flatten plan and node identity into the dotted keys OpenTelemetry
//! exporters expect.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::ambiance::Ambiance;
use crate::engine::NodeExecution;

/// Installs a global `tracing` subscriber for engine logs.
///
/// Honors `RUST_LOG` when set, defaulting to `planflow=info,warn`. Panics if
/// a subscriber is already installed; embedders that may have set one up
/// should call [`try_init_tracing`] instead.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_target(false)
        .init();
}

/// Installs the global subscriber unless one is already set.
///
/// Returns true when this call installed it.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_target(false)
        .try_init()
        .is_ok()
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("planflow=info,warn"))
}

/// Span attributes for a plan execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSpanAttributes {
    /// The static plan id.
    pub plan_id: Option<String>,
    /// The plan execution id.
    pub plan_execution_id: Option<String>,
    /// Plan status.
    pub status: Option<String>,
    /// Scope-identifying key/value pairs (account/org/project ids).
    pub setup_abstractions: HashMap<String, String>,
}

impl PlanSpanAttributes {
    /// Creates empty plan span attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills plan identity and scope keys from an ambiance.
    #[must_use]
    pub fn from_ambiance(ambiance: &Ambiance) -> Self {
        Self {
            plan_id: Some(ambiance.plan_id.clone()),
            plan_execution_id: Some(ambiance.plan_execution_id.clone()),
            status: None,
            setup_abstractions: ambiance.setup_abstractions.clone(),
        }
    }

    /// Sets the plan id.
    #[must_use]
    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    /// Sets the plan execution id.
    #[must_use]
    pub fn with_plan_execution_id(mut self, id: impl Into<String>) -> Self {
        self.plan_execution_id = Some(id.into());
        self
    }

    /// Sets the plan status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Flattens to dotted OpenTelemetry attribute keys.
    ///
    /// Setup abstractions land under `plan.scope.<key>`.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();

        if let Some(ref v) = self.plan_id {
            attrs.insert("plan.id".to_string(), v.clone());
        }
        if let Some(ref v) = self.plan_execution_id {
            attrs.insert("plan.execution_id".to_string(), v.clone());
        }
        if let Some(ref v) = self.status {
            attrs.insert("plan.status".to_string(), v.clone());
        }
        for (key, value) in &self.setup_abstractions {
            attrs.insert(format!("plan.scope.{key}"), value.clone());
        }

        attrs
    }
}

/// Span attributes for a node execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpanAttributes {
    /// The static plan node id.
    pub setup_id: String,
    /// The node execution id.
    pub node_execution_id: Option<String>,
    /// The step type the node dispatched to.
    pub step_type: Option<String>,
    /// Node status.
    pub status: Option<String>,
    /// Zero-based retry attempt index.
    pub retry_index: Option<u32>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Failure message for broken conclusions.
    pub error: Option<String>,
}

impl NodeSpanAttributes {
    /// Creates node span attributes for a setup id.
    #[must_use]
    pub fn new(setup_id: impl Into<String>) -> Self {
        Self {
            setup_id: setup_id.into(),
            ..Default::default()
        }
    }

    /// Fills attributes from a node execution record.
    ///
    /// Duration is computed from the recorded start/end timestamps when both
    /// are present.
    #[must_use]
    pub fn from_node(node: &NodeExecution) -> Self {
        let duration_ms = match (node.started_at, node.ended_at) {
            (Some(start), Some(end)) => {
                let millis = (end - start).num_milliseconds();
                u32::try_from(millis).ok().map(f64::from)
            }
            _ => None,
        };
        Self {
            setup_id: node.setup_id.clone(),
            node_execution_id: Some(node.id.clone()),
            step_type: node
                .ambiance
                .levels
                .last()
                .map(|level| level.step_type.clone()),
            status: Some(node.status.to_string()),
            retry_index: Some(node.retry_index),
            duration_ms,
            error: node.failure_info.as_ref().map(|f| f.message.clone()),
        }
    }

    /// Sets the node status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the failure message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Flattens to dotted OpenTelemetry attribute keys.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();

        attrs.insert("node.setup_id".to_string(), self.setup_id.clone());

        if let Some(ref v) = self.node_execution_id {
            attrs.insert("node.execution_id".to_string(), v.clone());
        }
        if let Some(ref v) = self.step_type {
            attrs.insert("node.step_type".to_string(), v.clone());
        }
        if let Some(ref v) = self.status {
            attrs.insert("node.status".to_string(), v.clone());
        }
        if let Some(v) = self.retry_index {
            attrs.insert("node.retry_index".to_string(), v.to_string());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("node.duration_ms".to_string(), v.to_string());
        }
        if let Some(ref v) = self.error {
            attrs.insert("node.error".to_string(), v.clone());
        }

        attrs
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
