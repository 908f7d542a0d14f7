//! Test fixtures for step and plan testing.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::advising::AdviserObtainment;
use crate::ambiance::{Ambiance, Level};
use crate::errors::EngineResult;
use crate::facilitation::ExecutionMode;
use crate::plan::{Plan, PlanNode};
use crate::steps::{StepContext, StepServices};
use crate::store::{ExecutionStore, InMemoryStore};

/// A bed for exercising [`crate::steps::Step`] implementations in isolation.
///
/// Owns one store and the full service set over it; every context built from
/// the same bed shares them, so an outcome published in one phase is
/// resolvable in the next.
pub struct StepTestBed {
    store: Arc<dyn ExecutionStore>,
    services: StepServices,
    inputs: Value,
    mode: ExecutionMode,
    pass_through: Option<Value>,
    abstractions: HashMap<String, String>,
}

impl StepTestBed {
    /// Creates a bed over a fresh in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::over_store(Arc::new(InMemoryStore::new()))
    }

    /// Creates a bed over an existing store.
    #[must_use]
    pub fn over_store(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            services: StepServices::over_store(store.clone()),
            store,
            inputs: Value::Null,
            mode: ExecutionMode::Sync,
            pass_through: None,
            abstractions: HashMap::new(),
        }
    }

    /// Sets the resolved inputs every built context carries.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the execution mode every built context carries.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the facilitation pass-through every built context carries.
    #[must_use]
    pub fn with_pass_through(mut self, pass_through: Value) -> Self {
        self.pass_through = Some(pass_through);
        self
    }

    /// Adds a scope abstraction (account/org/project id).
    #[must_use]
    pub fn with_abstraction(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.abstractions.insert(key.into(), value.into());
        self
    }

    /// The store behind the bed's services.
    #[must_use]
    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        self.store.clone()
    }

    /// The service set shared by built contexts.
    #[must_use]
    pub fn services(&self) -> &StepServices {
        &self.services
    }

    /// Builds a context for one node phase.
    ///
    /// Each call roots a fresh ambiance, so repeated calls model distinct
    /// node executions against the shared store.
    #[must_use]
    pub fn context(&self, setup_id: &str, step_type: &str) -> StepContext {
        let node = PlanNode::new(setup_id, setup_id, step_type);
        let ambiance = Ambiance::new(
            "pe-test",
            "plan-test",
            self.abstractions.clone(),
            Level::from_plan_node(&node),
        );
        StepContext::new(ambiance, self.inputs.clone(), self.mode, self.services.clone())
            .with_pass_through(self.pass_through.clone())
    }
}

impl Default for StepTestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// A linear plan builder for tests.
///
/// Consecutive steps are chained with `on_success` advisers, matching the
/// wiring a hand-built sequential plan would carry.
pub struct TestPlan {
    plan_id: String,
    steps: Vec<(String, String)>,
}

impl TestPlan {
    /// Creates an empty test plan.
    #[must_use]
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step to the chain.
    #[must_use]
    pub fn with_step(mut self, setup_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        self.steps.push((setup_id.into(), step_type.into()));
        self
    }

    /// Creates a chain of `count` numbered steps sharing one step type.
    #[must_use]
    pub fn linear(plan_id: impl Into<String>, step_type: impl Into<String>, count: usize) -> Self {
        let step_type = step_type.into();
        let mut plan = Self::new(plan_id);
        for i in 0..count {
            plan.steps.push((format!("step_{i}"), step_type.clone()));
        }
        plan
    }

    /// Returns the setup ids in chain order.
    #[must_use]
    pub fn setup_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Builds the plan.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty chain or duplicate setup
    /// ids, as [`crate::plan::PlanBuilder`] would.
    pub fn build(self) -> EngineResult<Plan> {
        let mut builder = Plan::builder(self.plan_id);
        for (index, (setup_id, step_type)) in self.steps.iter().enumerate() {
            let mut node = PlanNode::new(setup_id, setup_id, step_type);
            if let Some((next, _)) = self.steps.get(index + 1) {
                node = node.with_adviser(
                    AdviserObtainment::new("on_success")
                        .with_parameters(json!({ "next_node_id": next })),
                );
            }
            builder = builder.node(node);
        }
        if let Some((first, _)) = self.steps.first() {
            builder = builder.starting_node(first);
        }
        builder.build()
    }
}
