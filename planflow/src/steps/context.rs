//! The execution context handed to a step for one phase.

use crate::ambiance::Ambiance;
use crate::core::RefType;
use crate::errors::EngineResult;
use crate::facilitation::ExecutionMode;
use crate::resolvers::ResolverRegistry;
use crate::restraint::{BarrierService, RestraintService};
use crate::store::ExecutionStore;
use crate::waiter::WaitNotifyEngine;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// The engine services a step may reach during a phase.
///
/// Built once per engine and cloned into every context; all members share
/// the same store.
#[derive(Clone)]
pub struct StepServices {
    /// The wait registrar and notify correlator.
    pub waiter: WaitNotifyEngine,
    /// The reference resolvers.
    pub resolvers: Arc<ResolverRegistry>,
    /// FIFO admission control.
    pub restraints: Arc<RestraintService>,
    /// Rendezvous barriers.
    pub barriers: Arc<BarrierService>,
}

impl StepServices {
    /// Builds the full service set over one store.
    #[must_use]
    pub fn over_store(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            waiter: WaitNotifyEngine::new(store.clone()),
            resolvers: Arc::new(ResolverRegistry::with_builtins(store.clone())),
            restraints: Arc::new(RestraintService::new(store.clone())),
            barriers: Arc::new(BarrierService::new(store)),
        }
    }
}

/// Everything a step sees while executing or resuming one node phase.
///
/// The inputs are the node's step parameters with every reference already
/// resolved; the pass-through is whatever the winning facilitator cached at
/// facilitation time, never recomputed. Waits registered here belong to the
/// node and are cleaned up when it concludes.
pub struct StepContext {
    ambiance: Ambiance,
    inputs: Value,
    pass_through: Option<Value>,
    mode: ExecutionMode,
    services: StepServices,
    queued_notifies: Mutex<Vec<(String, Value)>>,
}

impl StepContext {
    /// Creates a context for one node phase.
    #[must_use]
    pub fn new(
        ambiance: Ambiance,
        inputs: Value,
        mode: ExecutionMode,
        services: StepServices,
    ) -> Self {
        Self {
            ambiance,
            inputs,
            pass_through: None,
            mode,
            services,
            queued_notifies: Mutex::new(Vec::new()),
        }
    }

    /// Attaches the facilitation pass-through.
    #[must_use]
    pub fn with_pass_through(mut self, pass_through: Option<Value>) -> Self {
        self.pass_through = pass_through;
        self
    }

    /// The ambiance of the executing node.
    #[must_use]
    pub fn ambiance(&self) -> &Ambiance {
        &self.ambiance
    }

    /// The node's step parameters with references resolved.
    #[must_use]
    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// The facilitation-time cache, if the winning facilitator set one.
    #[must_use]
    pub fn pass_through(&self) -> Option<&Value> {
        self.pass_through.as_ref()
    }

    /// The execution mode the node was facilitated into.
    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The node execution id of the executing node.
    pub fn node_execution_id(&self) -> EngineResult<&str> {
        self.ambiance.current_runtime_id()
    }

    /// Registers a wait for this node under `correlation_id`.
    ///
    /// Must be called before the external call that could answer the wait
    /// is issued; a notify racing an unregistered wait is dropped.
    pub async fn register_wait(&self, correlation_id: &str) -> EngineResult<()> {
        self.services
            .waiter
            .register_wait(
                correlation_id,
                self.ambiance.current_runtime_id()?,
                &self.ambiance.plan_execution_id,
            )
            .await
    }

    /// Publishes a named outcome visible under the full producer path.
    pub async fn publish_outcome(&self, name: &str, value: Value) -> EngineResult<String> {
        let resolver = self.services.resolvers.obtain(RefType::Outcome)?;
        resolver.consume(&self.ambiance, name, value, 0).await
    }

    /// Publishes sweeping output visible to the first `levels_to_keep`
    /// ambiance levels (`0` keeps the full producer path).
    pub async fn publish_sweeping_output(
        &self,
        name: &str,
        value: Value,
        levels_to_keep: usize,
    ) -> EngineResult<String> {
        let resolver = self.services.resolvers.obtain(RefType::SweepingOutput)?;
        resolver
            .consume(&self.ambiance, name, value, levels_to_keep)
            .await
    }

    /// The reference resolvers.
    #[must_use]
    pub fn resolvers(&self) -> &Arc<ResolverRegistry> {
        &self.services.resolvers
    }

    /// FIFO admission control for shared resources.
    #[must_use]
    pub fn restraints(&self) -> &Arc<RestraintService> {
        &self.services.restraints
    }

    /// Rendezvous barriers.
    #[must_use]
    pub fn barriers(&self) -> &Arc<BarrierService> {
        &self.services.barriers
    }

    /// Queues a notify for another node's wait.
    ///
    /// Delivery happens after the current phase returns, through the same
    /// deduplicating path as an external notify; a step never schedules
    /// resumption itself.
    pub fn enqueue_notify(&self, correlation_id: impl Into<String>, payload: Value) {
        self.queued_notifies
            .lock()
            .push((correlation_id.into(), payload));
    }

    /// Drains the notifies queued during this phase.
    #[must_use]
    pub fn take_notifies(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.queued_notifies.lock())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use crate::ambiance::Level;
        use crate::plan::PlanNode;
        use crate::store::InMemoryStore;
        use std::collections::HashMap;

        let node = PlanNode::new("test", "Test", "test");
        let ambiance = Ambiance::new(
            "pe-test",
            "plan-test",
            HashMap::new(),
            Level::from_plan_node(&node),
        );
        Self::new(
            ambiance,
            Value::Null,
            ExecutionMode::Sync,
            StepServices::over_store(Arc::new(InMemoryStore::new())),
        )
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("plan_execution_id", &self.ambiance.plan_execution_id)
            .field("depth", &self.ambiance.depth())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
