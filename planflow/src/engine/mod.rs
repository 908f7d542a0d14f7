//! The orchestration engine: plan intake, node lifecycles, interrupts.
//!
//! [`OrchestrationEngine`] owns a single dispatch loop fed by an mpsc
//! channel. Node starts and resumes run as spawned tasks; child conclusions
//! are handled inline so sibling results reach their parent one at a time.
//! A second task sweeps expired timeouts. Everything else is request/reply
//! against the store under optimistic version checks, so a transition that
//! loses a race is dropped, never retried blindly.

mod node;
mod runner;

#[cfg(test)]
mod engine_tests;

pub use node::{ExecutableResponseInfo, NodeExecution, PlanExecution};

use crate::advising::Adviser;
use crate::core::{InterruptType, NodeStatus, PlanStatus};
use crate::errors::EngineResult;
use crate::events::{NoOpSink, OrchestrationSink};
use crate::facilitation::Facilitator;
use crate::plan::Plan;
use crate::resolvers::Resolver;
use crate::steps::Step;
use crate::store::{ExecutionStore, InMemoryStore};
use crate::utils::generate_id;
use runner::Runner;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the dispatch channel feeding the engine loop.
    pub dispatch_buffer: usize,
    /// Interval between timeout sweeps.
    pub sweep_interval: Duration,
    /// Delay before re-delivering a notify that raced the node's suspension.
    pub resume_retry_delay: Duration,
    /// Re-delivery attempts before a racing notify is dropped.
    pub resume_retry_limit: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_buffer: 256,
            sweep_interval: Duration::from_millis(200),
            resume_retry_delay: Duration::from_millis(25),
            resume_retry_limit: 40,
        }
    }
}

/// An operator interrupt aimed at a plan or a single node.
#[derive(Debug, Clone)]
pub struct InterruptRequest {
    /// Unique id recorded on the affected node.
    pub interrupt_id: String,
    /// What the interrupt does.
    pub interrupt_type: InterruptType,
    /// The plan execution the interrupt belongs to.
    pub plan_execution_id: String,
    /// The targeted node execution, required for node-scoped types.
    pub node_execution_id: Option<String>,
    /// Free-form reason recorded with the effect.
    pub reason: Option<String>,
}

impl InterruptRequest {
    /// Creates a plan-scoped interrupt.
    #[must_use]
    pub fn plan(interrupt_type: InterruptType, plan_execution_id: impl Into<String>) -> Self {
        Self {
            interrupt_id: generate_id(),
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            reason: None,
        }
    }

    /// Creates a node-scoped interrupt.
    #[must_use]
    pub fn node(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            interrupt_id: generate_id(),
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: Some(node_execution_id.into()),
            reason: None,
        }
    }

    /// Sets the recorded reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Messages driving the dispatch loop.
#[derive(Debug)]
pub(crate) enum EngineMessage {
    /// Persist and run a freshly created node execution.
    StartNode { node: Box<NodeExecution> },
    /// Run a node that already exists in the store as queued.
    RunQueued { node_execution_id: String },
    /// Deliver a resolved wait to its suspended node.
    Resume {
        correlation_id: String,
        node_execution_id: String,
        payload: Value,
        attempt: u8,
    },
    /// A child reported its conclusion to its parent.
    ChildConcluded {
        parent_id: String,
        child_id: String,
        status: NodeStatus,
    },
}

/// The engine's public handle.
///
/// Cloning is cheap; all clones drive the same loop. The background tasks
/// stop when the last clone is dropped.
#[derive(Clone)]
pub struct OrchestrationEngine {
    runner: Arc<Runner>,
    tasks: Arc<EngineTasks>,
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine").finish_non_exhaustive()
    }
}

struct EngineTasks {
    dispatcher: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Drop for EngineTasks {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.sweeper.abort();
    }
}

impl OrchestrationEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> OrchestrationEngineBuilder {
        OrchestrationEngineBuilder::default()
    }

    /// Accepts a plan for execution and returns its plan execution id.
    ///
    /// The plan is validated against the registries before anything is
    /// persisted; execution itself proceeds in the background.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the plan references unregistered
    /// step, facilitator or adviser types.
    pub async fn start_plan(
        &self,
        plan: Plan,
        setup_abstractions: HashMap<String, String>,
    ) -> EngineResult<String> {
        self.runner.start_plan(plan, setup_abstractions).await
    }

    /// Blocks until the plan execution reaches a terminal status.
    pub async fn wait_for_plan(&self, plan_execution_id: &str) -> EngineResult<PlanStatus> {
        self.runner.wait_for_plan(plan_execution_id).await
    }

    /// Delivers an external notify to the wait registered under
    /// `correlation_id`.
    ///
    /// Returns `true` when the notify resolved a pending wait; `false` for
    /// duplicates and unknown ids, which are dropped.
    pub async fn notify(&self, correlation_id: &str, payload: Value) -> EngineResult<bool> {
        self.runner.notify(correlation_id, payload).await
    }

    /// Applies an operator interrupt.
    ///
    /// # Errors
    ///
    /// Returns an illegal-transition error when the target's current status
    /// does not admit the interrupt, and a configuration error when a
    /// node-scoped interrupt carries no node id.
    pub async fn interrupt(&self, request: InterruptRequest) -> EngineResult<()> {
        self.runner.apply_interrupt(request).await
    }

    /// Fetches a plan execution record.
    pub async fn plan_execution(&self, plan_execution_id: &str) -> EngineResult<PlanExecution> {
        self.runner.store().fetch_plan_execution(plan_execution_id).await
    }

    /// Fetches a node execution record.
    pub async fn node_execution(&self, node_execution_id: &str) -> EngineResult<NodeExecution> {
        self.runner.store().fetch_node_execution(node_execution_id).await
    }

    /// Returns the backing store, for read-model services.
    #[must_use]
    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(self.runner.store())
    }

    /// Stops the background tasks. In-flight node work is abandoned.
    pub fn shutdown(&self) {
        self.tasks.dispatcher.abort();
        self.tasks.sweeper.abort();
    }
}

/// Builder assembling an engine from a store, registries and a sink.
///
/// Built-in steps, facilitators, advisers and resolvers are registered
/// first; anything added here lands on top and must not collide.
#[derive(Default)]
pub struct OrchestrationEngineBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    steps: Vec<Arc<dyn Step>>,
    facilitators: Vec<Arc<dyn Facilitator>>,
    advisers: Vec<Arc<dyn Adviser>>,
    resolvers: Vec<Arc<dyn Resolver>>,
    sink: Option<Arc<dyn OrchestrationSink>>,
    config: Option<EngineConfig>,
}

impl OrchestrationEngineBuilder {
    /// Sets the execution store. Defaults to [`InMemoryStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers a step.
    #[must_use]
    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Registers a facilitator.
    #[must_use]
    pub fn facilitator(mut self, facilitator: Arc<dyn Facilitator>) -> Self {
        self.facilitators.push(facilitator);
        self
    }

    /// Registers an adviser.
    #[must_use]
    pub fn adviser(mut self, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.push(adviser);
        self
    }

    /// Registers a resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Sets the event sink. Defaults to [`NoOpSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn OrchestrationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the tuning knobs.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the engine and spawns its background tasks.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error when an added step,
    /// facilitator, adviser or resolver collides with an existing type.
    pub fn build(self) -> EngineResult<OrchestrationEngine> {
        let config = self.config.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn ExecutionStore>);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(NoOpSink) as Arc<dyn OrchestrationSink>);

        let steps = crate::steps::StepRegistry::with_builtins();
        for step in self.steps {
            steps.register(step)?;
        }
        let facilitators = crate::facilitation::FacilitatorRegistry::with_builtins();
        for facilitator in self.facilitators {
            facilitators.register(facilitator)?;
        }
        let advisers = crate::advising::AdviserRegistry::with_builtins();
        for adviser in self.advisers {
            advisers.register(adviser)?;
        }
        let resolvers = crate::resolvers::ResolverRegistry::with_builtins(Arc::clone(&store));
        for resolver in self.resolvers {
            resolvers.register(resolver)?;
        }

        let (tx, rx) = mpsc::channel(config.dispatch_buffer);
        let runner = Arc::new(Runner::new(
            store,
            steps,
            facilitators,
            advisers,
            resolvers,
            sink,
            tx,
            config,
        ));

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&runner), rx));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&runner)));

        Ok(OrchestrationEngine {
            runner,
            tasks: Arc::new(EngineTasks {
                dispatcher,
                sweeper,
            }),
        })
    }
}

async fn dispatch_loop(runner: Arc<Runner>, mut rx: mpsc::Receiver<EngineMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            EngineMessage::StartNode { node } => {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    let node_execution_id = node.id.clone();
                    if let Err(e) = runner.handle_start(*node).await {
                        error!(node_execution_id, error = %e, "node start failed");
                    }
                });
            }
            EngineMessage::RunQueued { node_execution_id } => {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    if let Err(e) = runner.handle_run_queued(&node_execution_id).await {
                        error!(node_execution_id, error = %e, "queued node run failed");
                    }
                });
            }
            EngineMessage::Resume {
                correlation_id,
                node_execution_id,
                payload,
                attempt,
            } => {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    if let Err(e) = runner
                        .handle_resume(&correlation_id, &node_execution_id, payload, attempt)
                        .await
                    {
                        error!(node_execution_id, correlation_id, error = %e, "resume failed");
                    }
                });
            }
            // Inline: sibling conclusions must reach the parent serially.
            EngineMessage::ChildConcluded {
                parent_id,
                child_id,
                status,
            } => {
                if let Err(e) = runner
                    .handle_child_concluded(&parent_id, &child_id, status)
                    .await
                {
                    error!(parent_id, child_id, error = %e, "child aggregation failed");
                }
            }
        }
    }
}

async fn sweep_loop(runner: Arc<Runner>) {
    let mut ticker = tokio::time::interval(runner.config().sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        runner.sweep_timeouts().await;
    }
}
