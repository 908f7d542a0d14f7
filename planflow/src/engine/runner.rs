//! Node lifecycle internals: facilitation, execution, conclusion, advising.
//!
//! Every persisted transition goes through the store's version check. A
//! handler that loses a race (the sweeper expired the node, an interrupt
//! landed first) drops its work instead of retrying; the winner's path is
//! already driving the node.

use super::node::{ExecutableResponseInfo, NodeExecution, PlanExecution};
use super::{EngineConfig, EngineMessage, InterruptRequest};
use crate::advising::{Advise, AdviseEvent, AdviserRegistry};
use crate::ambiance::{Ambiance, Level};
use crate::core::{
    FailureInfo, InterruptEffect, InterruptType, InterventionAction, NodeStatus, PlanStatus,
};
use crate::errors::{EngineError, EngineResult};
use crate::events::{OrchestrationEvent, OrchestrationSink};
use crate::facilitation::{ExecutionMode, FacilitatorRegistry, FacilitatorResponse};
use crate::plan::PlanNode;
use crate::resolvers::{resolve_inputs, ResolverRegistry};
use crate::steps::{StepContext, StepRegistry, StepResponse, StepServices};
use crate::store::ExecutionStore;
use crate::timeout::{ExpiredTimeout, TimeoutAction, TimeoutDimension, TimeoutEngine, TimeoutTracker};
use crate::utils::now_utc;
use crate::waiter::WaitNotifyEngine;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// True for errors meaning another actor transitioned the node first.
fn lost_race(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::VersionConflict { .. } | EngineError::IllegalTransition { .. }
    )
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365_000))
}

/// Owns the registries, services and background state behind the engine.
pub(crate) struct Runner {
    store: Arc<dyn ExecutionStore>,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    services: StepServices,
    timeouts: TimeoutEngine,
    sink: Arc<dyn OrchestrationSink>,
    tx: mpsc::Sender<EngineMessage>,
    watches: DashMap<String, watch::Sender<PlanStatus>>,
    config: EngineConfig,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn ExecutionStore>,
        steps: StepRegistry,
        facilitators: FacilitatorRegistry,
        advisers: AdviserRegistry,
        resolvers: ResolverRegistry,
        sink: Arc<dyn OrchestrationSink>,
        tx: mpsc::Sender<EngineMessage>,
        config: EngineConfig,
    ) -> Self {
        let services = StepServices {
            waiter: WaitNotifyEngine::new(Arc::clone(&store)),
            resolvers: Arc::new(resolvers),
            restraints: Arc::new(crate::restraint::RestraintService::new(Arc::clone(&store))),
            barriers: Arc::new(crate::restraint::BarrierService::new(Arc::clone(&store))),
        };
        Self {
            store,
            steps,
            facilitators,
            advisers,
            services,
            timeouts: TimeoutEngine::new(),
            sink,
            tx,
            watches: DashMap::new(),
            config,
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Queues a message without ever blocking the caller. When the channel
    /// is full the send is finished from a task.
    fn dispatch(&self, message: EngineMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(message).await.is_err() {
                        warn!("engine loop is gone; message dropped");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("engine loop is gone; message dropped");
            }
        }
    }

    // ---------------------------------------------------------------- intake

    pub(crate) async fn start_plan(
        &self,
        plan: crate::plan::Plan,
        setup_abstractions: HashMap<String, String>,
    ) -> EngineResult<String> {
        self.validate_plan(&plan)?;

        let execution = PlanExecution::new(plan, setup_abstractions);
        let plan_execution_id = execution.id.clone();
        self.store.save_plan_execution(execution.clone()).await?;
        self.services
            .barriers
            .register_for_plan(&execution.plan, &plan_execution_id)
            .await?;

        let (status_tx, _) = watch::channel(PlanStatus::Running);
        self.watches.insert(plan_execution_id.clone(), status_tx);

        let starting = execution.plan.node(&execution.plan.starting_node_id)?;
        let ambiance = Ambiance::new(
            &plan_execution_id,
            &execution.plan.plan_id,
            execution.setup_abstractions.clone(),
            Level::from_plan_node(starting),
        );
        let node = NodeExecution::new(ambiance, starting, None)?;

        info!(
            %plan_execution_id,
            plan_id = %execution.plan.plan_id,
            "plan accepted"
        );
        self.dispatch(EngineMessage::StartNode {
            node: Box::new(node),
        });
        Ok(plan_execution_id)
    }

    /// Rejects plans referencing unregistered types before anything runs.
    fn validate_plan(&self, plan: &crate::plan::Plan) -> EngineResult<()> {
        for node in plan.nodes.values() {
            self.steps.obtain(&node.step_type)?;
            for obtainment in &node.facilitator_obtainments {
                self.facilitators.obtain(&obtainment.facilitator_type)?;
            }
            for obtainment in &node.adviser_obtainments {
                self.advisers.obtain(&obtainment.adviser_type)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn wait_for_plan(&self, plan_execution_id: &str) -> EngineResult<PlanStatus> {
        let mut rx = self
            .watches
            .get(plan_execution_id)
            .map(|entry| entry.subscribe());
        let execution = self.store.fetch_plan_execution(plan_execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(execution.status);
        }
        match rx.as_mut() {
            Some(rx) => loop {
                if rx.changed().await.is_err() {
                    // The sender is gone; the plan ended and was unwatched.
                    let execution =
                        self.store.fetch_plan_execution(plan_execution_id).await?;
                    return Ok(execution.status);
                }
                let status = *rx.borrow();
                if status.is_terminal() {
                    return Ok(status);
                }
            },
            None => loop {
                tokio::time::sleep(self.config.sweep_interval).await;
                let execution = self.store.fetch_plan_execution(plan_execution_id).await?;
                if execution.status.is_terminal() {
                    return Ok(execution.status);
                }
            },
        }
    }

    pub(crate) async fn notify(
        &self,
        correlation_id: &str,
        payload: Value,
    ) -> EngineResult<bool> {
        let Some(instance) = self
            .services
            .waiter
            .notify(correlation_id, payload.clone())
            .await?
        else {
            return Ok(false);
        };
        self.dispatch(EngineMessage::Resume {
            correlation_id: instance.correlation_id,
            node_execution_id: instance.node_execution_id,
            payload,
            attempt: 0,
        });
        Ok(true)
    }

    // ------------------------------------------------------------ lifecycle

    pub(crate) async fn handle_start(&self, node: NodeExecution) -> EngineResult<()> {
        let plan_execution = self
            .store
            .fetch_plan_execution(node.plan_execution_id())
            .await?;
        if plan_execution.status.is_terminal() {
            debug!(node_execution_id = %node.id, "plan already ended; node not started");
            return Ok(());
        }

        self.store.insert_node_execution(node.clone()).await?;
        if let Some(previous_id) = node.previous_id.clone() {
            if let Err(e) = self.link_next(&previous_id, &node.id).await {
                debug!(%previous_id, error = %e, "sibling link skipped");
            }
        }

        if plan_execution.status == PlanStatus::Paused {
            let _ = self.transition(node, NodeStatus::Paused).await?;
            return Ok(());
        }
        self.run_node(node, &plan_execution).await
    }

    pub(crate) async fn handle_run_queued(&self, node_execution_id: &str) -> EngineResult<()> {
        let node = match self.store.fetch_node_execution(node_execution_id).await {
            Ok(node) => node,
            Err(EngineError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if node.status != NodeStatus::Queued {
            debug!(node_execution_id, status = %node.status, "node is not queued; run skipped");
            return Ok(());
        }
        let plan_execution = self
            .store
            .fetch_plan_execution(node.plan_execution_id())
            .await?;
        if plan_execution.status.is_terminal() {
            return Ok(());
        }
        if plan_execution.status == PlanStatus::Paused {
            let _ = self.transition(node, NodeStatus::Paused).await?;
            return Ok(());
        }
        self.run_node(node, &plan_execution).await
    }

    async fn run_node(
        &self,
        node: NodeExecution,
        plan_execution: &PlanExecution,
    ) -> EngineResult<()> {
        let plan_node = plan_execution.plan.node(&node.setup_id)?.clone();

        let inputs = match resolve_inputs(
            &self.services.resolvers,
            &node.ambiance,
            &plan_node.step_parameters,
        )
        .await
        {
            Ok(inputs) => inputs,
            Err(e) => {
                return self
                    .conclude_node(node, NodeStatus::Errored, Some(e.to_failure_info()), true)
                    .await;
            }
        };

        let response = match self.facilitate(&node, &plan_node, &inputs) {
            Ok(response) => response,
            Err(e) => return self.fail_plan_for(node, e).await,
        };

        let mut node = node;
        node.facilitator_response = Some(response.clone());

        if response.mode == ExecutionMode::Skip {
            node.skip_info = response
                .pass_through
                .as_ref()
                .and_then(|v| v.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return self.conclude_node(node, NodeStatus::Skipped, None, true).await;
        }

        if !response.initial_wait.is_zero() {
            tokio::time::sleep(response.initial_wait).await;
        }

        node.started_at = Some(now_utc());
        let node = match self.transition(node, NodeStatus::Running).await {
            Ok(node) => node,
            Err(e) if lost_race(&e) => {
                debug!(error = %e, "node was claimed before it could run");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(timeout) = plan_node.timeout {
            let tracker =
                TimeoutTracker::new(TimeoutDimension::Absolute, now_utc() + to_chrono(timeout));
            self.timeouts
                .register(&node.id, tracker, TimeoutAction::ExpireNode);
        }

        let ctx = StepContext::new(
            node.ambiance.clone(),
            inputs,
            response.mode,
            self.services.clone(),
        )
        .with_pass_through(response.pass_through.clone());
        let step = self.steps.obtain(&plan_node.step_type)?;

        let outcome = step.execute(&ctx).await;
        let result = self.apply_step_outcome(node, &plan_node, outcome).await;
        self.deliver_notifies(&ctx).await;
        result
    }

    /// Asks the node's facilitators, in configured order, how it should run.
    ///
    /// A node without obtainments runs sync. Obtainments that all decline
    /// are a configuration error.
    fn facilitate(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
        inputs: &Value,
    ) -> EngineResult<FacilitatorResponse> {
        if plan_node.facilitator_obtainments.is_empty() {
            return Ok(FacilitatorResponse::sync());
        }
        for obtainment in &plan_node.facilitator_obtainments {
            let facilitator = self.facilitators.obtain(&obtainment.facilitator_type)?;
            if let Some(response) =
                facilitator.facilitate(&node.ambiance, &obtainment.parameters, inputs)?
            {
                debug!(
                    node_execution_id = %node.id,
                    facilitator = %obtainment.facilitator_type,
                    mode = %response.mode,
                    "node facilitated"
                );
                return Ok(response);
            }
        }
        Err(EngineError::configuration(format!(
            "no facilitator accepted node '{}'",
            node.setup_id
        )))
    }

    pub(crate) async fn handle_resume(
        &self,
        correlation_id: &str,
        node_execution_id: &str,
        payload: Value,
        attempt: u8,
    ) -> EngineResult<()> {
        let node = match self.store.fetch_node_execution(node_execution_id).await {
            Ok(node) => node,
            Err(EngineError::NotFound { .. }) => {
                debug!(node_execution_id, correlation_id, "resume target is gone; dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match node.status {
            NodeStatus::AsyncWaiting | NodeStatus::ResourceWaiting => {}
            NodeStatus::Running => {
                // The notify raced the suspension: the wait is registered
                // but the park is not persisted yet. Re-deliver shortly.
                if attempt >= self.config.resume_retry_limit {
                    warn!(
                        node_execution_id,
                        correlation_id, "resume gave up; node never suspended"
                    );
                    return Ok(());
                }
                let tx = self.tx.clone();
                let delay = self.config.resume_retry_delay;
                let message = EngineMessage::Resume {
                    correlation_id: correlation_id.to_string(),
                    node_execution_id: node_execution_id.to_string(),
                    payload,
                    attempt: attempt + 1,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(message).await;
                });
                return Ok(());
            }
            other => {
                debug!(node_execution_id, correlation_id, status = %other, "resume dropped");
                return Ok(());
            }
        }

        let parked_correlation = match &node.executable_response {
            Some(ExecutableResponseInfo::Async { correlation_id, .. }) => correlation_id.clone(),
            _ => String::new(),
        };
        if parked_correlation != correlation_id {
            warn!(
                node_execution_id,
                correlation_id, "resume does not match the parked wait; dropped"
            );
            return Ok(());
        }

        let node = match self.transition(node, NodeStatus::Running).await {
            Ok(node) => node,
            Err(e) if lost_race(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let plan_execution = self
            .store
            .fetch_plan_execution(node.plan_execution_id())
            .await?;
        let plan_node = plan_execution.plan.node(&node.setup_id)?.clone();

        let inputs = match resolve_inputs(
            &self.services.resolvers,
            &node.ambiance,
            &plan_node.step_parameters,
        )
        .await
        {
            Ok(inputs) => inputs,
            Err(e) => {
                return self
                    .conclude_node(node, NodeStatus::Errored, Some(e.to_failure_info()), true)
                    .await;
            }
        };
        let mode = node
            .facilitator_response
            .as_ref()
            .map_or(ExecutionMode::Async, |r| r.mode);
        let pass_through = node
            .facilitator_response
            .as_ref()
            .and_then(|r| r.pass_through.clone());
        let ctx = StepContext::new(node.ambiance.clone(), inputs, mode, self.services.clone())
            .with_pass_through(pass_through);
        let step = self.steps.obtain(&plan_node.step_type)?;

        debug!(node_execution_id = %node.id, correlation_id, "node resuming");
        let outcome = step.handle_resume(&ctx, payload).await;
        let result = self.apply_step_outcome(node, &plan_node, outcome).await;
        self.deliver_notifies(&ctx).await;
        result
    }

    async fn apply_step_outcome(
        &self,
        node: NodeExecution,
        plan_node: &PlanNode,
        outcome: EngineResult<StepResponse>,
    ) -> EngineResult<()> {
        match outcome {
            Ok(StepResponse::Terminal(result)) => {
                self.conclude_node(node, result.status, result.failure_info, true)
                    .await
            }
            Ok(StepResponse::Async {
                correlation_id,
                wait_kind,
            }) => {
                let mut node = node;
                node.executable_response = Some(ExecutableResponseInfo::Async {
                    correlation_id,
                    wait_kind,
                });
                match self.transition(node, wait_kind.waiting_status()).await {
                    Ok(_) => Ok(()),
                    Err(e) if lost_race(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Ok(StepResponse::Child { child_setup_id }) => {
                self.spawn_children(node, vec![child_setup_id], false).await
            }
            Ok(StepResponse::Children { child_setup_ids }) => {
                self.spawn_children(node, child_setup_ids, true).await
            }
            Err(e) if e.is_configuration() => self.fail_plan_for(node, e).await,
            Err(e) => {
                warn!(
                    node_execution_id = %node.id,
                    step_type = %plan_node.step_type,
                    error = %e,
                    "step errored"
                );
                self.conclude_node(node, NodeStatus::Errored, Some(e.to_failure_info()), true)
                    .await
            }
        }
    }

    /// Parks the node as child-waiting and dispatches its children.
    async fn spawn_children(
        &self,
        node: NodeExecution,
        setup_ids: Vec<String>,
        fan_out: bool,
    ) -> EngineResult<()> {
        if setup_ids.is_empty() {
            let error = EngineError::configuration(format!(
                "node '{}' produced no children",
                node.setup_id
            ));
            return self.fail_plan_for(node, error).await;
        }
        let plan_execution = self
            .store
            .fetch_plan_execution(node.plan_execution_id())
            .await?;

        let mut children = Vec::with_capacity(setup_ids.len());
        for setup_id in &setup_ids {
            let child_plan_node = match plan_execution.plan.node(setup_id) {
                Ok(child) => child,
                Err(e) => return self.fail_plan_for(node, e).await,
            };
            let ambiance = node
                .ambiance
                .clone_for_child(Level::from_plan_node(child_plan_node));
            let child = NodeExecution::new(ambiance, child_plan_node, Some(node.id.clone()))?;
            children.push(child);
        }

        let mut parent = node;
        parent.pending_children = u32::try_from(children.len()).unwrap_or(u32::MAX);
        parent.worst_child_status = None;
        parent.executable_response = Some(if fan_out {
            ExecutableResponseInfo::Children {
                child_execution_ids: children.iter().map(|c| c.id.clone()).collect(),
            }
        } else {
            ExecutableResponseInfo::Child {
                child_execution_id: children[0].id.clone(),
            }
        });
        let waiting = if fan_out {
            NodeStatus::ChildrenWaiting
        } else {
            NodeStatus::ChildWaiting
        };
        match self.transition(parent, waiting).await {
            Ok(_) => {}
            Err(e) if lost_race(&e) => return Ok(()),
            Err(e) => return Err(e),
        }

        for child in children {
            self.dispatch(EngineMessage::StartNode {
                node: Box::new(child),
            });
        }
        Ok(())
    }

    // ----------------------------------------------------------- conclusion

    /// Persists a conclusion and, when `advise` is set, routes what happens
    /// next. Aborted and Expired are reached through Discontinuing.
    async fn conclude_node(
        &self,
        node: NodeExecution,
        status: NodeStatus,
        failure_info: Option<FailureInfo>,
        advise: bool,
    ) -> EngineResult<()> {
        let node_execution_id = node.id.clone();
        let from_status = node.status;
        let mut node = node;
        if failure_info.is_some() {
            node.failure_info = failure_info;
        }
        node.ended_at = Some(now_utc());

        if matches!(status, NodeStatus::Aborted | NodeStatus::Expired)
            && from_status != NodeStatus::Discontinuing
        {
            node = match self.transition(node, NodeStatus::Discontinuing).await {
                Ok(node) => node,
                Err(e) if lost_race(&e) => {
                    debug!(node_execution_id, error = %e, "conclusion lost the race");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        }

        let node = match self.transition(node, status).await {
            Ok(node) => node,
            Err(e) if lost_race(&e) => {
                debug!(node_execution_id, error = %e, "conclusion lost the race");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.cleanup_node(&node).await;

        if advise {
            self.advise_and_route(node, from_status).await
        } else {
            Ok(())
        }
    }

    /// Drops every runtime attachment of a concluded node: timeout trackers,
    /// pending waits and resource holds scoped to it.
    async fn cleanup_node(&self, node: &NodeExecution) {
        self.timeouts.cancel_for_node(&node.id);
        if let Err(e) = self.store.delete_waits_for_node(&node.id).await {
            warn!(node_execution_id = %node.id, error = %e, "wait cleanup failed");
        }
        match self.services.restraints.release_scope(&node.id).await {
            Ok(promoted) => self.notify_promotions(promoted).await,
            Err(e) => {
                warn!(node_execution_id = %node.id, error = %e, "restraint release failed");
            }
        }
    }

    /// Resumes every node whose restraint instance was just promoted.
    async fn notify_promotions(&self, promoted: Vec<crate::restraint::RestraintInstance>) {
        for instance in promoted {
            let payload = serde_json::json!({
                "restraint": "promoted",
                "resource_unit": instance.resource_unit,
            });
            match self.notify(&instance.id, payload).await {
                Ok(true) => {
                    debug!(
                        restraint_instance_id = %instance.id,
                        resource_unit = %instance.resource_unit,
                        "promoted hold resumed"
                    );
                }
                Ok(false) => debug!(
                    restraint_instance_id = %instance.id,
                    "promoted hold had no pending wait"
                ),
                Err(e) => warn!(
                    restraint_instance_id = %instance.id,
                    error = %e,
                    "promotion notify failed"
                ),
            }
        }
    }

    async fn advise_and_route(
        &self,
        node: NodeExecution,
        from_status: NodeStatus,
    ) -> EngineResult<()> {
        let plan_execution = self
            .store
            .fetch_plan_execution(node.plan_execution_id())
            .await?;
        if plan_execution.status.is_terminal() {
            return Ok(());
        }
        let plan_node = plan_execution.plan.node(&node.setup_id)?;

        let advise = self.advise(&node, plan_node, from_status)?;
        match advise {
            Some(Advise::NextStep { next_node_id }) => {
                self.start_sibling(&node, &plan_execution, &next_node_id).await
            }
            Some(Advise::Retry { wait }) => self.start_retry(node, wait).await,
            Some(Advise::InterventionWait {
                timeout,
                on_timeout,
            }) => self.park_for_intervention(node, timeout, on_timeout).await,
            Some(Advise::EndPlan) | None => self.report_conclusion(&node, node.status).await,
        }
    }

    /// Runs the node's advisers in precedence order. The first adviser whose
    /// `can_advise` accepts the event owns the decision, even when it then
    /// returns no advise.
    fn advise(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
        from_status: NodeStatus,
    ) -> EngineResult<Option<Advise>> {
        for obtainment in &plan_node.adviser_obtainments {
            let adviser = self.advisers.obtain(&obtainment.adviser_type)?;
            let mut event = AdviseEvent::new(node.ambiance.clone(), from_status, node.status)
                .with_retry_count(node.retry_index)
                .with_parameters(obtainment.parameters.clone());
            if let Some(failure_info) = &node.failure_info {
                event = event.with_failure_info(failure_info.clone());
            }
            if adviser.can_advise(&event) {
                let advise = adviser.on_advise_event(&event)?;
                debug!(
                    node_execution_id = %node.id,
                    adviser = %obtainment.adviser_type,
                    advise = ?advise,
                    "node advised"
                );
                return Ok(advise);
            }
        }
        Ok(None)
    }

    async fn start_sibling(
        &self,
        node: &NodeExecution,
        plan_execution: &PlanExecution,
        next_setup_id: &str,
    ) -> EngineResult<()> {
        let next_plan_node = match plan_execution.plan.node(next_setup_id) {
            Ok(next) => next,
            Err(e) => {
                error!(
                    node_execution_id = %node.id,
                    next_setup_id,
                    error = %e,
                    "advised next node does not exist"
                );
                return self
                    .end_plan(node.plan_execution_id(), PlanStatus::Errored)
                    .await;
            }
        };
        let ambiance = node
            .ambiance
            .clone_for_sibling(Level::from_plan_node(next_plan_node))?;
        let mut next = NodeExecution::new(ambiance, next_plan_node, node.parent_id.clone())?;
        next.previous_id = Some(node.id.clone());
        self.dispatch(EngineMessage::StartNode {
            node: Box::new(next),
        });
        Ok(())
    }

    /// Supersedes a concluded attempt with a fresh one after `wait`.
    async fn start_retry(&self, node: NodeExecution, wait: Duration) -> EngineResult<()> {
        let plan_execution = self
            .store
            .fetch_plan_execution(node.plan_execution_id())
            .await?;
        if plan_execution.status.is_terminal() {
            return Ok(());
        }
        let plan_node = plan_execution.plan.node(&node.setup_id)?.clone();

        let mut old = self.store.fetch_node_execution(&node.id).await?;
        old.old_retry = true;
        let old = self.store.update_node_execution(old).await?;

        let level = Level::from_plan_node(&plan_node).with_retry_index(old.retry_index + 1);
        let ambiance = old.ambiance.clone_for_sibling(level)?;
        let mut retry = NodeExecution::new(ambiance, &plan_node, old.parent_id.clone())?;
        retry.previous_id = old.previous_id.clone();
        retry.retried_ids = old
            .retried_ids
            .iter()
            .cloned()
            .chain([old.id.clone()])
            .collect();

        info!(
            node_execution_id = %old.id,
            retry_execution_id = %retry.id,
            retry_index = retry.retry_index,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "node retrying"
        );
        if wait.is_zero() {
            self.dispatch(EngineMessage::StartNode {
                node: Box::new(retry),
            });
        } else {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = tx
                    .send(EngineMessage::StartNode {
                        node: Box::new(retry),
                    })
                    .await;
            });
        }
        Ok(())
    }

    /// Re-opens a broken node as intervention-waiting with a decision
    /// deadline.
    async fn park_for_intervention(
        &self,
        node: NodeExecution,
        timeout: Duration,
        on_timeout: InterventionAction,
    ) -> EngineResult<()> {
        let mut node = node;
        node.ended_at = None;
        let node = match self.transition(node, NodeStatus::InterventionWaiting).await {
            Ok(node) => node,
            Err(e) if lost_race(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        let tracker = TimeoutTracker::new(
            TimeoutDimension::Intervention,
            now_utc() + to_chrono(timeout),
        );
        self.timeouts
            .register(&node.id, tracker, TimeoutAction::Intervention(on_timeout));
        info!(
            node_execution_id = %node.id,
            on_timeout = ?on_timeout,
            "node waiting for manual intervention"
        );
        Ok(())
    }

    /// Reports a conclusion to the parent, or ends the plan for root chain
    /// nodes. `effective_status` may differ from the persisted status when
    /// an intervention chose to ignore a failure.
    async fn report_conclusion(
        &self,
        node: &NodeExecution,
        effective_status: NodeStatus,
    ) -> EngineResult<()> {
        match &node.parent_id {
            Some(parent_id) => {
                self.dispatch(EngineMessage::ChildConcluded {
                    parent_id: parent_id.clone(),
                    child_id: node.id.clone(),
                    status: effective_status,
                });
                Ok(())
            }
            None => {
                self.end_plan(
                    node.plan_execution_id(),
                    PlanStatus::from_node_status(effective_status),
                )
                .await
            }
        }
    }

    // ---------------------------------------------------------- aggregation

    pub(crate) async fn handle_child_concluded(
        &self,
        parent_id: &str,
        child_id: &str,
        status: NodeStatus,
    ) -> EngineResult<()> {
        let mut parent = match self.store.fetch_node_execution(parent_id).await {
            Ok(parent) => parent,
            Err(EngineError::NotFound { .. }) => {
                debug!(parent_id, child_id, "parent is gone; child conclusion dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !matches!(
            parent.status,
            NodeStatus::ChildWaiting | NodeStatus::ChildrenWaiting
        ) {
            debug!(
                parent_id,
                child_id,
                status = %parent.status,
                "parent no longer waiting; child conclusion dropped"
            );
            return Ok(());
        }

        let plan_execution = self
            .store
            .fetch_plan_execution(parent.plan_execution_id())
            .await?;
        let continue_on_failure = plan_execution
            .plan
            .node(&parent.setup_id)
            .map(|n| n.continue_on_children_failure)
            .unwrap_or(false);

        parent.pending_children = parent.pending_children.saturating_sub(1);
        parent.worst_child_status = Some(match parent.worst_child_status {
            Some(worst) => worst.worst(status),
            None => status,
        });

        let fail_fast = status.is_broken()
            && !continue_on_failure
            && parent.status == NodeStatus::ChildrenWaiting
            && parent.pending_children > 0;
        if fail_fast {
            parent.pending_children = 0;
        }

        let parent = self.store.update_node_execution(parent).await?;

        if fail_fast {
            info!(
                parent_id,
                child_id, "child broke; aborting its running siblings"
            );
            self.abort_running_children(&parent.id).await;
        }

        if parent.pending_children == 0 {
            let worst = parent.worst_child_status.unwrap_or(NodeStatus::Succeeded);
            let conclusion = if worst.is_positive() {
                NodeStatus::Succeeded
            } else {
                worst
            };
            let failure_info = if conclusion.is_broken() {
                self.worst_child_failure(&parent.id, worst).await
            } else {
                None
            };
            self.conclude_node(parent, conclusion, failure_info, true)
                .await?;
        }
        Ok(())
    }

    async fn worst_child_failure(
        &self,
        parent_id: &str,
        worst: NodeStatus,
    ) -> Option<FailureInfo> {
        let children = self.store.fetch_children(parent_id).await.ok()?;
        children
            .into_iter()
            .find(|child| child.status == worst && !child.old_retry)
            .and_then(|child| child.failure_info)
    }

    async fn abort_running_children(&self, parent_id: &str) {
        let children = match self.store.fetch_children(parent_id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(parent_id, error = %e, "sibling abort could not list children");
                return;
            }
        };
        for child in children {
            if child.status.is_terminal() || child.old_retry {
                continue;
            }
            self.abort_subtree(child.id.clone()).await;
        }
    }

    /// Aborts a node and everything below it, without advising or
    /// reporting. Used for fail-fast sibling aborts and end-of-plan sweeps.
    fn abort_subtree(&self, node_execution_id: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Ok(children) = self.store.fetch_children(&node_execution_id).await {
                for child in children {
                    if !child.status.is_terminal() && !child.old_retry {
                        self.abort_subtree(child.id).await;
                    }
                }
            }
            match self.store.fetch_node_execution(&node_execution_id).await {
                Ok(node) if !node.status.is_terminal() => {
                    if let Err(e) = self
                        .conclude_node(node, NodeStatus::Aborted, None, false)
                        .await
                    {
                        warn!(%node_execution_id, error = %e, "subtree abort failed");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(%node_execution_id, error = %e, "subtree abort skipped"),
            }
        })
    }

    // -------------------------------------------------------------- timeouts

    pub(crate) async fn sweep_timeouts(&self) {
        for expired in self.timeouts.sweep(now_utc()) {
            if let Err(e) = self.handle_timeout(&expired).await {
                error!(
                    node_execution_id = %expired.node_execution_id,
                    error = %e,
                    "timeout handling failed"
                );
            }
        }
    }

    async fn handle_timeout(&self, expired: &ExpiredTimeout) -> EngineResult<()> {
        let node = match self
            .store
            .fetch_node_execution(&expired.node_execution_id)
            .await
        {
            Ok(node) => node,
            Err(EngineError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if node.status.is_terminal() {
            return Ok(());
        }
        match expired.action {
            TimeoutAction::ExpireNode => {
                info!(node_execution_id = %node.id, "node timed out");
                let failure = FailureInfo::timeout("node exceeded its execution timeout");
                self.conclude_node(node, NodeStatus::Expired, Some(failure), true)
                    .await
            }
            TimeoutAction::Intervention(action) => {
                if node.status != NodeStatus::InterventionWaiting {
                    return Ok(());
                }
                info!(
                    node_execution_id = %node.id,
                    action = ?action,
                    "intervention window elapsed"
                );
                self.apply_intervention(node, action).await
            }
        }
    }

    /// Resolves an intervention-waiting node with the given decision.
    async fn apply_intervention(
        &self,
        node: NodeExecution,
        action: InterventionAction,
    ) -> EngineResult<()> {
        match action {
            InterventionAction::Abort => {
                self.conclude_node(node, NodeStatus::Aborted, None, true)
                    .await
            }
            InterventionAction::MarkFailed => {
                let failure = node
                    .failure_info
                    .clone()
                    .unwrap_or_else(|| FailureInfo::application("failed by intervention"));
                self.conclude_node(node, NodeStatus::Failed, Some(failure), true)
                    .await
            }
            InterventionAction::MarkSuccess => {
                self.conclude_node(node, NodeStatus::Succeeded, None, true)
                    .await
            }
            InterventionAction::Ignore => {
                // Close as failed, report success upward.
                let snapshot = node.clone();
                self.conclude_node(node, NodeStatus::Failed, None, false)
                    .await?;
                self.report_conclusion(&snapshot, NodeStatus::Succeeded).await
            }
            InterventionAction::Retry => {
                let snapshot = node.clone();
                self.conclude_node(node, NodeStatus::Failed, None, false)
                    .await?;
                self.start_retry(snapshot, Duration::ZERO).await
            }
        }
    }

    // ------------------------------------------------------------ interrupts

    pub(crate) async fn apply_interrupt(&self, request: InterruptRequest) -> EngineResult<()> {
        let effect = InterruptEffect::new(
            &request.interrupt_id,
            request.interrupt_type,
            request.reason.clone(),
        );
        match request.interrupt_type {
            InterruptType::AbortAll => {
                self.end_plan(&request.plan_execution_id, PlanStatus::Aborted)
                    .await?;
            }
            InterruptType::PauseAll => {
                let execution = self
                    .set_plan_status(&request.plan_execution_id, PlanStatus::Paused)
                    .await?;
                if execution.status != PlanStatus::Paused {
                    return Err(EngineError::configuration(format!(
                        "plan execution '{}' cannot pause from {}",
                        request.plan_execution_id, execution.status
                    )));
                }
                self.pause_queued_nodes(&request.plan_execution_id).await?;
            }
            InterruptType::ResumeAll => {
                let execution = self
                    .store
                    .fetch_plan_execution(&request.plan_execution_id)
                    .await?;
                if execution.status != PlanStatus::Paused {
                    return Err(EngineError::configuration(format!(
                        "plan execution '{}' is not paused",
                        request.plan_execution_id
                    )));
                }
                self.set_plan_status(&request.plan_execution_id, PlanStatus::Running)
                    .await?;
                self.requeue_paused_nodes(&request.plan_execution_id).await?;
            }
            InterruptType::Abort => {
                let node = self.node_target(&request).await?;
                if node.status.is_terminal() {
                    return Err(EngineError::IllegalTransition {
                        node_execution_id: node.id,
                        from: node.status,
                        to: NodeStatus::Discontinuing,
                    });
                }
                let node = self.record_effect(node, effect).await?;
                self.abort_running_children(&node.id).await;
                self.conclude_node(node, NodeStatus::Aborted, None, true)
                    .await?;
            }
            InterruptType::Pause => {
                let node = self.node_target(&request).await?;
                self.require_transition(&node, NodeStatus::Paused)?;
                let node = self.record_effect(node, effect).await?;
                let _ = self.transition(node, NodeStatus::Paused).await?;
            }
            InterruptType::Resume => {
                let node = self.node_target(&request).await?;
                self.require_transition(&node, NodeStatus::Queued)?;
                let node = self.record_effect(node, effect).await?;
                let node = self.transition(node, NodeStatus::Queued).await?;
                self.dispatch(EngineMessage::RunQueued {
                    node_execution_id: node.id,
                });
            }
            InterruptType::Retry => {
                let node = self.node_target(&request).await?;
                if node.status != NodeStatus::InterventionWaiting {
                    return Err(EngineError::IllegalTransition {
                        node_execution_id: node.id,
                        from: node.status,
                        to: NodeStatus::Queued,
                    });
                }
                let node = self.record_effect(node, effect).await?;
                self.apply_intervention(node, InterventionAction::Retry)
                    .await?;
            }
            InterruptType::MarkExpired => {
                let node = self.node_target(&request).await?;
                self.require_transition(&node, NodeStatus::Discontinuing)?;
                let node = self.record_effect(node, effect).await?;
                let failure = FailureInfo::timeout("expired by interrupt");
                self.conclude_node(node, NodeStatus::Expired, Some(failure), true)
                    .await?;
            }
            InterruptType::MarkFailed => {
                let node = self.node_target(&request).await?;
                self.require_transition(&node, NodeStatus::Failed)?;
                let node = self.record_effect(node, effect).await?;
                let failure = FailureInfo::application("failed by interrupt");
                self.conclude_node(node, NodeStatus::Failed, Some(failure), true)
                    .await?;
            }
            InterruptType::MarkSuccess => {
                let node = self.node_target(&request).await?;
                self.require_transition(&node, NodeStatus::Succeeded)?;
                let node = self.record_effect(node, effect).await?;
                self.conclude_node(node, NodeStatus::Succeeded, None, true)
                    .await?;
            }
        }

        info!(
            plan_execution_id = %request.plan_execution_id,
            node_execution_id = ?request.node_execution_id,
            interrupt_type = %request.interrupt_type,
            "interrupt took effect"
        );
        self.sink
            .emit(OrchestrationEvent::InterruptTookEffect {
                plan_execution_id: request.plan_execution_id.clone(),
                node_execution_id: request.node_execution_id.clone(),
                interrupt_type: request.interrupt_type,
                timestamp: now_utc(),
            })
            .await;
        Ok(())
    }

    /// Fetches the node a node-scoped interrupt targets.
    async fn node_target(&self, request: &InterruptRequest) -> EngineResult<NodeExecution> {
        let node_execution_id = request.node_execution_id.as_deref().ok_or_else(|| {
            EngineError::configuration(format!(
                "interrupt '{}' requires a node target",
                request.interrupt_type
            ))
        })?;
        self.store.fetch_node_execution(node_execution_id).await
    }

    /// Records an accepted interrupt on its target.
    async fn record_effect(
        &self,
        mut node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<NodeExecution> {
        node.interrupt_effects.push(effect);
        self.store.update_node_execution(node).await
    }

    fn require_transition(&self, node: &NodeExecution, to: NodeStatus) -> EngineResult<()> {
        if node.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(EngineError::IllegalTransition {
                node_execution_id: node.id.clone(),
                from: node.status,
                to,
            })
        }
    }

    async fn pause_queued_nodes(&self, plan_execution_id: &str) -> EngineResult<()> {
        let nodes = self.store.fetch_nodes_for_plan(plan_execution_id).await?;
        for node in nodes {
            if node.status != NodeStatus::Queued {
                continue;
            }
            match self.transition(node, NodeStatus::Paused).await {
                Ok(_) => {}
                Err(e) if lost_race(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn requeue_paused_nodes(&self, plan_execution_id: &str) -> EngineResult<()> {
        let nodes = self.store.fetch_nodes_for_plan(plan_execution_id).await?;
        for node in nodes {
            if node.status != NodeStatus::Paused {
                continue;
            }
            match self.transition(node, NodeStatus::Queued).await {
                Ok(node) => self.dispatch(EngineMessage::RunQueued {
                    node_execution_id: node.id,
                }),
                Err(e) if lost_race(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // --------------------------------------------------------- plan endings

    /// Ends the plan: persists the terminal status, errors standing
    /// barriers, aborts leftover nodes and wakes plan waiters. Idempotent
    /// against concurrent endings.
    async fn end_plan(&self, plan_execution_id: &str, status: PlanStatus) -> EngineResult<()> {
        let execution = self.store.fetch_plan_execution(plan_execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        let updated = self.set_plan_status(plan_execution_id, status).await?;
        if updated.status != status {
            return Ok(());
        }
        info!(plan_execution_id, status = %status, "plan ended");

        if let Err(e) = self
            .services
            .barriers
            .error_barriers_for_plan(plan_execution_id)
            .await
        {
            warn!(plan_execution_id, error = %e, "barrier teardown failed");
        }

        let nodes = match self.store.fetch_nodes_for_plan(plan_execution_id).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(plan_execution_id, error = %e, "leftover sweep could not list nodes");
                Vec::new()
            }
        };
        for node in nodes {
            if node.status.is_terminal() {
                continue;
            }
            if node.parent_id.is_none() {
                self.abort_subtree(node.id.clone()).await;
            }
        }

        self.watches.remove(plan_execution_id);
        Ok(())
    }

    /// Moves the plan to `status` under the version check, retrying lost
    /// races. Returns the stored record, which keeps its old status when the
    /// plan already ended.
    async fn set_plan_status(
        &self,
        plan_execution_id: &str,
        status: PlanStatus,
    ) -> EngineResult<PlanExecution> {
        loop {
            let mut execution = self.store.fetch_plan_execution(plan_execution_id).await?;
            if execution.status == status || execution.status.is_terminal() {
                return Ok(execution);
            }
            execution.status = status;
            if status.is_terminal() {
                execution.ended_at = Some(now_utc());
            }
            match self.store.update_plan_execution(execution).await {
                Ok(updated) => {
                    if let Some(watch) = self.watches.get(plan_execution_id) {
                        let _ = watch.send(status);
                    }
                    self.sink
                        .emit(OrchestrationEvent::PlanStatusUpdate {
                            plan_execution_id: plan_execution_id.to_string(),
                            to_status: status,
                            timestamp: now_utc(),
                        })
                        .await;
                    return Ok(updated);
                }
                Err(EngineError::VersionConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }

    // -------------------------------------------------------------- plumbing

    /// Persists a status transition and emits the update event.
    async fn transition(
        &self,
        mut node: NodeExecution,
        to: NodeStatus,
    ) -> EngineResult<NodeExecution> {
        let from = node.status;
        node.status = to;
        let node = self.store.update_node_execution(node).await?;
        debug!(node_execution_id = %node.id, %from, %to, "node transitioned");
        self.sink
            .emit(OrchestrationEvent::NodeStatusUpdate {
                plan_execution_id: node.plan_execution_id().to_string(),
                node_execution_id: node.id.clone(),
                setup_id: node.setup_id.clone(),
                from_status: from,
                to_status: to,
                timestamp: now_utc(),
            })
            .await;
        Ok(node)
    }

    /// Ends the plan over a fatal configuration error, concluding the node
    /// without advising first.
    async fn fail_plan_for(&self, node: NodeExecution, error: EngineError) -> EngineResult<()> {
        error!(
            node_execution_id = %node.id,
            error = %error,
            "fatal configuration error"
        );
        let plan_execution_id = node.plan_execution_id().to_string();
        let failure = error.to_failure_info();
        let _ = self
            .conclude_node(node, NodeStatus::Errored, Some(failure), false)
            .await;
        self.end_plan(&plan_execution_id, PlanStatus::Errored).await
    }

    async fn link_next(&self, previous_id: &str, next_id: &str) -> EngineResult<()> {
        let mut previous = self.store.fetch_node_execution(previous_id).await?;
        previous.next_id = Some(next_id.to_string());
        self.store.update_node_execution(previous).await?;
        Ok(())
    }

    /// Delivers the notifies a step queued during execute or resume.
    async fn deliver_notifies(&self, ctx: &StepContext) {
        for (correlation_id, payload) in ctx.take_notifies() {
            match self.notify(&correlation_id, payload).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%correlation_id, "queued notify found no pending wait");
                }
                Err(e) => warn!(%correlation_id, error = %e, "queued notify failed"),
            }
        }
    }
}
