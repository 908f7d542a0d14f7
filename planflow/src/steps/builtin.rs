//! Built-in orchestration steps.
//!
//! These cover the structural step types every plan needs: grouping
//! (section), fan-out (fork), rendezvous (barrier) and admission control
//! (restraint). Domain steps register alongside them under their own types.

use super::{Step, StepContext, StepResponse};
use crate::core::FailureInfo;
use crate::errors::{EngineError, EngineResult};
use crate::restraint::{barrier_correlation_id, BarrierState, HoldingScope, RestraintState};
use crate::utils::generate_id;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

fn parse_params<T>(step_type: &str, inputs: &Value) -> EngineResult<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(inputs.clone()).map_err(|e| {
        EngineError::configuration(format!("invalid parameters for step '{step_type}': {e}"))
    })
}

/// Succeeds without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStep;

#[async_trait]
impl Step for NoOpStep {
    fn step_type(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        Ok(StepResponse::succeeded())
    }
}

#[derive(Debug, Deserialize)]
struct SectionParams {
    child_node_id: String,
}

/// Runs one configured plan node as a child and inherits its conclusion.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionStep;

#[async_trait]
impl Step for SectionStep {
    fn step_type(&self) -> &str {
        "section"
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let params: SectionParams = parse_params(self.step_type(), ctx.inputs())?;
        Ok(StepResponse::child(params.child_node_id))
    }
}

#[derive(Debug, Deserialize)]
struct ForkParams {
    parallel_node_ids: Vec<String>,
}

/// Fans out into the configured plan nodes in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkStep;

#[async_trait]
impl Step for ForkStep {
    fn step_type(&self) -> &str {
        "fork"
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let params: ForkParams = parse_params(self.step_type(), ctx.inputs())?;
        if params.parallel_node_ids.is_empty() {
            return Err(EngineError::configuration(
                "fork step configured with no parallel nodes",
            ));
        }
        Ok(StepResponse::children(params.parallel_node_ids))
    }
}

#[derive(Debug, Deserialize)]
struct BarrierParams {
    identifier: String,
}

/// Arrives at a rendezvous barrier and waits for the remaining participants.
///
/// The wait is registered before the arrival is recorded, so the closing
/// arrival always finds every parked participant. The participant whose
/// arrival brings the barrier down succeeds inline and queues the release
/// notifies for its peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BarrierStep;

#[async_trait]
impl Step for BarrierStep {
    fn step_type(&self) -> &str {
        "barrier"
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let params: BarrierParams = parse_params(self.step_type(), ctx.inputs())?;
        let plan_execution_id = &ctx.ambiance().plan_execution_id;
        let instance = ctx
            .barriers()
            .barrier_info(&params.identifier, plan_execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "barrier '{}' is not registered for this plan",
                    params.identifier
                ))
            })?;

        let node_execution_id = ctx.node_execution_id()?.to_string();
        let correlation_id = barrier_correlation_id(&instance.id, &node_execution_id);
        ctx.register_wait(&correlation_id).await?;

        let arrival = ctx
            .barriers()
            .drop_arrival(
                &params.identifier,
                plan_execution_id,
                ctx.ambiance().current_setup_id()?,
                &node_execution_id,
            )
            .await?;

        match arrival.state {
            BarrierState::Down => {
                let payload = json!({
                    "barrier": "down",
                    "barrier_identifier": params.identifier,
                });
                for released in arrival.released {
                    ctx.enqueue_notify(released, payload.clone());
                }
                Ok(StepResponse::succeeded())
            }
            BarrierState::Standing => Ok(StepResponse::suspend(correlation_id)),
            BarrierState::Errored => Ok(StepResponse::failed(FailureInfo::application(format!(
                "barrier '{}' errored before all participants arrived",
                params.identifier
            )))),
        }
    }

    async fn handle_resume(
        &self,
        _ctx: &StepContext,
        payload: Value,
    ) -> EngineResult<StepResponse> {
        match payload.get("barrier").and_then(Value::as_str) {
            Some("down") => Ok(StepResponse::succeeded()),
            Some("errored") => Ok(StepResponse::failed(FailureInfo::application(
                "barrier errored before all participants arrived",
            ))),
            _ => Err(EngineError::execution(FailureInfo::application(format!(
                "barrier step cannot interpret resume payload: {payload}"
            )))),
        }
    }
}

fn default_capacity() -> u32 {
    1
}

fn default_holding_scope() -> HoldingScope {
    HoldingScope::Stage
}

#[derive(Debug, Deserialize)]
struct RestraintParams {
    resource_unit: String,
    #[serde(default = "default_holding_scope")]
    holding_scope: HoldingScope,
    #[serde(default = "default_capacity")]
    capacity: u32,
}

/// Acquires a slot on a named resource unit before the plan proceeds.
///
/// Succeeds inline when a slot is free; otherwise parks the node in the
/// unit's FIFO queue until a release promotes it. The hold lives until the
/// configured holding scope concludes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestraintStep;

#[async_trait]
impl Step for RestraintStep {
    fn step_type(&self) -> &str {
        "restraint"
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let params: RestraintParams = parse_params(self.step_type(), ctx.inputs())?;

        // The instance id doubles as the wait correlation id; register the
        // wait first so a promotion racing the acquisition is never dropped.
        let instance_id = generate_id();
        ctx.register_wait(&instance_id).await?;

        let instance = ctx
            .restraints()
            .acquire(
                ctx.ambiance(),
                &params.resource_unit,
                params.holding_scope,
                params.capacity,
                Some(instance_id.clone()),
            )
            .await?;

        match instance.state {
            RestraintState::Active => Ok(StepResponse::succeeded()),
            RestraintState::Blocked => Ok(StepResponse::resource_wait(instance_id)),
            RestraintState::Finished => Ok(StepResponse::failed(FailureInfo::application(
                format!(
                    "restraint instance for '{}' finished before activation",
                    params.resource_unit
                ),
            ))),
        }
    }

    async fn handle_resume(
        &self,
        _ctx: &StepContext,
        payload: Value,
    ) -> EngineResult<StepResponse> {
        match payload.get("restraint").and_then(Value::as_str) {
            Some("promoted") => Ok(StepResponse::succeeded()),
            _ => Err(EngineError::execution(FailureInfo::application(format!(
                "restraint step cannot interpret resume payload: {payload}"
            )))),
        }
    }
}
