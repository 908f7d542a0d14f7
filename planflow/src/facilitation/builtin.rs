//! One built-in facilitator per execution mode.

use super::{ExecutionMode, Facilitator, FacilitatorResponse};
use crate::ambiance::Ambiance;
use crate::errors::{EngineError, EngineResult};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModeParams {
    initial_wait_ms: u64,
    pass_through: Option<Value>,
}

fn parse_params<'de, T>(facilitator_type: &str, parameters: &'de Value) -> EngineResult<T>
where
    T: Deserialize<'de> + Default,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    T::deserialize(parameters).map_err(|e| {
        EngineError::configuration(format!(
            "invalid parameters for facilitator '{facilitator_type}': {e}"
        ))
    })
}

fn mode_response(
    facilitator_type: &str,
    mode: ExecutionMode,
    parameters: &Value,
) -> EngineResult<Option<FacilitatorResponse>> {
    let params: ModeParams = parse_params(facilitator_type, parameters)?;
    let mut response =
        FacilitatorResponse::new(mode).with_initial_wait(Duration::from_millis(params.initial_wait_ms));
    if let Some(pass_through) = params.pass_through {
        response = response.with_pass_through(pass_through);
    }
    Ok(Some(response))
}

/// Runs the node inline. The default when a node has no obtainments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncFacilitator;

impl Facilitator for SyncFacilitator {
    fn facilitator_type(&self) -> &str {
        "sync"
    }

    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        parameters: &Value,
        _node_inputs: &Value,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        mode_response(self.facilitator_type(), ExecutionMode::Sync, parameters)
    }
}

/// Suspends the node under a wait correlation id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncFacilitator;

impl Facilitator for AsyncFacilitator {
    fn facilitator_type(&self) -> &str {
        "async"
    }

    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        parameters: &Value,
        _node_inputs: &Value,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        mode_response(self.facilitator_type(), ExecutionMode::Async, parameters)
    }
}

/// Spawns one child node and waits for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildFacilitator;

impl Facilitator for ChildFacilitator {
    fn facilitator_type(&self) -> &str {
        "child"
    }

    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        parameters: &Value,
        _node_inputs: &Value,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        mode_response(self.facilitator_type(), ExecutionMode::Child, parameters)
    }
}

/// Fans the node out into parallel children.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildrenFacilitator;

impl Facilitator for ChildrenFacilitator {
    fn facilitator_type(&self) -> &str {
        "children"
    }

    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        parameters: &Value,
        _node_inputs: &Value,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        mode_response(self.facilitator_type(), ExecutionMode::Children, parameters)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SkipParams {
    skip: bool,
    reason: Option<String>,
}

impl Default for SkipParams {
    fn default() -> Self {
        Self {
            skip: true,
            reason: None,
        }
    }
}

/// Bypasses the node, recording a skip reason.
///
/// With `{"skip": false}` the facilitator declines, falling through to the
/// next configured obtainment. This is the conditional-skip idiom: put the
/// skip obtainment first and the regular mode after it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipFacilitator;

impl Facilitator for SkipFacilitator {
    fn facilitator_type(&self) -> &str {
        "skip"
    }

    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        parameters: &Value,
        _node_inputs: &Value,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        let params: SkipParams = parse_params(self.facilitator_type(), parameters)?;
        if !params.skip {
            return Ok(None);
        }
        let reason = params.reason.unwrap_or_else(|| "skipped".to_string());
        Ok(Some(
            FacilitatorResponse::skip()
                .with_pass_through(serde_json::json!({ "reason": reason })),
        ))
    }
}
