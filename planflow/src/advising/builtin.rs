//! Built-in advisers.

use super::{Advise, AdviseEvent, Adviser};
use crate::core::{FailureType, InterventionAction, NodeStatus};
use crate::errors::{EngineError, EngineResult};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One day, the default window for a pending manual intervention.
const DEFAULT_INTERVENTION_TIMEOUT_MS: u64 = 86_400_000;

fn parse_required<T>(adviser_type: &str, parameters: &Value) -> EngineResult<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(parameters.clone()).map_err(|e| {
        EngineError::configuration(format!(
            "invalid parameters for adviser '{adviser_type}': {e}"
        ))
    })
}

fn parse_defaulted<T>(adviser_type: &str, parameters: &Value) -> EngineResult<T>
where
    T: DeserializeOwned + Default,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    parse_required(adviser_type, parameters)
}

fn try_parse<T>(adviser_type: &str, parameters: &Value) -> Option<T>
where
    T: DeserializeOwned,
{
    match serde_json::from_value(parameters.clone()) {
        Ok(params) => Some(params),
        Err(e) => {
            tracing::warn!(
                adviser_type = %adviser_type,
                error = %e,
                "Adviser not applicable: unparseable parameters"
            );
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct NextNodeParams {
    next_node_id: String,
    #[serde(default)]
    applicable_failure_types: Vec<FailureType>,
}

/// Advances to a configured node when the concluded one broke.
///
/// An empty `applicable_failure_types` filter matches every failure;
/// otherwise the failure's types must intersect the filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn adviser_type(&self) -> &str {
        "on_fail"
    }

    fn can_advise(&self, event: &AdviseEvent) -> bool {
        if !event.to_status.is_broken() {
            return false;
        }
        let Some(params) = try_parse::<NextNodeParams>(self.adviser_type(), &event.parameters)
        else {
            return false;
        };
        params.applicable_failure_types.is_empty()
            || event
                .failure_info
                .as_ref()
                .is_some_and(|f| f.intersects(&params.applicable_failure_types))
    }

    fn on_advise_event(&self, event: &AdviseEvent) -> EngineResult<Option<Advise>> {
        let params: NextNodeParams = parse_required(self.adviser_type(), &event.parameters)?;
        Ok(Some(Advise::NextStep {
            next_node_id: params.next_node_id,
        }))
    }
}

/// Advances to a configured node when the concluded one ended positively.
///
/// The mechanism by which sibling chains advance; applies to skipped nodes
/// too, so a skip never stalls the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn adviser_type(&self) -> &str {
        "on_success"
    }

    fn can_advise(&self, event: &AdviseEvent) -> bool {
        event.to_status.is_positive()
            && try_parse::<NextNodeParams>(self.adviser_type(), &event.parameters).is_some()
    }

    fn on_advise_event(&self, event: &AdviseEvent) -> EngineResult<Option<Advise>> {
        let params: NextNodeParams = parse_required(self.adviser_type(), &event.parameters)?;
        Ok(Some(Advise::NextStep {
            next_node_id: params.next_node_id,
        }))
    }
}

/// Ends the plan when a node was aborted.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnAbortAdviser;

impl Adviser for OnAbortAdviser {
    fn adviser_type(&self) -> &str {
        "on_abort"
    }

    fn can_advise(&self, event: &AdviseEvent) -> bool {
        event.to_status == NodeStatus::Aborted
    }

    fn on_advise_event(&self, _event: &AdviseEvent) -> EngineResult<Option<Advise>> {
        Ok(Some(Advise::EndPlan))
    }
}

/// What the retry adviser does once its wait intervals are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PostRetryAction {
    /// End the plan with the node's status.
    #[default]
    EndPlan,
    /// Fall back to plain status propagation.
    Ignore,
    /// Park the node for a manual decision.
    ManualIntervention {
        /// How long to wait for the decision.
        timeout_ms: u64,
        /// What to apply when the deadline passes.
        #[serde(default = "default_on_timeout")]
        on_timeout: InterventionAction,
    },
}

fn default_on_timeout() -> InterventionAction {
    InterventionAction::Abort
}

#[derive(Debug, Deserialize)]
struct RetryParams {
    wait_intervals_ms: Vec<u64>,
    #[serde(default)]
    jitter: bool,
    #[serde(default)]
    post_retry: PostRetryAction,
}

/// Re-runs a broken node, consuming one configured wait interval per
/// attempt; once exhausted, applies the post-retry action.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> &str {
        "retry"
    }

    fn can_advise(&self, event: &AdviseEvent) -> bool {
        if !event.to_status.is_broken() {
            return false;
        }
        let Some(params) = try_parse::<RetryParams>(self.adviser_type(), &event.parameters)
        else {
            return false;
        };
        // One extra applicable attempt so the post-retry action gets a turn.
        !params.wait_intervals_ms.is_empty()
            && (event.retry_count as usize) <= params.wait_intervals_ms.len()
    }

    fn on_advise_event(&self, event: &AdviseEvent) -> EngineResult<Option<Advise>> {
        let params: RetryParams = parse_required(self.adviser_type(), &event.parameters)?;
        let attempt = event.retry_count as usize;

        if let Some(&base_ms) = params.wait_intervals_ms.get(attempt) {
            let jitter_ms = if params.jitter && base_ms > 0 {
                rand::thread_rng().gen_range(0..=base_ms / 4)
            } else {
                0
            };
            return Ok(Some(Advise::Retry {
                wait: Duration::from_millis(base_ms + jitter_ms),
            }));
        }

        match params.post_retry {
            PostRetryAction::EndPlan => Ok(Some(Advise::EndPlan)),
            PostRetryAction::Ignore => Ok(None),
            PostRetryAction::ManualIntervention {
                timeout_ms,
                on_timeout,
            } => Ok(Some(Advise::InterventionWait {
                timeout: Duration::from_millis(timeout_ms),
                on_timeout,
            })),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ManualInterventionParams {
    timeout_ms: u64,
    on_timeout: InterventionAction,
}

impl Default for ManualInterventionParams {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_INTERVENTION_TIMEOUT_MS,
            on_timeout: InterventionAction::Abort,
        }
    }
}

/// Parks a broken node awaiting a human decision.
///
/// Not applicable when the node is concluding out of InterventionWaiting,
/// so a decision never re-parks the node it resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn adviser_type(&self) -> &str {
        "manual_intervention"
    }

    fn can_advise(&self, event: &AdviseEvent) -> bool {
        event.to_status.is_broken() && event.from_status != NodeStatus::InterventionWaiting
    }

    fn on_advise_event(&self, event: &AdviseEvent) -> EngineResult<Option<Advise>> {
        let params: ManualInterventionParams =
            parse_defaulted(self.adviser_type(), &event.parameters)?;
        Ok(Some(Advise::InterventionWait {
            timeout: Duration::from_millis(params.timeout_ms),
            on_timeout: params.on_timeout,
        }))
    }
}
