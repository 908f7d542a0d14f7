//! Interrupt types and the effects they leave on node executions.
//!
//! Interrupts are externally injected and always take precedence over
//! whatever an adviser would have decided for the same transition.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::{now_utc, Timestamp};

/// The kind of an externally registered interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    /// Abort one node and everything beneath it.
    Abort,
    /// Abort every active node of a plan execution.
    AbortAll,
    /// Pause one queued node.
    Pause,
    /// Pause the plan: queued nodes park until resumed.
    PauseAll,
    /// Resume one paused node.
    Resume,
    /// Resume a paused plan.
    ResumeAll,
    /// Manually retry a broken or intervention-waiting node.
    Retry,
    /// Expire a node as if its timeout had fired.
    MarkExpired,
    /// Resolve an intervention wait as failed.
    MarkFailed,
    /// Resolve an intervention wait as succeeded.
    MarkSuccess,
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::AbortAll => "abort_all",
            Self::Pause => "pause",
            Self::PauseAll => "pause_all",
            Self::Resume => "resume",
            Self::ResumeAll => "resume_all",
            Self::Retry => "retry",
            Self::MarkExpired => "mark_expired",
            Self::MarkFailed => "mark_failed",
            Self::MarkSuccess => "mark_success",
        };
        write!(f, "{s}")
    }
}

/// The action applied when an intervention wait times out, or when an
/// operator resolves it by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    /// Abort the node.
    Abort,
    /// Close the node as failed and let its remaining advisers react.
    MarkFailed,
    /// Close the node as succeeded.
    MarkSuccess,
    /// Close the node as failed but propagate success to the parent.
    Ignore,
    /// Spawn a fresh retry of the node.
    Retry,
}

/// Record of an interrupt landing on a node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEffect {
    /// Id of the interrupt that landed.
    pub interrupt_id: String,
    /// What kind of interrupt it was.
    pub interrupt_type: InterruptType,
    /// When it took effect on this node.
    pub took_effect_at: Timestamp,
    /// Operator-supplied reason, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl InterruptEffect {
    /// Creates an effect record stamped with the current time.
    #[must_use]
    pub fn new(
        interrupt_id: impl Into<String>,
        interrupt_type: InterruptType,
        reason: Option<String>,
    ) -> Self {
        Self {
            interrupt_id: interrupt_id.into(),
            interrupt_type,
            took_effect_at: now_utc(),
            reason,
        }
    }

    /// True for effects that force the node toward an aborted/expired end.
    #[must_use]
    pub fn is_discontinuing(&self) -> bool {
        matches!(
            self.interrupt_type,
            InterruptType::Abort | InterruptType::AbortAll | InterruptType::MarkExpired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interrupt_type_display() {
        assert_eq!(InterruptType::Abort.to_string(), "abort");
        assert_eq!(InterruptType::MarkExpired.to_string(), "mark_expired");
    }

    #[test]
    fn test_effect_discontinuing() {
        let abort = InterruptEffect::new("i-1", InterruptType::Abort, None);
        assert!(abort.is_discontinuing());

        let pause = InterruptEffect::new("i-2", InterruptType::Pause, None);
        assert!(!pause.is_discontinuing());
    }

    #[test]
    fn test_effect_serde_skips_empty_reason() {
        let effect = InterruptEffect::new("i-3", InterruptType::Retry, None);
        let json = serde_json::to_string(&effect).unwrap();
        assert!(!json.contains("reason"));

        let with_reason =
            InterruptEffect::new("i-4", InterruptType::Abort, Some("operator".into()));
        let json = serde_json::to_string(&with_reason).unwrap();
        assert!(json.contains("operator"));
    }
}
