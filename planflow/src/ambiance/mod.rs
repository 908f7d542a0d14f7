//! Immutable execution context threaded through every node execution.
//!
//! An [`Ambiance`] is an ordered stack of [`Level`]s (one per nesting depth)
//! plus a flat map of setup abstractions identifying the surrounding scope
//! (account, organization, project). It is never mutated in place: entering a
//! nested execution clones it with one more level, concluding a parent from a
//! child's scope clones it with the deepest level removed.

mod level;

pub use level::{Level, StepCategory};

use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The immutable execution context for a running node.
///
/// Levels are append-only within one root execution; popping never occurs.
/// Completion is tracked by node status, not stack removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    /// The plan execution this context belongs to.
    pub plan_execution_id: String,
    /// The static plan id.
    pub plan_id: String,
    /// Scope-identifying key/value pairs (account/org/project ids).
    pub setup_abstractions: HashMap<String, String>,
    /// The level stack, root first.
    pub levels: Vec<Level>,
}

impl Ambiance {
    /// Creates a root ambiance with a single level.
    #[must_use]
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: HashMap<String, String>,
        root_level: Level,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions,
            levels: vec![root_level],
        }
    }

    /// Returns a copy with `level` appended, for entering a nested execution.
    #[must_use]
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Returns a copy with the deepest level removed, for concluding a parent
    /// from a child's scope.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when called on a root-level ambiance.
    pub fn clone_for_finish(&self) -> EngineResult<Self> {
        if self.levels.len() < 2 {
            return Err(EngineError::configuration(
                "cannot remove the root level from an ambiance",
            ));
        }
        let mut parent = self.clone();
        parent.levels.pop();
        Ok(parent)
    }

    /// Returns a copy with the deepest level replaced by `level`, for
    /// starting a sibling or a retry attempt at the same depth.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the level stack is empty.
    pub fn clone_for_sibling(&self, level: Level) -> EngineResult<Self> {
        if self.levels.is_empty() {
            return Err(EngineError::configuration("ambiance has no levels"));
        }
        let mut sibling = self.clone();
        sibling.levels.pop();
        sibling.levels.push(level);
        Ok(sibling)
    }

    /// Returns the deepest level.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the level stack is empty.
    pub fn current_level(&self) -> EngineResult<&Level> {
        self.levels
            .last()
            .ok_or_else(|| EngineError::configuration("ambiance has no levels"))
    }

    /// Returns the runtime id of the deepest level.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the level stack is empty.
    pub fn current_runtime_id(&self) -> EngineResult<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    /// Returns the setup id of the deepest level.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the level stack is empty.
    pub fn current_setup_id(&self) -> EngineResult<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    /// Returns the runtime id of the level above the deepest one, if any.
    #[must_use]
    pub fn parent_runtime_id(&self) -> Option<&str> {
        if self.levels.len() < 2 {
            return None;
        }
        self.levels
            .get(self.levels.len() - 2)
            .map(|l| l.runtime_id.as_str())
    }

    /// Returns the runtime ids of all levels joined with `/`, root first.
    ///
    /// This path is the scope key used by resolvers and restraint scope
    /// release: a consumer sees an instance when the instance's scope path is
    /// a prefix of the consumer's.
    #[must_use]
    pub fn runtime_id_path(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.runtime_id.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Returns the deepest level of the given category, if present.
    #[must_use]
    pub fn nearest_level(&self, category: StepCategory) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_category == category)
    }

    /// Looks up a setup abstraction by key.
    #[must_use]
    pub fn get_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    /// Returns the nesting depth (number of levels).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}
