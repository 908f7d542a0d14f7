//! Notify/wait correlator for out-of-process completion signaling.
//!
//! A node that suspends for external work first persists a [`WaitInstance`]
//! under a correlation id, then parks. The wait must be registered before
//! any external call that could answer it is issued; otherwise the notify
//! can race the suspension and be dropped. Notifies are at-least-once:
//! resolution flips the instance exactly once, so duplicates are no-ops.

use crate::errors::EngineResult;
use crate::store::ExecutionStore;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A persisted suspension point awaiting a notify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitInstance {
    /// The id a notify must carry to resolve this wait.
    pub correlation_id: String,
    /// The node execution that will resume.
    pub node_execution_id: String,
    /// The owning plan execution.
    pub plan_execution_id: String,
    /// When the wait was registered.
    pub created_at: Timestamp,
    /// True once a notify resolved this wait.
    pub resolved: bool,
    /// The notify payload, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl WaitInstance {
    /// Creates an unresolved wait instance.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        plan_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            node_execution_id: node_execution_id.into(),
            plan_execution_id: plan_execution_id.into(),
            created_at: now_utc(),
            resolved: false,
            response: None,
        }
    }
}

/// Correlates waits with the notifies that resolve them.
#[derive(Clone)]
pub struct WaitNotifyEngine {
    store: Arc<dyn ExecutionStore>,
}

impl WaitNotifyEngine {
    /// Creates a correlator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Registers a wait for a node execution. Registering the same
    /// correlation id again for the same node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a correlation conflict when the id is already held by a
    /// different node execution.
    pub async fn register_wait(
        &self,
        correlation_id: &str,
        node_execution_id: &str,
        plan_execution_id: &str,
    ) -> EngineResult<()> {
        self.store
            .save_wait_instance(WaitInstance::new(
                correlation_id,
                node_execution_id,
                plan_execution_id,
            ))
            .await
    }

    /// Resolves the wait registered under `correlation_id` with the payload.
    ///
    /// Returns the resolved instance the first time; `None` when the id is
    /// unknown or already resolved, which callers treat as a duplicate
    /// delivery and drop.
    pub async fn notify(
        &self,
        correlation_id: &str,
        payload: Value,
    ) -> EngineResult<Option<WaitInstance>> {
        let resolved = self
            .store
            .resolve_wait_instance(correlation_id, payload)
            .await?;
        if resolved.is_none() {
            tracing::debug!(
                correlation_id = %correlation_id,
                "Ignoring notify with no pending wait"
            );
        }
        Ok(resolved)
    }

    /// Returns the unresolved wait under `correlation_id`, if any.
    pub async fn pending(&self, correlation_id: &str) -> EngineResult<Option<WaitInstance>> {
        self.store.pending_wait(correlation_id).await
    }
}
