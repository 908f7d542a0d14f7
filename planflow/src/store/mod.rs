//! Persistence boundary for execution state.
//!
//! The engine owns no state of its own: every record it reads or writes goes
//! through [`ExecutionStore`]. The store is also where per-record invariants
//! are enforced: optimistic version checks on update and the node status
//! transition table. [`InMemoryStore`] is the bundled implementation;
//! database-backed stores implement the same trait.

mod memory;

pub use memory::InMemoryStore;

use crate::core::RefInstance;
use crate::engine::{NodeExecution, PlanExecution};
use crate::errors::EngineResult;
use crate::restraint::{BarrierExecutionInstance, RestraintInstance};
use crate::waiter::WaitInstance;
use async_trait::async_trait;
use serde_json::Value;

/// Persistence operations the engine depends on.
///
/// Update methods take the record at the version the caller fetched it and
/// return the stored copy with the bumped version. A mismatched version is a
/// [`crate::errors::EngineError::VersionConflict`]; a node status change the
/// transition table forbids is a
/// [`crate::errors::EngineError::IllegalTransition`].
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persists a new plan execution.
    async fn save_plan_execution(&self, execution: PlanExecution) -> EngineResult<()>;

    /// Fetches a plan execution by id.
    async fn fetch_plan_execution(&self, plan_execution_id: &str)
        -> EngineResult<PlanExecution>;

    /// Updates a plan execution under a version check. A terminal plan only
    /// accepts updates that keep its status.
    async fn update_plan_execution(
        &self,
        execution: PlanExecution,
    ) -> EngineResult<PlanExecution>;

    /// Persists a new node execution.
    async fn insert_node_execution(&self, node: NodeExecution) -> EngineResult<()>;

    /// Updates a node execution under a version check and the status
    /// transition table.
    async fn update_node_execution(&self, node: NodeExecution) -> EngineResult<NodeExecution>;

    /// Fetches a node execution by id.
    async fn fetch_node_execution(&self, node_execution_id: &str)
        -> EngineResult<NodeExecution>;

    /// Fetches the direct children of a node execution, oldest first.
    async fn fetch_children(&self, parent_id: &str) -> EngineResult<Vec<NodeExecution>>;

    /// Fetches every node execution of a plan, oldest first.
    async fn fetch_nodes_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<NodeExecution>>;

    /// Persists a wait instance. Saving the same correlation id again for the
    /// same node is a no-op; for a different node it is a
    /// [`crate::errors::EngineError::CorrelationConflict`].
    async fn save_wait_instance(&self, wait: WaitInstance) -> EngineResult<()>;

    /// Atomically resolves the wait registered under `correlation_id`.
    /// Returns the instance the first time only; `None` when the id is
    /// unknown or already resolved.
    async fn resolve_wait_instance(
        &self,
        correlation_id: &str,
        response: Value,
    ) -> EngineResult<Option<WaitInstance>>;

    /// Returns the unresolved wait registered under `correlation_id`, if any.
    async fn pending_wait(&self, correlation_id: &str) -> EngineResult<Option<WaitInstance>>;

    /// Removes every wait instance owned by a node execution.
    async fn delete_waits_for_node(&self, node_execution_id: &str) -> EngineResult<()>;

    /// Persists a new restraint instance.
    async fn insert_restraint_instance(&self, instance: RestraintInstance) -> EngineResult<()>;

    /// Overwrites a restraint instance. Callers serialize updates per
    /// resource unit.
    async fn update_restraint_instance(&self, instance: RestraintInstance) -> EngineResult<()>;

    /// Fetches a restraint instance by id.
    async fn fetch_restraint_instance(
        &self,
        instance_id: &str,
    ) -> EngineResult<RestraintInstance>;

    /// Fetches every instance of a resource unit, ordered by acquisition
    /// order.
    async fn fetch_restraints_for_unit(
        &self,
        resource_unit: &str,
    ) -> EngineResult<Vec<RestraintInstance>>;

    /// Fetches every unfinished instance held at the given scope.
    async fn fetch_restraints_for_scope(
        &self,
        scope_runtime_id: &str,
    ) -> EngineResult<Vec<RestraintInstance>>;

    /// Returns the next monotonic order value for a resource unit.
    async fn next_restraint_order(&self, resource_unit: &str) -> EngineResult<u64>;

    /// Fixes the capacity of a resource unit if not already set, returning
    /// the effective capacity. The first acquisition wins; later values are
    /// ignored.
    async fn init_restraint_capacity(
        &self,
        resource_unit: &str,
        capacity: u32,
    ) -> EngineResult<u32>;

    /// Returns the capacity of a resource unit, defaulting to 1.
    async fn restraint_capacity(&self, resource_unit: &str) -> EngineResult<u32>;

    /// Persists a new barrier execution instance.
    async fn save_barrier_instance(
        &self,
        instance: BarrierExecutionInstance,
    ) -> EngineResult<()>;

    /// Updates a barrier execution instance under a version check.
    async fn update_barrier_instance(
        &self,
        instance: BarrierExecutionInstance,
    ) -> EngineResult<BarrierExecutionInstance>;

    /// Fetches the barrier instance for an identifier within a plan.
    async fn fetch_barrier_instance(
        &self,
        barrier_identifier: &str,
        plan_execution_id: &str,
    ) -> EngineResult<Option<BarrierExecutionInstance>>;

    /// Fetches every barrier instance of a plan.
    async fn fetch_barriers_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<BarrierExecutionInstance>>;

    /// Persists a reference instance.
    async fn save_ref_instance(&self, instance: RefInstance) -> EngineResult<()>;

    /// Fetches every reference instance of a plan.
    async fn fetch_ref_instances(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<RefInstance>>;
}
