//! In-memory execution store backed by concurrent maps.

use super::ExecutionStore;
use crate::core::RefInstance;
use crate::engine::{NodeExecution, PlanExecution};
use crate::errors::{EngineError, EngineResult};
use crate::restraint::{BarrierExecutionInstance, RestraintInstance, RestraintState};
use crate::waiter::WaitInstance;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// A process-local [`ExecutionStore`].
///
/// Per-key entry locks make single-record operations atomic; cross-record
/// ordering is the caller's concern, exactly as with a database-backed
/// store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    plans: DashMap<String, PlanExecution>,
    nodes: DashMap<String, NodeExecution>,
    waits: DashMap<String, WaitInstance>,
    restraints: DashMap<String, RestraintInstance>,
    restraint_orders: DashMap<String, u64>,
    restraint_capacities: DashMap<String, u32>,
    barriers: DashMap<(String, String), BarrierExecutionInstance>,
    refs: DashMap<String, Vec<RefInstance>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn save_plan_execution(&self, execution: PlanExecution) -> EngineResult<()> {
        if self.plans.contains_key(&execution.id) {
            return Err(EngineError::duplicate_registration(
                "plan_execution",
                execution.id,
            ));
        }
        self.plans.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn fetch_plan_execution(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<PlanExecution> {
        self.plans
            .get(plan_execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::not_found("plan_execution", plan_execution_id))
    }

    async fn update_plan_execution(
        &self,
        execution: PlanExecution,
    ) -> EngineResult<PlanExecution> {
        let mut entry = self
            .plans
            .get_mut(&execution.id)
            .ok_or_else(|| EngineError::not_found("plan_execution", &execution.id))?;
        if entry.version != execution.version {
            return Err(EngineError::VersionConflict {
                entity: "plan_execution",
                id: execution.id.clone(),
                expected: execution.version,
                found: entry.version,
            });
        }
        if entry.status.is_terminal() && execution.status != entry.status {
            return Err(EngineError::configuration(format!(
                "plan execution '{}' already ended as {}",
                execution.id, entry.status
            )));
        }
        let mut updated = execution;
        updated.version += 1;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn insert_node_execution(&self, node: NodeExecution) -> EngineResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(EngineError::duplicate_registration("node_execution", node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn update_node_execution(&self, node: NodeExecution) -> EngineResult<NodeExecution> {
        let mut entry = self
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| EngineError::not_found("node_execution", &node.id))?;
        if entry.version != node.version {
            return Err(EngineError::VersionConflict {
                entity: "node_execution",
                id: node.id.clone(),
                expected: node.version,
                found: entry.version,
            });
        }
        if entry.status != node.status && !entry.status.can_transition_to(node.status) {
            return Err(EngineError::IllegalTransition {
                node_execution_id: node.id.clone(),
                from: entry.status,
                to: node.status,
            });
        }
        let mut updated = node;
        updated.version += 1;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn fetch_node_execution(
        &self,
        node_execution_id: &str,
    ) -> EngineResult<NodeExecution> {
        self.nodes
            .get(node_execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::not_found("node_execution", node_execution_id))
    }

    async fn fetch_children(&self, parent_id: &str) -> EngineResult<Vec<NodeExecution>> {
        let mut children: Vec<NodeExecution> = self
            .nodes
            .iter()
            .filter(|e| e.parent_id.as_deref() == Some(parent_id))
            .map(|e| e.clone())
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(children)
    }

    async fn fetch_nodes_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<NodeExecution>> {
        let mut nodes: Vec<NodeExecution> = self
            .nodes
            .iter()
            .filter(|e| e.plan_execution_id() == plan_execution_id)
            .map(|e| e.clone())
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn save_wait_instance(&self, wait: WaitInstance) -> EngineResult<()> {
        if let Some(existing) = self.waits.get(&wait.correlation_id) {
            if existing.node_execution_id == wait.node_execution_id {
                return Ok(());
            }
            return Err(EngineError::CorrelationConflict {
                correlation_id: wait.correlation_id.clone(),
                node_execution_id: existing.node_execution_id.clone(),
            });
        }
        self.waits.insert(wait.correlation_id.clone(), wait);
        Ok(())
    }

    async fn resolve_wait_instance(
        &self,
        correlation_id: &str,
        response: Value,
    ) -> EngineResult<Option<WaitInstance>> {
        let Some(mut entry) = self.waits.get_mut(correlation_id) else {
            return Ok(None);
        };
        if entry.resolved {
            return Ok(None);
        }
        entry.resolved = true;
        entry.response = Some(response);
        Ok(Some(entry.clone()))
    }

    async fn pending_wait(&self, correlation_id: &str) -> EngineResult<Option<WaitInstance>> {
        Ok(self
            .waits
            .get(correlation_id)
            .filter(|w| !w.resolved)
            .map(|w| w.clone()))
    }

    async fn delete_waits_for_node(&self, node_execution_id: &str) -> EngineResult<()> {
        self.waits
            .retain(|_, w| w.node_execution_id != node_execution_id);
        Ok(())
    }

    async fn insert_restraint_instance(&self, instance: RestraintInstance) -> EngineResult<()> {
        if self.restraints.contains_key(&instance.id) {
            return Err(EngineError::duplicate_registration(
                "restraint_instance",
                instance.id,
            ));
        }
        self.restraints.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn update_restraint_instance(&self, instance: RestraintInstance) -> EngineResult<()> {
        let mut entry = self
            .restraints
            .get_mut(&instance.id)
            .ok_or_else(|| EngineError::not_found("restraint_instance", &instance.id))?;
        *entry = instance;
        Ok(())
    }

    async fn fetch_restraint_instance(
        &self,
        instance_id: &str,
    ) -> EngineResult<RestraintInstance> {
        self.restraints
            .get(instance_id)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::not_found("restraint_instance", instance_id))
    }

    async fn fetch_restraints_for_unit(
        &self,
        resource_unit: &str,
    ) -> EngineResult<Vec<RestraintInstance>> {
        let mut instances: Vec<RestraintInstance> = self
            .restraints
            .iter()
            .filter(|e| e.resource_unit == resource_unit)
            .map(|e| e.clone())
            .collect();
        instances.sort_by_key(|i| i.order);
        Ok(instances)
    }

    async fn fetch_restraints_for_scope(
        &self,
        scope_runtime_id: &str,
    ) -> EngineResult<Vec<RestraintInstance>> {
        let mut instances: Vec<RestraintInstance> = self
            .restraints
            .iter()
            .filter(|e| {
                e.scope_runtime_id == scope_runtime_id && e.state != RestraintState::Finished
            })
            .map(|e| e.clone())
            .collect();
        instances.sort_by_key(|i| i.order);
        Ok(instances)
    }

    async fn next_restraint_order(&self, resource_unit: &str) -> EngineResult<u64> {
        let mut counter = self
            .restraint_orders
            .entry(resource_unit.to_string())
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn init_restraint_capacity(
        &self,
        resource_unit: &str,
        capacity: u32,
    ) -> EngineResult<u32> {
        let effective = self
            .restraint_capacities
            .entry(resource_unit.to_string())
            .or_insert(capacity);
        Ok(*effective)
    }

    async fn restraint_capacity(&self, resource_unit: &str) -> EngineResult<u32> {
        Ok(self
            .restraint_capacities
            .get(resource_unit)
            .map_or(1, |c| *c))
    }

    async fn save_barrier_instance(
        &self,
        instance: BarrierExecutionInstance,
    ) -> EngineResult<()> {
        let key = (
            instance.plan_execution_id.clone(),
            instance.barrier_identifier.clone(),
        );
        if self.barriers.contains_key(&key) {
            return Err(EngineError::duplicate_registration(
                "barrier_instance",
                instance.barrier_identifier,
            ));
        }
        self.barriers.insert(key, instance);
        Ok(())
    }

    async fn update_barrier_instance(
        &self,
        instance: BarrierExecutionInstance,
    ) -> EngineResult<BarrierExecutionInstance> {
        let key = (
            instance.plan_execution_id.clone(),
            instance.barrier_identifier.clone(),
        );
        let mut entry = self
            .barriers
            .get_mut(&key)
            .ok_or_else(|| EngineError::not_found("barrier_instance", &instance.barrier_identifier))?;
        if entry.version != instance.version {
            return Err(EngineError::VersionConflict {
                entity: "barrier_instance",
                id: instance.barrier_identifier.clone(),
                expected: instance.version,
                found: entry.version,
            });
        }
        let mut updated = instance;
        updated.version += 1;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn fetch_barrier_instance(
        &self,
        barrier_identifier: &str,
        plan_execution_id: &str,
    ) -> EngineResult<Option<BarrierExecutionInstance>> {
        let key = (plan_execution_id.to_string(), barrier_identifier.to_string());
        Ok(self.barriers.get(&key).map(|e| e.clone()))
    }

    async fn fetch_barriers_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<BarrierExecutionInstance>> {
        let mut instances: Vec<BarrierExecutionInstance> = self
            .barriers
            .iter()
            .filter(|e| e.plan_execution_id == plan_execution_id)
            .map(|e| e.clone())
            .collect();
        instances.sort_by(|a, b| a.barrier_identifier.cmp(&b.barrier_identifier));
        Ok(instances)
    }

    async fn save_ref_instance(&self, instance: RefInstance) -> EngineResult<()> {
        self.refs
            .entry(instance.plan_execution_id.clone())
            .or_default()
            .push(instance);
        Ok(())
    }

    async fn fetch_ref_instances(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<RefInstance>> {
        Ok(self
            .refs
            .get(plan_execution_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }
}
