//! Admission control for shared external resources.
//!
//! Two mechanisms live here. [`RestraintService`] runs FIFO queues per named
//! resource unit: at most `capacity` holders are active concurrently, and
//! promotion is strictly by acquisition order. [`BarrierService`] runs
//! rendezvous barriers: a fixed set of participants must all arrive before
//! any proceeds.
//!
//! Being blocked on a restraint or standing at a barrier is normal bounded
//! waiting, never an error. Nodes parked here hold no thread; they resume
//! through the wait/notify correlator when promoted or released.

mod barrier;

pub use barrier::{
    barrier_correlation_id, BarrierArrival, BarrierExecutionInstance, BarrierPosition,
    BarrierService, BarrierState,
};

use crate::ambiance::{Ambiance, StepCategory};
use crate::errors::{EngineError, EngineResult};
use crate::store::ExecutionStore;
use crate::utils::{generate_id, now_utc, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The lifetime boundary a restraint is held at.
///
/// The scope decides which node's conclusion releases the hold: the root
/// node for [`HoldingScope::Pipeline`], the nearest enclosing stage for
/// [`HoldingScope::Stage`], the acquiring node itself for
/// [`HoldingScope::Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingScope {
    /// Held until the whole plan execution concludes.
    Pipeline,
    /// Held until the nearest enclosing stage concludes.
    Stage,
    /// Held until the acquiring node itself concludes.
    Queue,
}

impl HoldingScope {
    /// Resolves the runtime id of the node whose conclusion releases a hold
    /// at this scope.
    ///
    /// A stage-scoped hold outside any stage falls back to the root level.
    pub fn scope_runtime_id(self, ambiance: &Ambiance) -> EngineResult<String> {
        let root = ambiance
            .levels
            .first()
            .ok_or_else(|| EngineError::configuration("ambiance has no levels"))?;
        match self {
            Self::Pipeline => Ok(root.runtime_id.clone()),
            Self::Stage => Ok(ambiance
                .nearest_level(StepCategory::Stage)
                .map_or_else(|| root.runtime_id.clone(), |l| l.runtime_id.clone())),
            Self::Queue => Ok(ambiance.current_runtime_id()?.to_string()),
        }
    }
}

impl fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pipeline => "pipeline",
            Self::Stage => "stage",
            Self::Queue => "queue",
        };
        write!(f, "{s}")
    }
}

/// Where a restraint instance sits in its resource unit's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestraintState {
    /// Waiting for an active slot.
    Blocked,
    /// Holding an active slot.
    Active,
    /// Done; the slot (if any) has been returned.
    Finished,
}

impl fmt::Display for RestraintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blocked => "blocked",
            Self::Active => "active",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// One queued acquisition of a resource unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestraintInstance {
    /// Unique id, doubling as the wait correlation id for blocked holders.
    pub id: String,
    /// The named resource being admission-controlled.
    pub resource_unit: String,
    /// The lifetime boundary of the hold.
    pub holding_scope: HoldingScope,
    /// Runtime id of the node whose conclusion releases the hold.
    pub scope_runtime_id: String,
    /// The node execution that requested the hold.
    pub node_execution_id: String,
    /// The plan execution the request belongs to.
    pub plan_execution_id: String,
    /// Monotonic position in the resource unit's queue.
    pub order: u64,
    /// Current queue state.
    pub state: RestraintState,
    /// When the acquisition was requested.
    pub created_at: Timestamp,
}

/// FIFO admission control over named resource units.
///
/// Each resource unit has a fixed capacity, set by the first acquisition and
/// immutable afterwards. Instances become active strictly in acquisition
/// order; releasing is the only way slots free up. Mutations for one unit are
/// serialized under a per-unit async lock.
pub struct RestraintService {
    store: Arc<dyn ExecutionStore>,
    unit_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RestraintService {
    /// Creates a service over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            unit_locks: DashMap::new(),
        }
    }

    /// Requests a slot on `resource_unit`, joining the back of its queue.
    ///
    /// The returned instance is [`RestraintState::Active`] when a slot was
    /// free, else [`RestraintState::Blocked`]; blocked callers are resumed
    /// through the wait correlator under the instance id. Pass `instance_id`
    /// to pre-register that wait before the queue can promote it. `capacity`
    /// only takes effect on the unit's first acquisition and is clamped to at
    /// least 1.
    pub async fn acquire(
        &self,
        ambiance: &Ambiance,
        resource_unit: &str,
        holding_scope: HoldingScope,
        capacity: u32,
        instance_id: Option<String>,
    ) -> EngineResult<RestraintInstance> {
        let scope_runtime_id = holding_scope.scope_runtime_id(ambiance)?;
        let lock = self.unit_lock(resource_unit);
        let _guard = lock.lock().await;

        self.store
            .init_restraint_capacity(resource_unit, capacity.max(1))
            .await?;
        let order = self.store.next_restraint_order(resource_unit).await?;
        let instance = RestraintInstance {
            id: instance_id.unwrap_or_else(generate_id),
            resource_unit: resource_unit.to_string(),
            holding_scope,
            scope_runtime_id,
            node_execution_id: ambiance.current_runtime_id()?.to_string(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            order,
            state: RestraintState::Blocked,
            created_at: now_utc(),
        };
        self.store.insert_restraint_instance(instance.clone()).await?;
        self.evaluate_unit(resource_unit).await?;
        self.store.fetch_restraint_instance(&instance.id).await
    }

    /// Finishes one instance and promotes whatever its slot admits.
    ///
    /// Releasing an instance that never reached active is legal: it leaves
    /// the queue without promoting anything beyond its turn. Releasing twice
    /// is a no-op. Returns the instances promoted to active, oldest first;
    /// the caller notifies their waits.
    pub async fn release(&self, instance_id: &str) -> EngineResult<Vec<RestraintInstance>> {
        let instance = self.store.fetch_restraint_instance(instance_id).await?;
        let lock = self.unit_lock(&instance.resource_unit);
        let _guard = lock.lock().await;

        let current = self.store.fetch_restraint_instance(instance_id).await?;
        if current.state == RestraintState::Finished {
            return Ok(Vec::new());
        }
        let mut finished = current;
        finished.state = RestraintState::Finished;
        self.store.update_restraint_instance(finished).await?;
        self.evaluate_unit(&instance.resource_unit).await
    }

    /// Releases every unfinished instance held at `scope_runtime_id`.
    ///
    /// Called when the node owning that runtime id concludes. Returns all
    /// instances promoted across the affected resource units.
    pub async fn release_scope(
        &self,
        scope_runtime_id: &str,
    ) -> EngineResult<Vec<RestraintInstance>> {
        let held = self
            .store
            .fetch_restraints_for_scope(scope_runtime_id)
            .await?;
        let mut promoted = Vec::new();
        for instance in held {
            promoted.extend(self.release(&instance.id).await?);
        }
        Ok(promoted)
    }

    /// Returns every instance of a resource unit, oldest first.
    pub async fn instances_for_unit(
        &self,
        resource_unit: &str,
    ) -> EngineResult<Vec<RestraintInstance>> {
        self.store.fetch_restraints_for_unit(resource_unit).await
    }

    /// Promotes the oldest blocked instances up to the unit's capacity.
    /// Callers hold the unit lock.
    async fn evaluate_unit(&self, resource_unit: &str) -> EngineResult<Vec<RestraintInstance>> {
        let capacity = self.store.restraint_capacity(resource_unit).await?;
        let instances = self.store.fetch_restraints_for_unit(resource_unit).await?;
        let mut active = instances
            .iter()
            .filter(|i| i.state == RestraintState::Active)
            .count() as u32;
        let mut promoted = Vec::new();
        for instance in instances {
            if active >= capacity {
                break;
            }
            if instance.state != RestraintState::Blocked {
                continue;
            }
            let mut updated = instance;
            updated.state = RestraintState::Active;
            self.store.update_restraint_instance(updated.clone()).await?;
            promoted.push(updated);
            active += 1;
        }
        Ok(promoted)
    }

    fn unit_lock(&self, resource_unit: &str) -> Arc<Mutex<()>> {
        self.unit_locks
            .entry(resource_unit.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
