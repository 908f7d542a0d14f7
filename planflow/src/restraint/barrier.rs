//! Rendezvous barriers across parallel branches.

use crate::errors::{EngineError, EngineResult};
use crate::plan::{BarrierPositionSetup, Plan};
use crate::store::ExecutionStore;
use crate::utils::{generate_id, now_utc, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Builds the wait correlation id a participant parks under at a barrier.
#[must_use]
pub fn barrier_correlation_id(instance_id: &str, node_execution_id: &str) -> String {
    format!("barrier:{instance_id}:{node_execution_id}")
}

/// Lifecycle of a barrier within one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    /// Waiting for participants.
    Standing,
    /// All participants arrived; everyone has been released.
    Down,
    /// The plan ended while the barrier was standing.
    Errored,
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standing => "standing",
            Self::Down => "down",
            Self::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

/// One participant's slot at a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierPosition {
    /// Setup id of the stage the participant runs under.
    pub stage_setup_id: String,
    /// Setup id of the participating step.
    pub step_setup_id: String,
    /// The node execution that arrived, once it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    /// Whether the participant has arrived.
    pub arrived: bool,
}

/// The runtime record of a barrier within one plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierExecutionInstance {
    /// Unique id of this instance.
    pub id: String,
    /// The setup identifier of the barrier.
    pub barrier_identifier: String,
    /// Human-readable name.
    pub name: String,
    /// The plan execution the barrier belongs to.
    pub plan_execution_id: String,
    /// Current lifecycle state.
    pub state: BarrierState,
    /// How many participants must arrive, fixed at setup time.
    pub participant_count: u32,
    /// How many have arrived so far.
    pub arrived_count: u32,
    /// Per-participant slots.
    pub positions: Vec<BarrierPosition>,
    /// When the instance was registered.
    pub created_at: Timestamp,
    /// Optimistic concurrency version.
    pub version: u64,
}

/// The outcome of one arrival at a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierArrival {
    /// The barrier's state after the arrival.
    pub state: BarrierState,
    /// Correlation ids of the previously arrived participants to release.
    /// Non-empty only on the arrival that brings the barrier down; the
    /// arriving node itself is not listed, its caller already knows.
    pub released: Vec<String>,
}

/// Read-only projection of a barrier's setup within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierSetupInfo {
    /// The setup identifier.
    pub identifier: String,
    /// Human-readable name.
    pub name: String,
    /// The participating positions.
    pub positions: Vec<BarrierPositionSetup>,
}

/// Rendezvous barriers: N participants all arrive before any proceeds.
///
/// A barrier comes down exactly once, on the arrival that makes
/// `arrived_count == participant_count`. Arrivals for one barrier are
/// serialized under a per-barrier async lock; arrivals after it is down are
/// no-ops. Participants that will never arrive (a skipped branch) must be
/// left out of the setup positions, the engine does not infer liveness.
pub struct BarrierService {
    store: Arc<dyn ExecutionStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BarrierService {
    /// Creates a service over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Registers a standing instance for every barrier the plan declares.
    pub async fn register_for_plan(
        &self,
        plan: &Plan,
        plan_execution_id: &str,
    ) -> EngineResult<()> {
        for setup in &plan.barriers {
            let positions: Vec<BarrierPosition> = setup
                .positions
                .iter()
                .map(|p| BarrierPosition {
                    stage_setup_id: p.stage_setup_id.clone(),
                    step_setup_id: p.step_setup_id.clone(),
                    node_execution_id: None,
                    arrived: false,
                })
                .collect();
            let instance = BarrierExecutionInstance {
                id: generate_id(),
                barrier_identifier: setup.identifier.clone(),
                name: setup.name.clone(),
                plan_execution_id: plan_execution_id.to_string(),
                state: BarrierState::Standing,
                participant_count: positions.len() as u32,
                arrived_count: 0,
                positions,
                created_at: now_utc(),
                version: 0,
            };
            self.store.save_barrier_instance(instance).await?;
        }
        Ok(())
    }

    /// Records the arrival of `node_execution_id` at its position.
    ///
    /// The arrival that completes the participant set brings the barrier
    /// down and returns the correlation ids of everyone already parked at
    /// it. Arriving twice from the same position, or at a barrier that is
    /// already down, changes nothing.
    pub async fn drop_arrival(
        &self,
        barrier_identifier: &str,
        plan_execution_id: &str,
        step_setup_id: &str,
        node_execution_id: &str,
    ) -> EngineResult<BarrierArrival> {
        let lock = self.barrier_lock(barrier_identifier, plan_execution_id);
        let _guard = lock.lock().await;

        let mut instance = self
            .store
            .fetch_barrier_instance(barrier_identifier, plan_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("barrier_instance", barrier_identifier))?;
        if instance.state != BarrierState::Standing {
            return Ok(BarrierArrival {
                state: instance.state,
                released: Vec::new(),
            });
        }

        let position = instance
            .positions
            .iter_mut()
            .find(|p| p.step_setup_id == step_setup_id)
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "step '{step_setup_id}' holds no position at barrier '{barrier_identifier}'"
                ))
            })?;
        if position.arrived {
            return Ok(BarrierArrival {
                state: instance.state,
                released: Vec::new(),
            });
        }
        position.arrived = true;
        position.node_execution_id = Some(node_execution_id.to_string());
        instance.arrived_count += 1;

        let mut released = Vec::new();
        if instance.arrived_count == instance.participant_count {
            instance.state = BarrierState::Down;
            released = instance
                .positions
                .iter()
                .filter(|p| p.arrived)
                .filter_map(|p| p.node_execution_id.as_deref())
                .filter(|id| *id != node_execution_id)
                .map(|id| barrier_correlation_id(&instance.id, id))
                .collect();
        }
        let updated = self.store.update_barrier_instance(instance).await?;
        Ok(BarrierArrival {
            state: updated.state,
            released,
        })
    }

    /// Marks every standing barrier of the plan errored.
    ///
    /// Returns `(correlation_id, payload)` pairs for the participants parked
    /// at them, so the caller can wake and fail each one.
    pub async fn error_barriers_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<(String, Value)>> {
        let mut notifications = Vec::new();
        for instance in self.store.fetch_barriers_for_plan(plan_execution_id).await? {
            if instance.state != BarrierState::Standing {
                continue;
            }
            let lock = self.barrier_lock(&instance.barrier_identifier, plan_execution_id);
            let _guard = lock.lock().await;

            let Some(mut current) = self
                .store
                .fetch_barrier_instance(&instance.barrier_identifier, plan_execution_id)
                .await?
            else {
                continue;
            };
            if current.state != BarrierState::Standing {
                continue;
            }
            current.state = BarrierState::Errored;
            let payload = json!({
                "barrier": "errored",
                "barrier_identifier": current.barrier_identifier,
            });
            for position in current.positions.iter().filter(|p| p.arrived) {
                if let Some(id) = position.node_execution_id.as_deref() {
                    notifications
                        .push((barrier_correlation_id(&current.id, id), payload.clone()));
                }
            }
            self.store.update_barrier_instance(current).await?;
        }
        Ok(notifications)
    }

    /// Projects the barriers a plan declares, without runtime state.
    #[must_use]
    pub fn setup_info(plan: &Plan) -> Vec<BarrierSetupInfo> {
        plan.barriers
            .iter()
            .map(|b| BarrierSetupInfo {
                identifier: b.identifier.clone(),
                name: b.name.clone(),
                positions: b.positions.clone(),
            })
            .collect()
    }

    /// Returns the barrier instances with a position under the given stage.
    pub async fn execution_info_for_stage(
        &self,
        stage_setup_id: &str,
        plan_execution_id: &str,
    ) -> EngineResult<Vec<BarrierExecutionInstance>> {
        let instances = self.store.fetch_barriers_for_plan(plan_execution_id).await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.positions.iter().any(|p| p.stage_setup_id == stage_setup_id))
            .collect())
    }

    /// Returns the instance of one barrier within a plan, if registered.
    pub async fn barrier_info(
        &self,
        barrier_identifier: &str,
        plan_execution_id: &str,
    ) -> EngineResult<Option<BarrierExecutionInstance>> {
        self.store
            .fetch_barrier_instance(barrier_identifier, plan_execution_id)
            .await
    }

    fn barrier_lock(&self, barrier_identifier: &str, plan_execution_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{plan_execution_id}:{barrier_identifier}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
