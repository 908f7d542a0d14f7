//! End-to-end engine scenarios over the in-memory store.

use super::{EngineConfig, InterruptRequest, NodeExecution, OrchestrationEngine};
use crate::advising::AdviserObtainment;
use crate::ambiance::{Ambiance, Level};
use crate::core::{FailureInfo, InterruptType, NodeStatus, PlanStatus};
use crate::errors::{EngineError, EngineResult};
use crate::events::{CollectingSink, OrchestrationEvent, OrchestrationSink};
use crate::facilitation::FacilitatorObtainment;
use crate::plan::{BarrierSetup, Plan, PlanNode};
use crate::restraint::{HoldingScope, RestraintService};
use crate::steps::{Step, StepContext, StepResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn quick_config() -> EngineConfig {
    EngineConfig {
        sweep_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

fn harness(steps: Vec<Arc<dyn Step>>) -> (OrchestrationEngine, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let mut builder = OrchestrationEngine::builder()
        .config(quick_config())
        .sink(Arc::clone(&sink) as Arc<dyn OrchestrationSink>);
    for step in steps {
        builder = builder.step(step);
    }
    let engine = builder.build().unwrap();
    (engine, sink)
}

async fn start(engine: &OrchestrationEngine, plan: Plan) -> String {
    engine.start_plan(plan, HashMap::new()).await.unwrap()
}

/// Polls until a live execution of `setup_id` reaches `status`.
async fn await_node(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    setup_id: &str,
    status: NodeStatus,
) -> NodeExecution {
    for _ in 0..300 {
        let nodes = engine
            .store()
            .fetch_nodes_for_plan(plan_execution_id)
            .await
            .unwrap();
        if let Some(node) = nodes
            .iter()
            .find(|n| n.setup_id == setup_id && n.status == status && !n.old_retry)
        {
            return node.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node '{setup_id}' never reached {status}");
}

async fn nodes_for(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    setup_id: &str,
) -> Vec<NodeExecution> {
    engine
        .store()
        .fetch_nodes_for_plan(plan_execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.setup_id == setup_id)
        .collect()
}

fn on_success(next: &str) -> AdviserObtainment {
    AdviserObtainment::new("on_success").with_parameters(json!({ "next_node_id": next }))
}

// Test steps.

struct OkStep {
    calls: Arc<Mutex<Vec<String>>>,
}

impl OkStep {
    fn shared() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Step for OkStep {
    fn step_type(&self) -> &str {
        "ok"
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        self.calls
            .lock()
            .push(ctx.ambiance().current_setup_id()?.to_string());
        Ok(StepResponse::succeeded())
    }
}

struct BoomStep {
    failure: FailureInfo,
}

#[async_trait]
impl Step for BoomStep {
    fn step_type(&self) -> &str {
        "boom"
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        Ok(StepResponse::failed(self.failure.clone()))
    }
}

struct ErrStep;

#[async_trait]
impl Step for ErrStep {
    fn step_type(&self) -> &str {
        "raise"
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        Err(EngineError::execution(FailureInfo::application(
            "internal defect",
        )))
    }
}

struct FlakyStep {
    failures_left: AtomicU32,
}

impl FlakyStep {
    fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(times),
        })
    }
}

#[async_trait]
impl Step for FlakyStep {
    fn step_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Ok(StepResponse::failed(FailureInfo::connectivity(
                "socket reset",
            )));
        }
        Ok(StepResponse::succeeded())
    }
}

struct SlowStep {
    delay: Duration,
}

#[async_trait]
impl Step for SlowStep {
    fn step_type(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(StepResponse::succeeded())
    }
}

/// Registers a wait, optionally lingers, then suspends under it.
struct ParkStep {
    correlation_id: String,
    hold: Duration,
}

impl ParkStep {
    fn new(correlation_id: &str) -> Arc<Self> {
        Arc::new(Self {
            correlation_id: correlation_id.to_string(),
            hold: Duration::ZERO,
        })
    }

    fn lingering(correlation_id: &str, hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            correlation_id: correlation_id.to_string(),
            hold,
        })
    }
}

#[async_trait]
impl Step for ParkStep {
    fn step_type(&self) -> &str {
        "park"
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        ctx.register_wait(&self.correlation_id).await?;
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        Ok(StepResponse::suspend(self.correlation_id.clone()))
    }

    async fn handle_resume(
        &self,
        _ctx: &StepContext,
        payload: Value,
    ) -> EngineResult<StepResponse> {
        if payload.get("ok") == Some(&Value::Bool(true)) {
            Ok(StepResponse::succeeded())
        } else {
            Ok(StepResponse::failed(FailureInfo::application(
                "rejected by callback",
            )))
        }
    }
}

// Scenarios.

#[tokio::test]
async fn test_linear_chain_runs_to_success() {
    let (ok, calls) = OkStep::shared();
    let (engine, sink) = harness(vec![ok]);
    let plan = Plan::builder("build")
        .node(PlanNode::new("a", "A", "ok").with_adviser(on_success("b")))
        .node(PlanNode::new("b", "B", "ok").with_adviser(on_success("c")))
        .node(PlanNode::new("c", "C", "ok"))
        .starting_node("a")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    let status = engine.wait_for_plan(&pe).await.unwrap();

    assert_eq!(status, PlanStatus::Succeeded);
    assert_eq!(*calls.lock(), vec!["a", "b", "c"]);

    let a = await_node(&engine, &pe, "a", NodeStatus::Succeeded).await;
    let b = await_node(&engine, &pe, "b", NodeStatus::Succeeded).await;
    assert_eq!(a.next_id, Some(b.id.clone()));
    assert_eq!(b.previous_id, Some(a.id));
    assert!(a.started_at.is_some());
    assert!(a.ended_at.is_some());

    let plan_updates = sink.events_of_kind("plan_status_update");
    assert!(matches!(
        plan_updates.last(),
        Some(OrchestrationEvent::PlanStatusUpdate {
            to_status: PlanStatus::Succeeded,
            ..
        })
    ));
}

#[tokio::test]
async fn test_failed_node_without_advisers_fails_the_plan() {
    let (engine, _) = harness(vec![Arc::new(BoomStep {
        failure: FailureInfo::application("artifact checksum mismatch"),
    })]);
    let plan = Plan::builder("build")
        .node(PlanNode::new("verify", "Verify", "boom"))
        .starting_node("verify")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Failed);

    let node = await_node(&engine, &pe, "verify", NodeStatus::Failed).await;
    let failure = node.failure_info.unwrap();
    assert_eq!(failure.message, "artifact checksum mismatch");
}

#[tokio::test]
async fn test_on_fail_filter_routes_matching_failures() {
    let (ok, _) = OkStep::shared();
    let (engine, _) = harness(vec![
        ok,
        Arc::new(BoomStep {
            failure: FailureInfo::connectivity("socket reset"),
        }),
    ]);
    let plan = Plan::builder("deploy")
        .node(PlanNode::new("push", "Push", "boom").with_adviser(
            AdviserObtainment::new("on_fail").with_parameters(json!({
                "next_node_id": "rollback",
                "applicable_failure_types": ["connectivity"]
            })),
        ))
        .node(PlanNode::new("rollback", "Rollback", "ok"))
        .starting_node("push")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );

    let rollback = await_node(&engine, &pe, "rollback", NodeStatus::Succeeded).await;
    let push = await_node(&engine, &pe, "push", NodeStatus::Failed).await;
    assert_eq!(rollback.previous_id, Some(push.id));
}

#[tokio::test]
async fn test_on_fail_filter_ignores_other_failures() {
    let (ok, _) = OkStep::shared();
    let (engine, _) = harness(vec![
        ok,
        Arc::new(BoomStep {
            failure: FailureInfo::application("assertion failed"),
        }),
    ]);
    let plan = Plan::builder("deploy")
        .node(PlanNode::new("push", "Push", "boom").with_adviser(
            AdviserObtainment::new("on_fail").with_parameters(json!({
                "next_node_id": "rollback",
                "applicable_failure_types": ["connectivity"]
            })),
        ))
        .node(PlanNode::new("rollback", "Rollback", "ok"))
        .starting_node("push")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Failed);
    assert!(nodes_for(&engine, &pe, "rollback").await.is_empty());
}

#[tokio::test]
async fn test_adviser_precedence_first_applicable_wins() {
    let (ok, calls) = OkStep::shared();
    let (engine, _) = harness(vec![ok]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("a", "A", "ok")
                .with_adviser(
                    AdviserObtainment::new("on_fail")
                        .with_parameters(json!({"next_node_id": "recover"})),
                )
                .with_adviser(on_success("b")),
        )
        .node(PlanNode::new("b", "B", "ok"))
        .node(PlanNode::new("recover", "Recover", "ok"))
        .starting_node("a")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
    assert_eq!(*calls.lock(), vec!["a", "b"]);
    assert!(nodes_for(&engine, &pe, "recover").await.is_empty());
}

#[tokio::test]
async fn test_retry_reruns_until_success() {
    let (engine, _) = harness(vec![FlakyStep::failing(2)]);
    let plan = Plan::builder("p")
        .node(PlanNode::new("job", "Job", "flaky").with_adviser(
            AdviserObtainment::new("retry")
                .with_parameters(json!({"wait_intervals_ms": [10, 10, 10]})),
        ))
        .starting_node("job")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );

    let attempts = nodes_for(&engine, &pe, "job").await;
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts.iter().filter(|n| n.old_retry).count(), 2);

    let last = attempts.iter().find(|n| !n.old_retry).unwrap();
    assert_eq!(last.status, NodeStatus::Succeeded);
    assert_eq!(last.retry_index, 2);
    assert_eq!(last.retried_ids.len(), 2);
}

#[tokio::test]
async fn test_retry_exhaustion_ends_the_plan() {
    let (engine, _) = harness(vec![Arc::new(BoomStep {
        failure: FailureInfo::connectivity("unreachable"),
    })]);
    let plan = Plan::builder("p")
        .node(PlanNode::new("job", "Job", "boom").with_adviser(
            AdviserObtainment::new("retry").with_parameters(json!({"wait_intervals_ms": [10]})),
        ))
        .starting_node("job")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Failed);

    let attempts = nodes_for(&engine, &pe, "job").await;
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|n| n.status == NodeStatus::Failed));
}

#[tokio::test]
async fn test_skipped_node_advances_through_on_success() {
    let (ok, calls) = OkStep::shared();
    let (engine, _) = harness(vec![ok]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("migrate", "Migrate", "ok")
                .with_facilitator(
                    FacilitatorObtainment::new("skip")
                        .with_parameters(json!({"reason": "schema already current"})),
                )
                .with_adviser(on_success("serve")),
        )
        .node(PlanNode::new("serve", "Serve", "ok"))
        .starting_node("migrate")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );

    let migrate = await_node(&engine, &pe, "migrate", NodeStatus::Skipped).await;
    assert_eq!(migrate.skip_info, Some("schema already current".to_string()));
    assert!(migrate.started_at.is_none());
    assert_eq!(*calls.lock(), vec!["serve"]);
}

#[tokio::test]
async fn test_async_notify_resumes_exactly_once() {
    let (engine, _) = harness(vec![ParkStep::new("cb-42")]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("approve", "Approve", "park")
                .with_facilitator(FacilitatorObtainment::new("async")),
        )
        .starting_node("approve")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    await_node(&engine, &pe, "approve", NodeStatus::AsyncWaiting).await;

    assert!(engine.notify("cb-42", json!({"ok": true})).await.unwrap());
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );

    // At-least-once delivery: the duplicate finds no pending wait.
    assert!(!engine.notify("cb-42", json!({"ok": true})).await.unwrap());
}

#[tokio::test]
async fn test_notify_unknown_correlation_returns_false() {
    let (engine, _) = harness(vec![]);
    assert!(!engine.notify("nobody", json!({})).await.unwrap());
}

#[tokio::test]
async fn test_notify_racing_the_suspension_is_redelivered() {
    let (engine, _) = harness(vec![ParkStep::lingering(
        "cb-race",
        Duration::from_millis(80),
    )]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("approve", "Approve", "park")
                .with_facilitator(FacilitatorObtainment::new("async")),
        )
        .starting_node("approve")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;

    // The wait is registered while the step is still running; a notify
    // landing now must be parked and re-delivered, not lost.
    for _ in 0..100 {
        if engine.store().pending_wait("cb-race").await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(engine.notify("cb-race", json!({"ok": true})).await.unwrap());
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
}

#[tokio::test]
async fn test_section_runs_child_chain_and_reports() {
    let (ok, calls) = OkStep::shared();
    let (engine, _) = harness(vec![ok]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("stage", "Stage", "section")
                .with_parameters(json!({"child_node_id": "a"}))
                .with_facilitator(FacilitatorObtainment::new("child")),
        )
        .node(PlanNode::new("a", "A", "ok").with_adviser(on_success("b")))
        .node(PlanNode::new("b", "B", "ok"))
        .starting_node("stage")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
    assert_eq!(*calls.lock(), vec!["a", "b"]);

    let stage = await_node(&engine, &pe, "stage", NodeStatus::Succeeded).await;
    let a = await_node(&engine, &pe, "a", NodeStatus::Succeeded).await;
    let b = await_node(&engine, &pe, "b", NodeStatus::Succeeded).await;
    assert_eq!(a.parent_id, Some(stage.id.clone()));
    assert_eq!(b.parent_id, Some(stage.id));
    assert_eq!(stage.worst_child_status, Some(NodeStatus::Succeeded));
}

#[tokio::test]
async fn test_fork_fails_fast_and_aborts_siblings() {
    let (engine, _) = harness(vec![
        Arc::new(SlowStep {
            delay: Duration::from_millis(250),
        }),
        Arc::new(BoomStep {
            failure: FailureInfo::application("unit tests failed"),
        }),
    ]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("fan", "Fan out", "fork")
                .with_parameters(json!({"parallel_node_ids": ["lint", "test"]}))
                .with_facilitator(FacilitatorObtainment::new("children")),
        )
        .node(PlanNode::new("lint", "Lint", "slow"))
        .node(PlanNode::new("test", "Test", "boom"))
        .starting_node("fan")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Failed);

    let fan = await_node(&engine, &pe, "fan", NodeStatus::Failed).await;
    assert_eq!(
        fan.failure_info.map(|f| f.message),
        Some("unit tests failed".to_string())
    );
    await_node(&engine, &pe, "lint", NodeStatus::Aborted).await;
}

#[tokio::test]
async fn test_fork_continues_on_children_failure_when_configured() {
    let (engine, _) = harness(vec![
        Arc::new(SlowStep {
            delay: Duration::from_millis(60),
        }),
        Arc::new(BoomStep {
            failure: FailureInfo::application("unit tests failed"),
        }),
    ]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("fan", "Fan out", "fork")
                .with_parameters(json!({"parallel_node_ids": ["lint", "test"]}))
                .with_facilitator(FacilitatorObtainment::new("children"))
                .with_continue_on_children_failure(true),
        )
        .node(PlanNode::new("lint", "Lint", "slow"))
        .node(PlanNode::new("test", "Test", "boom"))
        .starting_node("fan")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Failed);

    // The slow sibling was allowed to finish.
    await_node(&engine, &pe, "lint", NodeStatus::Succeeded).await;
    await_node(&engine, &pe, "fan", NodeStatus::Failed).await;
}

#[tokio::test]
async fn test_fork_aggregates_the_worst_child_status() {
    let (engine, _) = harness(vec![
        Arc::new(BoomStep {
            failure: FailureInfo::application("failed"),
        }),
        Arc::new(ErrStep),
    ]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("fan", "Fan out", "fork")
                .with_parameters(json!({"parallel_node_ids": ["f", "e"]}))
                .with_facilitator(FacilitatorObtainment::new("children"))
                .with_continue_on_children_failure(true),
        )
        .node(PlanNode::new("f", "F", "boom"))
        .node(PlanNode::new("e", "E", "raise"))
        .starting_node("fan")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Errored);
    await_node(&engine, &pe, "fan", NodeStatus::Errored).await;
}

#[tokio::test]
async fn test_barrier_releases_every_participant_on_last_arrival() {
    let (engine, _) = harness(vec![]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("fan", "Fan out", "fork")
                .with_parameters(json!({"parallel_node_ids": ["g1", "g2", "g3"]}))
                .with_facilitator(FacilitatorObtainment::new("children")),
        )
        .node(PlanNode::new("g1", "Gate 1", "barrier").with_parameters(json!({"identifier": "sync"})))
        .node(PlanNode::new("g2", "Gate 2", "barrier").with_parameters(json!({"identifier": "sync"})))
        .node(PlanNode::new("g3", "Gate 3", "barrier").with_parameters(json!({"identifier": "sync"})))
        .starting_node("fan")
        .barrier(
            BarrierSetup::new("sync", "Sync point")
                .with_position("st", "g1")
                .with_position("st", "g2")
                .with_position("st", "g3"),
        )
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
    for gate in ["g1", "g2", "g3"] {
        await_node(&engine, &pe, gate, NodeStatus::Succeeded).await;
    }
}

#[tokio::test]
async fn test_blocked_restraint_is_promoted_and_resumed() {
    let (engine, _) = harness(vec![]);

    // Take the only slot on the unit before the plan asks for it.
    let restraints = RestraintService::new(engine.store());
    let outside = Ambiance::new(
        "pe-outside",
        "outside",
        HashMap::new(),
        Level::from_plan_node(&PlanNode::new("holder", "Holder", "noop")),
    );
    let hold = restraints
        .acquire(&outside, "db-migrations", HoldingScope::Queue, 1, None)
        .await
        .unwrap();

    let plan = Plan::builder("p")
        .node(
            PlanNode::new("guard", "Guard", "restraint")
                .with_parameters(json!({"resource_unit": "db-migrations", "capacity": 1})),
        )
        .starting_node("guard")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    await_node(&engine, &pe, "guard", NodeStatus::ResourceWaiting).await;

    let promoted = restraints.release(&hold.id).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert!(engine
        .notify(
            &promoted[0].id,
            json!({"restraint": "promoted", "resource_unit": "db-migrations"})
        )
        .await
        .unwrap());

    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
}

#[tokio::test]
async fn test_node_timeout_expires_the_node() {
    let (engine, _) = harness(vec![Arc::new(SlowStep {
        delay: Duration::from_millis(400),
    })]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("job", "Job", "slow").with_timeout(Duration::from_millis(50)),
        )
        .starting_node("job")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Expired);

    let node = await_node(&engine, &pe, "job", NodeStatus::Expired).await;
    let failure = node.failure_info.unwrap();
    assert!(failure.failure_types.contains(&crate::core::FailureType::Timeout));
}

#[tokio::test]
async fn test_intervention_timeout_applies_the_configured_action() {
    let (engine, _) = harness(vec![Arc::new(BoomStep {
        failure: FailureInfo::application("flapping check"),
    })]);
    let plan = Plan::builder("p")
        .node(PlanNode::new("check", "Check", "boom").with_adviser(
            AdviserObtainment::new("manual_intervention")
                .with_parameters(json!({"timeout_ms": 80, "on_timeout": "mark_success"})),
        ))
        .starting_node("check")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
    await_node(&engine, &pe, "check", NodeStatus::Succeeded).await;
}

#[tokio::test]
async fn test_mark_failed_interrupt_resolves_an_intervention() {
    let (engine, sink) = harness(vec![Arc::new(BoomStep {
        failure: FailureInfo::application("bad deploy"),
    })]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("deploy", "Deploy", "boom")
                .with_adviser(AdviserObtainment::new("manual_intervention")),
        )
        .starting_node("deploy")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    let parked = await_node(&engine, &pe, "deploy", NodeStatus::InterventionWaiting).await;

    engine
        .interrupt(InterruptRequest::node(
            InterruptType::MarkFailed,
            &pe,
            &parked.id,
        ))
        .await
        .unwrap();

    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Failed);
    let node = await_node(&engine, &pe, "deploy", NodeStatus::Failed).await;
    assert_eq!(node.interrupt_effects.len(), 1);
    assert_eq!(
        node.interrupt_effects[0].interrupt_type,
        InterruptType::MarkFailed
    );
    assert_eq!(sink.events_of_kind("interrupt_took_effect").len(), 1);
}

#[tokio::test]
async fn test_retry_interrupt_reruns_an_intervention_waiting_node() {
    let (engine, _) = harness(vec![FlakyStep::failing(1)]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("job", "Job", "flaky")
                .with_adviser(AdviserObtainment::new("manual_intervention")),
        )
        .starting_node("job")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    let parked = await_node(&engine, &pe, "job", NodeStatus::InterventionWaiting).await;

    engine
        .interrupt(InterruptRequest::node(InterruptType::Retry, &pe, &parked.id))
        .await
        .unwrap();

    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
    let attempts = nodes_for(&engine, &pe, "job").await;
    assert_eq!(attempts.len(), 2);
    let last = attempts.iter().find(|n| !n.old_retry).unwrap();
    assert_eq!(last.status, NodeStatus::Succeeded);
    assert_eq!(last.retry_index, 1);
}

#[tokio::test]
async fn test_retry_interrupt_requires_an_intervention_wait() {
    let (engine, _) = harness(vec![ParkStep::new("cb-hold")]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("approve", "Approve", "park")
                .with_facilitator(FacilitatorObtainment::new("async")),
        )
        .starting_node("approve")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    let parked = await_node(&engine, &pe, "approve", NodeStatus::AsyncWaiting).await;

    let err = engine
        .interrupt(InterruptRequest::node(InterruptType::Retry, &pe, &parked.id))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
}

#[tokio::test]
async fn test_pause_all_parks_queued_work_until_resumed() {
    let (engine, sink) = harness(vec![
        Arc::new(SlowStep {
            delay: Duration::from_millis(120),
        }),
        OkStep::shared().0,
    ]);
    let plan = Plan::builder("p")
        .node(PlanNode::new("a", "A", "slow").with_adviser(on_success("b")))
        .node(PlanNode::new("b", "B", "ok"))
        .starting_node("a")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    await_node(&engine, &pe, "a", NodeStatus::Running).await;
    engine
        .interrupt(InterruptRequest::plan(InterruptType::PauseAll, &pe))
        .await
        .unwrap();

    // The running node finishes, but its successor parks.
    let b = await_node(&engine, &pe, "b", NodeStatus::Paused).await;
    assert_eq!(b.status, NodeStatus::Paused);

    engine
        .interrupt(InterruptRequest::plan(InterruptType::ResumeAll, &pe))
        .await
        .unwrap();
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );

    let seen: Vec<PlanStatus> = sink
        .events_of_kind("plan_status_update")
        .into_iter()
        .filter_map(|e| match e {
            OrchestrationEvent::PlanStatusUpdate { to_status, .. } => Some(to_status),
            _ => None,
        })
        .collect();
    assert_eq!(
        seen,
        vec![PlanStatus::Paused, PlanStatus::Running, PlanStatus::Succeeded]
    );
}

#[tokio::test]
async fn test_abort_all_ends_the_plan_and_its_waits() {
    let (engine, _) = harness(vec![ParkStep::new("cb-abort")]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("approve", "Approve", "park")
                .with_facilitator(FacilitatorObtainment::new("async")),
        )
        .starting_node("approve")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    await_node(&engine, &pe, "approve", NodeStatus::AsyncWaiting).await;

    engine
        .interrupt(InterruptRequest::plan(InterruptType::AbortAll, &pe))
        .await
        .unwrap();

    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Aborted);
    await_node(&engine, &pe, "approve", NodeStatus::Aborted).await;
    assert!(!engine.notify("cb-abort", json!({"ok": true})).await.unwrap());
}

#[tokio::test]
async fn test_node_abort_interrupt_records_the_reason() {
    let (engine, _) = harness(vec![ParkStep::new("cb-stuck")]);
    let plan = Plan::builder("p")
        .node(
            PlanNode::new("approve", "Approve", "park")
                .with_facilitator(FacilitatorObtainment::new("async")),
        )
        .starting_node("approve")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    let parked = await_node(&engine, &pe, "approve", NodeStatus::AsyncWaiting).await;

    engine
        .interrupt(
            InterruptRequest::node(InterruptType::Abort, &pe, &parked.id)
                .with_reason("operator request"),
        )
        .await
        .unwrap();

    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), PlanStatus::Aborted);
    let node = await_node(&engine, &pe, "approve", NodeStatus::Aborted).await;
    assert_eq!(
        node.interrupt_effects[0].reason,
        Some("operator request".to_string())
    );
}

#[tokio::test]
async fn test_start_plan_rejects_unknown_types() {
    let (engine, _) = harness(vec![]);
    let plan = Plan::builder("p")
        .node(PlanNode::new("a", "A", "does_not_exist"))
        .starting_node("a")
        .build()
        .unwrap();

    let err = engine.start_plan(plan, HashMap::new()).await.unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_wait_for_plan_on_an_ended_plan_returns_immediately() {
    let (ok, _) = OkStep::shared();
    let (engine, _) = harness(vec![ok]);
    let plan = Plan::builder("p")
        .node(PlanNode::new("a", "A", "ok"))
        .starting_node("a")
        .build()
        .unwrap();

    let pe = start(&engine, plan).await;
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
    // The watch is gone by now; this goes through the store.
    assert_eq!(
        engine.wait_for_plan(&pe).await.unwrap(),
        PlanStatus::Succeeded
    );
}
