//! # Planflow
//!
//! A pipeline execution orchestration engine.
//!
//! Planflow drives a directed graph of pipeline/stage/step nodes to
//! completion, persisting a state machine per node and deciding at every
//! transition what happens next:
//!
//! - **Facilitation**: pluggable pre-execution strategies choose how each
//!   node runs (sync, async, child plan, parallel children, or skip)
//! - **Advising**: pluggable post-completion strategies choose the next
//!   transition (next node, retry, manual intervention, end of plan)
//! - **Suspend/resume**: long-running external work parks the node under a
//!   durable correlation id and resumes it through a notify call, never a
//!   blocked thread
//! - **Resource control**: FIFO restraints and rendezvous barriers provide
//!   fair admission to shared resources
//! - **Timeouts**: deadline state is computed on read and swept by a single
//!   interval task
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use planflow::prelude::*;
//!
//! // Describe the plan
//! let plan = Plan::builder("deploy")
//!     .node(PlanNode::new("fetch", "Fetch artifact", "http"))
//!     .node(PlanNode::new("deploy", "Deploy", "shell"))
//!     .starting_node("fetch")
//!     .build()?;
//!
//! // Run it
//! let engine = OrchestrationEngine::builder()
//!     .step(Arc::new(HttpStep::new()))
//!     .step(Arc::new(ShellStep::new()))
//!     .build()?;
//! let plan_execution_id = engine.start_plan(plan, HashMap::new()).await?;
//! let status = engine.wait_for_plan(&plan_execution_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod advising;
pub mod ambiance;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod facilitation;
pub mod graph;
pub mod observability;
pub mod plan;
pub mod resolvers;
pub mod restraint;
pub mod steps;
pub mod store;
pub mod testing;
pub mod timeout;
pub mod utils;
pub mod waiter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::advising::{
        Advise, AdviseEvent, Adviser, AdviserObtainment, AdviserRegistry,
    };
    pub use crate::ambiance::{Ambiance, Level, StepCategory};
    pub use crate::core::{
        FailureInfo, FailureType, InterruptType, InterventionAction, NodeStatus,
        PlanStatus, RefObject, RefType,
    };
    pub use crate::engine::{
        EngineConfig, InterruptRequest, NodeExecution, OrchestrationEngine,
        PlanExecution,
    };
    pub use crate::errors::{EngineError, EngineResult};
    pub use crate::events::{
        CollectingSink, LoggingSink, NoOpSink, OrchestrationEvent, OrchestrationSink,
    };
    pub use crate::facilitation::{
        ExecutionMode, Facilitator, FacilitatorObtainment, FacilitatorRegistry,
        FacilitatorResponse,
    };
    pub use crate::graph::{ExecutionGraph, GraphNode, GraphService};
    pub use crate::plan::{BarrierSetup, Plan, PlanBuilder, PlanNode};
    pub use crate::resolvers::{Resolver, ResolverRegistry};
    pub use crate::restraint::{
        BarrierService, BarrierState, HoldingScope, RestraintService, RestraintState,
    };
    pub use crate::steps::{
        AsyncWaitKind, Step, StepContext, StepRegistry, StepResponse, StepResult,
    };
    pub use crate::store::{ExecutionStore, InMemoryStore};
    pub use crate::utils::{epoch_millis, generate_id, generate_uuid, Timestamp};
    pub use crate::waiter::{WaitInstance, WaitNotifyEngine};
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_prelude_runs_a_single_node_plan() {
        let plan = Plan::builder("smoke")
            .node(PlanNode::new("only", "Only", "noop"))
            .starting_node("only")
            .build()
            .unwrap();

        let engine = OrchestrationEngine::builder().build().unwrap();
        let plan_execution_id = engine.start_plan(plan, HashMap::new()).await.unwrap();
        let status = engine.wait_for_plan(&plan_execution_id).await.unwrap();
        assert_eq!(status, PlanStatus::Succeeded);
    }
}
