//! Mock steps for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::FailureInfo;
use crate::errors::EngineResult;
use crate::steps::{Step, StepContext, StepResponse};

/// A mock step that records calls and returns a configurable response.
#[derive(Debug)]
pub struct MockStep {
    step_type: String,
    response: Mutex<StepResponse>,
    resume_response: Mutex<StepResponse>,
    call_count: Mutex<usize>,
    setup_ids: Mutex<Vec<String>>,
}

impl MockStep {
    /// Creates a mock step that succeeds.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            response: Mutex::new(StepResponse::succeeded()),
            resume_response: Mutex::new(StepResponse::succeeded()),
            call_count: Mutex::new(0),
            setup_ids: Mutex::new(Vec::new()),
        }
    }

    /// Sets the response `execute` returns.
    pub fn set_response(&self, response: StepResponse) {
        *self.response.lock() = response;
    }

    /// Sets the response `handle_resume` returns.
    pub fn set_resume_response(&self, response: StepResponse) {
        *self.resume_response.lock() = response;
    }

    /// Returns the number of times `execute` was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// Returns the setup ids seen by each `execute` call.
    #[must_use]
    pub fn recorded_setup_ids(&self) -> Vec<String> {
        self.setup_ids.lock().clone()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        *self.call_count.lock() = 0;
        self.setup_ids.lock().clear();
    }
}

#[async_trait]
impl Step for MockStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        *self.call_count.lock() += 1;
        self.setup_ids
            .lock()
            .push(ctx.ambiance().current_setup_id()?.to_string());
        Ok(self.response.lock().clone())
    }

    async fn handle_resume(
        &self,
        _ctx: &StepContext,
        _payload: Value,
    ) -> EngineResult<StepResponse> {
        Ok(self.resume_response.lock().clone())
    }
}

/// A step that always succeeds, optionally publishing outcomes first.
#[derive(Debug)]
pub struct SuccessStep {
    step_type: String,
    outcomes: HashMap<String, Value>,
}

impl SuccessStep {
    /// Creates a success step.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            outcomes: HashMap::new(),
        }
    }

    /// Creates a success step that publishes the given outcomes.
    #[must_use]
    pub fn with_outcomes(
        step_type: impl Into<String>,
        outcomes: HashMap<String, Value>,
    ) -> Self {
        Self {
            step_type: step_type.into(),
            outcomes,
        }
    }
}

#[async_trait]
impl Step for SuccessStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        for (name, value) in &self.outcomes {
            ctx.publish_outcome(name, value.clone()).await?;
        }
        Ok(StepResponse::succeeded())
    }
}

/// A step that always fails with a configurable failure description.
#[derive(Debug)]
pub struct FailingStep {
    step_type: String,
    failure: FailureInfo,
}

impl FailingStep {
    /// Creates a failing step with an application failure.
    #[must_use]
    pub fn new(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            failure: FailureInfo::application(message),
        }
    }

    /// Creates a failing step with a connectivity failure, the kind retry
    /// advisers typically filter on.
    #[must_use]
    pub fn connectivity(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            failure: FailureInfo::connectivity(message),
        }
    }

    /// Creates a failing step with an explicit failure description.
    #[must_use]
    pub fn with_failure(step_type: impl Into<String>, failure: FailureInfo) -> Self {
        Self {
            step_type: step_type.into(),
            failure,
        }
    }
}

#[async_trait]
impl Step for FailingStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        Ok(StepResponse::failed(self.failure.clone()))
    }
}

/// A step that takes time to execute.
#[derive(Debug)]
pub struct SlowStep {
    step_type: String,
    delay: Duration,
}

impl SlowStep {
    /// Creates a slow step.
    #[must_use]
    pub fn new(step_type: impl Into<String>, delay: Duration) -> Self {
        Self {
            step_type: step_type.into(),
            delay,
        }
    }

    /// Creates a slow step with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(step_type: impl Into<String>, ms: u64) -> Self {
        Self::new(step_type, Duration::from_millis(ms))
    }
}

#[async_trait]
impl Step for SlowStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(StepResponse::succeeded())
    }
}

/// One recorded `execute` call.
#[derive(Debug, Clone)]
pub struct RecordedExecution {
    /// Setup id of the executing node.
    pub setup_id: String,
    /// Node execution id of the executing node.
    pub node_execution_id: String,
    /// The resolved inputs the step saw.
    pub inputs: Value,
}

/// A step that records every execution it sees, then succeeds.
#[derive(Debug)]
pub struct RecordingStep {
    step_type: String,
    executions: Mutex<Vec<RecordedExecution>>,
}

impl RecordingStep {
    /// Creates a recording step.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Returns all recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().clone()
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Clears recorded executions.
    pub fn clear(&self) {
        self.executions.lock().clear();
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        self.executions.lock().push(RecordedExecution {
            setup_id: ctx.ambiance().current_setup_id()?.to_string(),
            node_execution_id: ctx.node_execution_id()?.to_string(),
            inputs: ctx.inputs().clone(),
        });
        Ok(StepResponse::succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureType;
    use crate::steps::StepResult;
    use crate::testing::StepTestBed;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_step_records_and_replays() {
        let bed = StepTestBed::new();
        let step = MockStep::new("mock");

        let response = step.execute(&bed.context("a", "mock")).await.unwrap();
        assert_eq!(response, StepResponse::succeeded());
        assert_eq!(step.call_count(), 1);

        step.set_response(StepResponse::failed(FailureInfo::application("boom")));
        let response = step.execute(&bed.context("b", "mock")).await.unwrap();
        assert!(matches!(
            response,
            StepResponse::Terminal(StepResult {
                failure_info: Some(_),
                ..
            })
        ));
        assert_eq!(step.recorded_setup_ids(), vec!["a", "b"]);

        step.reset();
        assert_eq!(step.call_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_step_resume_response() {
        let bed = StepTestBed::new();
        let step = MockStep::new("mock");
        step.set_resume_response(StepResponse::failed(FailureInfo::application("rejected")));

        let response = step
            .handle_resume(&bed.context("a", "mock"), json!({}))
            .await
            .unwrap();
        assert!(matches!(response, StepResponse::Terminal(_)));
    }

    #[tokio::test]
    async fn test_success_step_publishes_outcomes() {
        let bed = StepTestBed::new();
        let mut outcomes = HashMap::new();
        outcomes.insert("digest".to_string(), json!("sha256:abc"));
        let step = SuccessStep::with_outcomes("build", outcomes);

        let ctx = bed.context("a", "build");
        let response = step.execute(&ctx).await.unwrap();
        assert_eq!(response, StepResponse::succeeded());

        let resolver = ctx
            .resolvers()
            .obtain(crate::core::RefType::Outcome)
            .unwrap();
        let value = resolver
            .resolve(ctx.ambiance(), &crate::core::RefObject::outcome("digest"))
            .await
            .unwrap();
        assert_eq!(value, json!("sha256:abc"));
    }

    #[tokio::test]
    async fn test_failing_step_carries_failure_types() {
        let bed = StepTestBed::new();
        let step = FailingStep::connectivity("push", "socket reset");

        let response = step.execute(&bed.context("a", "push")).await.unwrap();
        match response {
            StepResponse::Terminal(result) => {
                let failure = result.failure_info.unwrap();
                assert!(failure.has_type(FailureType::Connectivity));
                assert_eq!(failure.message, "socket reset");
            }
            other => panic!("expected a terminal response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_step_sleeps() {
        let bed = StepTestBed::new();
        let step = SlowStep::with_delay_ms("slow", 10);

        let start = std::time::Instant::now();
        let response = step.execute(&bed.context("a", "slow")).await.unwrap();
        assert_eq!(response, StepResponse::succeeded());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_recording_step_captures_inputs() {
        let bed = StepTestBed::new().with_inputs(json!({"image": "app:v3"}));
        let step = RecordingStep::new("record");

        step.execute(&bed.context("a", "record")).await.unwrap();
        step.execute(&bed.context("b", "record")).await.unwrap();

        assert_eq!(step.execution_count(), 2);
        let executions = step.executions();
        assert_eq!(executions[0].setup_id, "a");
        assert_eq!(executions[0].inputs, json!({"image": "app:v3"}));
        assert!(!executions[1].node_execution_id.is_empty());

        step.clear();
        assert_eq!(step.execution_count(), 0);
    }
}
