//! Testing utilities for orchestration plans.
//!
//! This module provides:
//! - Mock steps
//! - Assertions over step responses and node executions
//! - Plan and step-context fixtures

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_node_concluded, assert_node_failed_with, assert_node_status,
    assert_response_child, assert_response_children, assert_response_failed,
    assert_response_succeeded, assert_response_suspended,
};
pub use fixtures::{StepTestBed, TestPlan};
pub use mocks::{
    FailingStep, MockStep, RecordedExecution, RecordingStep, SlowStep, SuccessStep,
};
