//! Observability utilities.

mod tracing;

pub use tracing::{
    init_tracing, try_init_tracing, NodeSpanAttributes, PlanSpanAttributes, SpanTimer,
};
