//! Core domain types shared by every layer of the engine.

pub mod failure;
pub mod interrupt;
pub mod outcome;
pub mod status;

pub use failure::{FailureInfo, FailureType};
pub use interrupt::{InterruptEffect, InterruptType, InterventionAction};
pub use outcome::{RefInstance, RefObject, RefType};
pub use status::{NodeStatus, PlanStatus};
