//! Core data model for the apply engine: plans, bindings, failures, healing
//! policy, and the typed error surface shared by every other crate.

pub mod bindings;
pub mod error;
pub mod failure;
pub mod heal;
pub mod plan;

pub use bindings::{BindingMap, Progress, key_accepts};
pub use error::{EngineError, PlanError};
pub use failure::{Failure, FailureCategory, classify, parse_error_code};
pub use heal::{HealExhausted, HealPolicy, HealState};
pub use plan::{Plan, PlanCommand, Provider};
