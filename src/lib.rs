//! opflow core: operator-based workflow execution
//!
//! Workflows are ordered steps, each invoking an operator resolved through
//! the [`OperatorRegistry`]. The [`WorkflowEngine`] drives a run: parameter
//! templating, retries with backoff, per-step timeouts, conditional jumps
//! and bounded loops. Progress is published on the [`EventBus`], where the
//! [`RuleEngine`] reacts to it with operator commands and derived events.

pub mod application;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod logging;
pub mod operator;
pub mod resolver;
pub mod rules;
pub mod types;
pub mod workflow;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use config::Config;
pub use engine::{RunOutcome, WorkflowEngine};
pub use errors::{StepError, WorkflowError};
pub use events::{Event, EventBus};
pub use operator::{Operator, OperatorIdentity, OperatorRegistry, OperatorState};
pub use rules::{Rule, RuleEngine};
pub use types::*;
pub use workflow::{WorkflowContext, WorkflowDefinition, WorkflowStep};
