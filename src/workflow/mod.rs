//! Workflow data model: the immutable definition, per-run context,
//! registration-time validation and parameter templates.

pub mod context;
pub mod definition;
pub mod template;
pub mod validator;

pub use context::{HistoryEntry, WorkflowContext};
pub use definition::{
    Condition, ConditionKind, ErrorHandling, ErrorStrategy, LoopConfig, OnError, OperatorRef,
    ParameterDecl, RetryPolicy, WorkflowDefinition, WorkflowStep,
};
pub use template::ParamExpr;
pub use validator::{ensure_valid, validate_definition, Severity, ValidationIssue};
