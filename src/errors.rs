//! Error taxonomy for the engine
//!
//! Step-level errors (`StepError`) are what the executor surfaces after retries.
//! `WorkflowError` is what a caller finds inside a failed `RunOutcome`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::ValidationIssue;

/// Invalid jump targets and runaway loops. Always fatal for the run.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFlowError {
    #[error("step '{from}' jumps to unknown step '{target}'")]
    UnknownTarget { from: String, target: String },

    #[error("step cap of {cap} executed steps exceeded")]
    StepCapExceeded { cap: usize },
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepError {
    /// Parameters rejected by `Operator::validate`
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operator ran and reported failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// No result within the step timeout
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    ControlFlow(#[from] ControlFlowError),
}

impl StepError {
    /// Whether the retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Execution(_) | StepError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Validation(_) => "ValidationError",
            StepError::Execution(_) => "ExecutionError",
            StepError::Timeout(_) => "TimeoutError",
            StepError::ControlFlow(_) => "ControlFlowError",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown operator type '{0}'")]
    UnknownOperatorType(String),

    #[error("failed to construct operator {key}: {message}")]
    Construction { key: String, message: String },
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid workflow definition: {}", format_issues(.0))]
    Invalid(Vec<ValidationIssue>),

    #[error("failed to parse workflow definition: {0}")]
    Parse(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reason a run did not complete successfully
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowError {
    #[error("unknown operator type '{operator_type}'")]
    UnknownOperatorType { operator_type: String },

    #[error("step '{step_id}' failed: {error}")]
    Step { step_id: String, error: StepError },

    #[error(transparent)]
    ControlFlow(ControlFlowError),

    #[error("initialization failed: {message}")]
    Initialization { message: String },

    /// A required global parameter had no value and no default
    #[error("missing required parameter '{name}'")]
    MissingParameter { name: String },

    #[error("invalid definition: {message}")]
    Definition { message: String },

    #[error("unknown workflow '{workflow_id}'")]
    UnknownWorkflow { workflow_id: String },

    #[error("run cancelled")]
    Cancelled,
}

impl WorkflowError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::UnknownOperatorType { .. } => "UnknownOperatorTypeError",
            WorkflowError::Step { error, .. } => error.kind(),
            WorkflowError::ControlFlow(_) => "ControlFlowError",
            WorkflowError::Initialization { .. } => "InitializationError",
            WorkflowError::MissingParameter { .. } => "ValidationError",
            WorkflowError::Definition { .. } => "DefinitionError",
            WorkflowError::UnknownWorkflow { .. } => "UnknownWorkflowError",
            WorkflowError::Cancelled => "Cancelled",
        }
    }

    /// Fatal errors abort the run regardless of the error-handling strategy
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkflowError::UnknownOperatorType { .. } | WorkflowError::ControlFlow(_) => true,
            WorkflowError::Step { error, .. } => matches!(error, StepError::ControlFlow(_)),
            _ => false,
        }
    }
}

impl From<RegistryError> for WorkflowError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownOperatorType(operator_type) => {
                WorkflowError::UnknownOperatorType { operator_type }
            }
            other => WorkflowError::Initialization {
                message: other.to_string(),
            },
        }
    }
}

impl From<ControlFlowError> for WorkflowError {
    fn from(err: ControlFlowError) -> Self {
        WorkflowError::ControlFlow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(StepError::Execution("boom".into()).is_retryable());
        assert!(StepError::Timeout(10).is_retryable());
        assert!(!StepError::Validation("bad".into()).is_retryable());
        assert!(!StepError::ControlFlow(ControlFlowError::StepCapExceeded { cap: 3 }).is_retryable());
    }

    #[test]
    fn test_registry_error_maps_to_fatal_workflow_error() {
        let err: WorkflowError = RegistryError::UnknownOperatorType("Bogus".into()).into();
        assert_eq!(err.kind(), "UnknownOperatorTypeError");
        assert!(err.is_fatal());
    }
}
