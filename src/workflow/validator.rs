//! Registration-time validation of workflow definitions
//!
//! Rule-based, in the same shape as a linter: every [`DefinitionRule`] looks at
//! one aspect of the definition and reports issues. [`DefinitionValidator`]
//! runs them all and collects every issue instead of stopping at the first.
//!
//! Issues with [`Severity::Error`] reject the definition; warnings are logged
//! at registration and otherwise ignored.

use std::collections::HashSet;
use std::fmt;

use super::definition::WorkflowDefinition;
use crate::errors::DefinitionError;

/* ===================== Issues ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Step the issue is attached to, if any
    pub step_id: Option<String>,
    pub message: String,
    pub severity: Severity,
    /// Which rule produced this issue
    pub rule_id: &'static str,
}

impl ValidationIssue {
    pub fn error(step_id: Option<&str>, message: impl Into<String>, rule_id: &'static str) -> Self {
        Self {
            step_id: step_id.map(str::to_string),
            message: message.into(),
            severity: Severity::Error,
            rule_id,
        }
    }

    pub fn warning(step_id: Option<&str>, message: impl Into<String>, rule_id: &'static str) -> Self {
        Self {
            step_id: step_id.map(str::to_string),
            message: message.into(),
            severity: Severity::Warning,
            rule_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.step_id {
            Some(step) => write!(f, "{} in step '{}': {} [{}]", severity, step, self.message, self.rule_id),
            None => write!(f, "{}: {} [{}]", severity, self.message, self.rule_id),
        }
    }
}

/* ===================== Rules ===================== */

pub trait DefinitionRule: Send + Sync {
    /// Unique identifier, e.g. "unique-step-ids"
    fn id(&self) -> &'static str;

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue>;
}

struct NonEmptyStepsRule;

impl DefinitionRule for NonEmptyStepsRule {
    fn id(&self) -> &'static str {
        "non-empty-steps"
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        if definition.steps.is_empty() {
            vec![ValidationIssue::error(None, "workflow has no steps", self.id())]
        } else {
            Vec::new()
        }
    }
}

struct StepIdRule;

impl DefinitionRule for StepIdRule {
    fn id(&self) -> &'static str {
        "unique-step-ids"
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        let mut seen = HashSet::new();
        let mut issues = Vec::new();

        for (index, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    None,
                    format!("step #{} has an empty id", index),
                    self.id(),
                ));
            } else if !seen.insert(step.id.as_str()) {
                issues.push(ValidationIssue::error(
                    Some(&step.id),
                    "duplicate step id",
                    self.id(),
                ));
            }
        }
        issues
    }
}

struct OperatorTypeRule;

impl DefinitionRule for OperatorTypeRule {
    fn id(&self) -> &'static str {
        "operator-type"
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        definition
            .steps
            .iter()
            .filter(|s| s.operator.operator_type.trim().is_empty())
            .map(|s| ValidationIssue::error(Some(&s.id), "operator type is empty", self.id()))
            .collect()
    }
}

struct JumpTargetRule;

impl DefinitionRule for JumpTargetRule {
    fn id(&self) -> &'static str {
        "jump-targets"
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        let known: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let mut issues = Vec::new();

        for step in &definition.steps {
            for condition in &step.conditions {
                if !known.contains(condition.target_step.as_str()) {
                    issues.push(ValidationIssue::error(
                        Some(&step.id),
                        format!("condition targets unknown step '{}'", condition.target_step),
                        self.id(),
                    ));
                }
            }

            let on_error_target = step.on_error.as_ref().and_then(|e| e.target_step.as_deref());
            if let Some(target) = on_error_target {
                if !known.contains(target) {
                    issues.push(ValidationIssue::error(
                        Some(&step.id),
                        format!("onError targets unknown step '{}'", target),
                        self.id(),
                    ));
                }
            }
        }
        issues
    }
}

struct RetryPolicyRule;

impl DefinitionRule for RetryPolicyRule {
    fn id(&self) -> &'static str {
        "retry-policy"
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        definition
            .steps
            .iter()
            .filter_map(|s| s.retry_policy.as_ref().map(|p| (s, p)))
            .filter(|(_, p)| !p.backoff_factor.is_finite() || p.backoff_factor < 0.0)
            .map(|(s, p)| {
                ValidationIssue::error(
                    Some(&s.id),
                    format!("backoffFactor must be finite and non-negative, got {}", p.backoff_factor),
                    self.id(),
                )
            })
            .collect()
    }
}

/// Warns about loops that can never run their step
struct ZeroIterationLoopRule;

impl DefinitionRule for ZeroIterationLoopRule {
    fn id(&self) -> &'static str {
        "zero-iteration-loop"
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        definition
            .steps
            .iter()
            .filter(|s| matches!(&s.loop_config, Some(l) if l.max_iterations == 0))
            .map(|s| {
                ValidationIssue::warning(
                    Some(&s.id),
                    "loop has maxIterations 0; the step is always skipped",
                    self.id(),
                )
            })
            .collect()
    }
}

/* ===================== Validator ===================== */

pub struct DefinitionValidator {
    rules: Vec<Box<dyn DefinitionRule>>,
}

impl DefinitionValidator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(NonEmptyStepsRule),
                Box::new(StepIdRule),
                Box::new(OperatorTypeRule),
                Box::new(JumpTargetRule),
                Box::new(RetryPolicyRule),
                Box::new(ZeroIterationLoopRule),
            ],
        }
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        self.rules
            .iter()
            .flat_map(|rule| rule.validate(definition))
            .collect()
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }
}

impl Default for DefinitionValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Every issue the built-in rules find
pub fn validate_definition(definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
    DefinitionValidator::new().validate(definition)
}

/// Reject the definition if any error-severity issue is found; log warnings
pub fn ensure_valid(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let (errors, warnings): (Vec<_>, Vec<_>) = validate_definition(definition)
        .into_iter()
        .partition(ValidationIssue::is_error);

    for warning in &warnings {
        tracing::warn!(workflow_id = %definition.id, "{}", warning);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::Invalid(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{
        ConditionKind, LoopConfig, OnError, OperatorRef, RetryPolicy, WorkflowStep,
    };

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, OperatorRef::new("core", "set"))
    }

    fn rules_hit(def: &WorkflowDefinition) -> Vec<&'static str> {
        validate_definition(def).into_iter().map(|i| i.rule_id).collect()
    }

    #[test]
    fn test_valid_definition_has_no_issues() {
        let def = WorkflowDefinition::new(
            "ok",
            vec![step("a").with_condition(ConditionKind::Success, "b"), step("b")],
        );
        assert!(validate_definition(&def).is_empty());
        assert!(ensure_valid(&def).is_ok());
    }

    #[test]
    fn test_reports_every_problem() {
        let mut empty_type = step("c");
        empty_type.operator.operator_type = String::new();

        let def = WorkflowDefinition::new(
            "bad",
            vec![
                step("a").with_condition(ConditionKind::Failure, "nowhere"),
                step("a"),
                empty_type.with_on_error(OnError {
                    strategy: None,
                    target_step: Some("ghost".into()),
                }),
                step("").with_retry(RetryPolicy {
                    max_retries: 1,
                    delay: 0,
                    backoff_factor: f64::NAN,
                }),
            ],
        );

        let hits = rules_hit(&def);
        assert_eq!(
            hits,
            vec![
                "unique-step-ids",
                "unique-step-ids",
                "operator-type",
                "jump-targets",
                "jump-targets",
                "retry-policy"
            ]
        );

        match ensure_valid(&def) {
            Err(DefinitionError::Invalid(issues)) => assert_eq!(issues.len(), 6),
            other => panic!("expected invalid definition, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_steps_rejected() {
        let def = WorkflowDefinition::new("empty", vec![]);
        assert_eq!(rules_hit(&def), vec!["non-empty-steps"]);
    }

    #[test]
    fn test_zero_iteration_loop_is_only_a_warning() {
        let def = WorkflowDefinition::new("w", vec![step("a").with_loop(LoopConfig::times(0))]);
        let issues = validate_definition(&def);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(ensure_valid(&def).is_ok());
    }

    #[test]
    fn test_issue_display() {
        let issue = ValidationIssue::error(Some("a"), "duplicate step id", "unique-step-ids");
        assert_eq!(
            issue.to_string(),
            "error in step 'a': duplicate step id [unique-step-ids]"
        );
    }
}
