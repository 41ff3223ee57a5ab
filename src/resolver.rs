//! Control-flow resolver
//!
//! Pure function from `(definition, current index, last result)` to the next
//! step. Order of evaluation:
//!
//! 1. `conditions`, in declared order; the first match jumps to its target
//! 2. `loop`: repeat the same step while iterations remain and `until` does
//!    not match
//! 3. fall through to the next step; past the end terminates the run

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ControlFlowError;
use crate::types::{OperationResult, Variables};
use crate::workflow::template::lookup_dotted;
use crate::workflow::{ConditionKind, WorkflowDefinition};

/// Host predicate for `custom` conditions
pub type Predicate = Arc<dyn Fn(&OperationResult, &Variables) -> bool + Send + Sync>;

pub type Predicates = HashMap<String, Predicate>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Step(usize),
    Terminate,
}

/// Decide where control goes after step `current` produced `result`
///
/// `iteration` is the number of times the step has run in its current loop,
/// counting the run that produced `result`.
pub fn resolve(
    definition: &WorkflowDefinition,
    current: usize,
    result: &OperationResult,
    iteration: u32,
    variables: &Variables,
    predicates: &Predicates,
) -> Result<Next, ControlFlowError> {
    let Some(step) = definition.step(current) else {
        return Ok(Next::Terminate);
    };

    for condition in &step.conditions {
        if condition_matches(&condition.kind, result, variables, predicates) {
            let target = jump_target(definition, &step.id, &condition.target_step)?;
            return Ok(Next::Step(target));
        }
    }

    if let Some(loop_config) = &step.loop_config {
        let done = loop_config
            .until
            .as_ref()
            .is_some_and(|until| condition_matches(until, result, variables, predicates));
        if iteration < loop_config.max_iterations && !done {
            return Ok(Next::Step(current));
        }
    }

    Ok(fallthrough(definition, current))
}

pub fn fallthrough(definition: &WorkflowDefinition, current: usize) -> Next {
    let next = current + 1;
    if next >= definition.steps.len() {
        Next::Terminate
    } else {
        Next::Step(next)
    }
}

/// Index of `target`, or the fatal unknown-target error. Never clamped.
pub fn jump_target(
    definition: &WorkflowDefinition,
    from: &str,
    target: &str,
) -> Result<usize, ControlFlowError> {
    definition
        .step_index(target)
        .ok_or_else(|| ControlFlowError::UnknownTarget {
            from: from.to_string(),
            target: target.to_string(),
        })
}

/* ===================== Conditions ===================== */

pub fn condition_matches(
    kind: &ConditionKind,
    result: &OperationResult,
    variables: &Variables,
    predicates: &Predicates,
) -> bool {
    match kind {
        ConditionKind::Success => result.success,
        ConditionKind::Failure => !result.success,
        ConditionKind::ResultEquals { value, path } => {
            result_at(result, path.as_deref()).is_some_and(|actual| actual == value)
        }
        ConditionKind::ResultContains { value, path } => {
            result_at(result, path.as_deref()).is_some_and(|actual| contains(actual, value))
        }
        ConditionKind::Custom { name } => match predicates.get(name) {
            Some(predicate) => predicate(result, variables),
            None => {
                tracing::warn!(predicate = %name, "unknown custom predicate; condition is false");
                false
            }
        },
    }
}

fn result_at<'a>(result: &'a OperationResult, path: Option<&str>) -> Option<&'a JsonValue> {
    static NULL: JsonValue = JsonValue::Null;
    let data = result.data.as_ref().unwrap_or(&NULL);
    match path {
        Some(path) => lookup_dotted(data, path),
        None => Some(data),
    }
}

/// Substring for strings, element for arrays, key or sub-object for objects
pub fn contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match (haystack, needle) {
        (JsonValue::String(s), JsonValue::String(n)) => s.contains(n.as_str()),
        (JsonValue::String(s), other) => s.contains(&other.to_string()),
        (JsonValue::Array(items), n) => items.contains(n),
        (JsonValue::Object(map), JsonValue::String(key)) => map.contains_key(key),
        (JsonValue::Object(map), JsonValue::Object(sub)) => {
            sub.iter().all(|(k, v)| map.get(k) == Some(v))
        }
        _ => false,
    }
}
