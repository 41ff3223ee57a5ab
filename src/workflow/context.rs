//! Per-run mutable state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::StepError;
use crate::types::{OperationResult, RunState, Variables};

/// One attempted step, after retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub step_id: String,
    pub step_index: usize,
    pub attempt_count: u32,
    pub result: OperationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub id: Uuid,
    pub workflow_id: String,
    pub variables: Variables,
    pub history: Vec<HistoryEntry>,
    pub current_step_index: usize,
    pub state: RunState,
    /// Iteration counters of the loop steps currently being repeated
    #[serde(default)]
    pub loop_iterations: HashMap<String, u32>,
    #[serde(default)]
    pub steps_executed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_fingerprint: Option<String>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            variables: Variables::new(),
            history: Vec::new(),
            current_step_index: 0,
            state: RunState::Pending,
            loop_iterations: HashMap::new(),
            steps_executed: 0,
            started_at: None,
            finished_at: None,
            definition_fingerprint: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: JsonValue) {
        self.variables.insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<&JsonValue> {
        self.variables.get(key)
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Ids of the attempted steps, in execution order
    pub fn executed_step_ids(&self) -> Vec<&str> {
        self.history.iter().map(|h| h.step_id.as_str()).collect()
    }

    /// Store a step result's data under the step id, optionally spreading
    /// object keys into the top-level variables
    pub(crate) fn record_output(&mut self, step_id: &str, data: &JsonValue, spread: bool) {
        if spread {
            if let JsonValue::Object(map) = data {
                for (k, v) in map {
                    self.variables.insert(k.clone(), v.clone());
                }
            }
        }
        self.variables.insert(step_id.to_string(), data.clone());
    }

    pub(crate) fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Observable view for hosts: `{id, workflowId, state, currentStepIndex, variables, history}`
    pub fn snapshot(&self) -> JsonValue {
        serde_json::json!({
            "id": self.id,
            "workflowId": self.workflow_id,
            "state": self.state,
            "currentStepIndex": self.current_step_index,
            "variables": self.variables,
            "history": self.history,
        })
    }
}
