//! Workflow definition model
//!
//! The JSON shape is camelCase:
//!
//! ```json
//! {
//!   "id": "crawl", "name": "Crawl", "version": "1.0.0",
//!   "initialState": {"page": 1},
//!   "steps": [{
//!     "id": "fetch",
//!     "operator": {"type": "Fetch", "library": "web", "parameters": {}},
//!     "parameters": {"url": "${baseUrl}/${page}"},
//!     "conditions": [{"type": "failure", "targetStep": "report"}],
//!     "loop": {"maxIterations": 5},
//!     "retryPolicy": {"maxRetries": 2, "delay": 100, "backoffFactor": 2.0}
//!   }],
//!   "errorHandling": {"strategy": "abort"}
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::errors::DefinitionError;
use crate::operator::OperatorIdentity;
use crate::types::Variables;

/* ===================== Definition ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub initial_state: Variables,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global_parameters: BTreeMap<String, ParameterDecl>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub metadata: Variables,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            version: default_version(),
            initial_state: Variables::new(),
            steps,
            global_parameters: BTreeMap::new(),
            error_handling: ErrorHandling::default(),
            metadata: Variables::new(),
        }
    }

    pub fn from_json_str(source: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(source).map_err(|e| DefinitionError::Parse(e.to_string()))
    }

    pub fn from_toml_str(source: &str) -> Result<Self, DefinitionError> {
        toml::from_str(source).map_err(|e| DefinitionError::Parse(e.to_string()))
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 over the canonical JSON encoding (object keys sorted)
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn step(&self, index: usize) -> Option<&WorkflowStep> {
        self.steps.get(index)
    }

    /// Distinct operator instances referenced by the steps, in first-use order
    pub fn operator_refs(&self) -> Vec<&OperatorRef> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| &s.operator)
            .filter(|op| seen.insert(op.identity()))
            .collect()
    }
}

/* ===================== Steps ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub operator: OperatorRef,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub parameters: Variables,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    /// Per-attempt timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_true")]
    pub spread_output: bool,
}

fn default_true() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, operator: OperatorRef) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            operator,
            parameters: Variables::new(),
            conditions: Vec::new(),
            loop_config: None,
            on_error: None,
            timeout: None,
            retry_policy: None,
            spread_output: true,
        }
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        if let JsonValue::Object(map) = parameters {
            self.parameters = map;
        }
        self
    }

    pub fn with_condition(mut self, kind: ConditionKind, target_step: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            kind,
            target_step: target_step.into(),
        });
        self
    }

    pub fn with_loop(mut self, loop_config: LoopConfig) -> Self {
        self.loop_config = Some(loop_config);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// The step's own policy, or the workflow-level retry settings with no backoff
    pub fn effective_retry(&self, workflow: &ErrorHandling) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or(RetryPolicy {
            max_retries: workflow.max_retries,
            delay: workflow.retry_delay,
            backoff_factor: 1.0,
        })
    }

    /// `onError.strategy` when set, else the workflow strategy
    pub fn effective_strategy(&self, workflow: &ErrorHandling) -> ErrorStrategy {
        self.on_error
            .as_ref()
            .and_then(|e| e.strategy)
            .unwrap_or(workflow.strategy)
    }
}

/// Which operator instance a step runs on, plus its default parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRef {
    #[serde(rename = "type")]
    pub operator_type: String,
    #[serde(default = "default_library")]
    pub library: String,
    #[serde(default = "default_instance")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub parameters: Variables,
}

fn default_library() -> String {
    "default".to_string()
}

fn default_instance() -> String {
    "default".to_string()
}

impl OperatorRef {
    pub fn new(library: impl Into<String>, operator_type: impl Into<String>) -> Self {
        Self {
            operator_type: operator_type.into(),
            library: library.into(),
            id: default_instance(),
            parameters: Variables::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        if let JsonValue::Object(map) = parameters {
            self.parameters = map;
        }
        self
    }

    pub fn identity(&self) -> OperatorIdentity {
        OperatorIdentity::new(&self.library, &self.operator_type, &self.id)
    }
}

/* ===================== Control Flow ===================== */

/// A routing rule: when `kind` matches the step result, jump to `target_step`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(flatten)]
    pub kind: ConditionKind,
    pub target_step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionKind {
    Success,
    Failure,
    /// `result.data` (or the value at `path` inside it) equals `value`
    ResultEquals {
        value: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Substring, array element, or object key/sub-object match
    ResultContains {
        value: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Delegated to a host predicate registered under `name`
    Custom { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<ConditionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_variable: Option<String>,
}

impl LoopConfig {
    pub fn times(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            until: None,
            iteration_variable: None,
        }
    }
}

/* ===================== Error Handling ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base delay in milliseconds
    #[serde(default)]
    pub delay: u64,
    #[serde(default = "default_backoff")]
    pub backoff_factor: f64,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let factor = self.backoff_factor.powi(attempt as i32);
        (self.delay as f64 * factor).round() as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ErrorStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay: u64,
}

/// Declaration of a run-level input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
