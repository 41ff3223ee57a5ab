//! Operator capability contract
//!
//! An operator is a pluggable unit of work. The engine only ever talks to it
//! through [`Operator`]: `validate` is a pure parameter check, `execute` runs
//! the work and always produces an [`OperationResult`].
//!
//! Concrete operators implement [`Operator::run`] and embed a [`Lifecycle`].
//! The provided [`Operator::execute`] drives the lifecycle around `run`, so an
//! implementation never has to manage `Running` itself.

pub mod builtin;
pub mod lifecycle;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{OperationResult, ValidationResult};

pub use lifecycle::{Lifecycle, LifecycleError, OperatorState};
pub use registry::{OperatorFactory, OperatorRegistry};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/* ===================== Identity ===================== */

/// Cache identity of an operator instance: `(library, type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorIdentity {
    pub library: String,
    #[serde(rename = "type")]
    pub operator_type: String,
    pub id: String,
}

impl OperatorIdentity {
    pub fn new(
        library: impl Into<String>,
        operator_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            library: library.into(),
            operator_type: operator_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for OperatorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.library, self.operator_type, self.id)
    }
}

/// Everything a factory receives to build an instance
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSpec {
    pub identity: OperatorIdentity,
    pub config: JsonValue,
}

/* ===================== Contract ===================== */

#[async_trait]
pub trait Operator: Send + Sync {
    fn identity(&self) -> &OperatorIdentity;

    /// Advertised capability names (introspection only)
    fn capabilities(&self) -> BTreeSet<String>;

    fn lifecycle(&self) -> &Lifecycle;

    /// Pure parameter check. Must not touch lifecycle state.
    fn validate(&self, _params: &JsonValue) -> ValidationResult {
        ValidationResult::ok()
    }

    /// The operator's work. Faults should be reported as a failed result.
    async fn run(&self, params: JsonValue, cancel: CancellationToken) -> OperationResult;

    fn state(&self) -> OperatorState {
        self.lifecycle().state()
    }

    /// Run one call under the lifecycle state machine
    ///
    /// Fails fast (without calling `run`) when the operator is not ready or
    /// is already running.
    async fn execute(&self, params: JsonValue, cancel: CancellationToken) -> OperationResult {
        if let Err(e) = self.lifecycle().begin_execution() {
            return OperationResult::failure(format!("{}: {}", self.identity(), e));
        }

        let started = Instant::now();
        let result = self.run(params, cancel).await;
        self.lifecycle().finish_execution(result.success);

        let elapsed = started.elapsed().as_millis() as u64;
        result.with_duration(elapsed)
    }

    async fn initialize(&self) -> Result<(), LifecycleError> {
        self.lifecycle().transition(OperatorState::Initializing)?;
        self.lifecycle().transition(OperatorState::Ready)
    }

    fn pause(&self) -> Result<(), LifecycleError> {
        self.lifecycle().transition(OperatorState::Paused)
    }

    fn resume(&self) -> Result<(), LifecycleError> {
        self.lifecycle().transition(OperatorState::Running)
    }

    fn reset(&self) -> Result<(), LifecycleError> {
        self.lifecycle().transition(OperatorState::Ready)
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle().transition(OperatorState::Stopped)
    }
}

/* ===================== Closure Operator ===================== */

type RunFn = dyn Fn(JsonValue, CancellationToken) -> BoxFuture<OperationResult> + Send + Sync;
type ValidateFn = dyn Fn(&JsonValue) -> ValidationResult + Send + Sync;

/// Operator backed by an async closure
///
/// Handy for hosts that don't need a dedicated type, and for tests.
pub struct FnOperator {
    identity: OperatorIdentity,
    capabilities: BTreeSet<String>,
    lifecycle: Lifecycle,
    validator: Option<Arc<ValidateFn>>,
    func: Arc<RunFn>,
}

impl FnOperator {
    pub fn new<F, Fut>(identity: OperatorIdentity, func: F) -> Self
    where
        F: Fn(JsonValue, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        Self {
            identity,
            capabilities: BTreeSet::new(),
            lifecycle: Lifecycle::new(),
            validator: None,
            func: Arc::new(move |params, cancel| Box::pin(func(params, cancel))),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&JsonValue) -> ValidationResult + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }
}

#[async_trait]
impl Operator for FnOperator {
    fn identity(&self) -> &OperatorIdentity {
        &self.identity
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn validate(&self, params: &JsonValue) -> ValidationResult {
        match &self.validator {
            Some(v) => v(params),
            None => ValidationResult::ok(),
        }
    }

    async fn run(&self, params: JsonValue, cancel: CancellationToken) -> OperationResult {
        (self.func)(params, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> FnOperator {
        FnOperator::new(OperatorIdentity::new("test", "echo", "a"), |params, _| async move {
            OperationResult::ok(params)
        })
        .with_capabilities(["echo"])
    }

    #[tokio::test]
    async fn test_execute_before_initialize_fails_without_running() {
        let op = echo();
        let result = op.execute(json!({}), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error_message().contains("not ready"));
        assert_eq!(op.state(), OperatorState::Idle);
    }

    #[tokio::test]
    async fn test_execute_drives_lifecycle() {
        let op = echo();
        op.initialize().await.unwrap();

        let result = op.execute(json!({"v": 1}), CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"v": 1})));
        assert_eq!(op.state(), OperatorState::Completed);

        // terminal state is reset implicitly
        let again = op.execute(json!({"v": 2}), CancellationToken::new()).await;
        assert!(again.success);
    }

    #[test]
    fn test_failed_validation_leaves_state_untouched() {
        let op = echo().with_validator(|p| ValidationResult::require_keys(p, &["url"]));
        let v = op.validate(&json!({}));
        assert!(!v.valid);
        assert_eq!(op.state(), OperatorState::Idle);
    }

    #[test]
    fn test_identity_display() {
        let id = OperatorIdentity::new("web", "Fetch", "main");
        assert_eq!(id.to_string(), "web/Fetch#main");
    }
}
