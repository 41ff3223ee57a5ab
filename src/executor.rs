//! Step executor
//!
//! Runs one workflow step to completion: resolves its parameters, validates
//! them, then calls the operator under the step timeout and retry policy.
//! Every attempt runs on its own tokio task so a panicking operator becomes a
//! structured `ExecutionError` instead of tearing down the run.

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::errors::StepError;
use crate::events::{names, EventBus};
use crate::operator::Operator;
use crate::types::OperationResult;
use crate::workflow::template::resolve_parameters;
use crate::workflow::{ErrorHandling, HistoryEntry, WorkflowContext, WorkflowStep};

/// What a step produced after all attempts
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: OperationResult,
    /// Final error once retries are exhausted, `None` on success
    pub error: Option<StepError>,
    /// Number of `execute` calls made (0 when validation rejected the params)
    pub attempts: u32,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct StepExecutor {
    bus: Arc<EventBus>,
    default_timeout_ms: u64,
    default_backoff_factor: f64,
}

impl StepExecutor {
    pub fn new(bus: Arc<EventBus>, settings: &EngineConfig) -> Self {
        Self {
            bus,
            default_timeout_ms: settings.default_step_timeout_ms,
            default_backoff_factor: settings.default_backoff_factor,
        }
    }

    /// Execute `step` against `operator`, appending one history entry to `ctx`
    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        index: usize,
        error_handling: &ErrorHandling,
        operator: Arc<dyn Operator>,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started_at = Utc::now();
        let params = resolve_parameters(&step.operator.parameters, &step.parameters, &ctx.variables);

        let outcome = match self.check_params(operator.as_ref(), &params) {
            Err(error) => StepOutcome {
                result: OperationResult::failure(error.to_string()),
                error: Some(error),
                attempts: 0,
            },
            Ok(()) => {
                self.run_with_retry(step, error_handling, operator, params, ctx, cancel)
                    .await
            }
        };

        if outcome.succeeded() {
            let data = outcome.result.data.clone().unwrap_or(JsonValue::Null);
            ctx.record_output(&step.id, &data, step.spread_output);
        }

        ctx.history.push(HistoryEntry {
            step_id: step.id.clone(),
            step_index: index,
            attempt_count: outcome.attempts,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            started_at,
            ended_at: Utc::now(),
        });

        outcome
    }

    fn check_params(&self, operator: &dyn Operator, params: &JsonValue) -> Result<(), StepError> {
        let validation = operator.validate(params);
        if validation.valid {
            Ok(())
        } else {
            Err(StepError::Validation(validation.errors.join("; ")))
        }
    }

    async fn run_with_retry(
        &self,
        step: &WorkflowStep,
        error_handling: &ErrorHandling,
        operator: Arc<dyn Operator>,
        params: JsonValue,
        ctx: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut policy = step.effective_retry(error_handling);
        if step.retry_policy.is_none() {
            policy.backoff_factor = self.default_backoff_factor;
        }
        let timeout_ms = step.timeout.unwrap_or(self.default_timeout_ms);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let (result, error) =
                match run_attempt(operator.clone(), params.clone(), timeout_ms, cancel).await {
                    Ok(result) if result.success => {
                        return StepOutcome {
                            result,
                            error: None,
                            attempts,
                        }
                    }
                    Ok(result) => {
                        let error = StepError::Execution(result.error_message());
                        (result, error)
                    }
                    Err(error) => (OperationResult::failure(error.to_string()), error),
                };

            let retry = attempts - 1;
            if retry >= policy.max_retries || !error.is_retryable() || cancel.is_cancelled() {
                tracing::debug!(step_id = %step.id, attempts, error = %error, "step failed");
                return StepOutcome {
                    result,
                    error: Some(error),
                    attempts,
                };
            }

            let delay_ms = policy.delay_for(retry);
            tracing::info!(
                workflow_id = %ctx.workflow_id,
                step_id = %step.id,
                attempt = attempts,
                delay_ms,
                error = %error,
                "retrying step"
            );
            self.bus.publish_from(
                names::STEP_RETRY,
                json!({
                    "workflowId": ctx.workflow_id,
                    "contextId": ctx.id,
                    "step": step.id,
                    "attempt": attempts,
                    "delayMs": delay_ms,
                    "error": error.to_string(),
                }),
                "engine",
            );

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.cancelled() => {
                    return StepOutcome {
                        result,
                        error: Some(error),
                        attempts,
                    };
                }
            }
        }
    }
}

/// One `execute` call on its own task, bounded by `timeout_ms` (0 = unbounded)
///
/// The operator's execution gate is taken first, so runs sharing an instance
/// take turns. The task keeps the gate until `execute` really returns; on
/// timeout the attempt's token fires and the executor stops waiting, but the
/// next caller still waits for the task to wind down.
async fn run_attempt(
    operator: Arc<dyn Operator>,
    params: JsonValue,
    timeout_ms: u64,
    cancel: &CancellationToken,
) -> Result<OperationResult, StepError> {
    let gate = operator.lifecycle().execution_gate();
    let permit = tokio::select! {
        permit = gate.lock_owned() => permit,
        _ = cancel.cancelled() => {
            return Err(StepError::Execution("cancelled while waiting for operator".to_string()));
        }
    };

    let token = cancel.child_token();
    let task_token = token.clone();
    let attempt = AttemptGuard {
        operator: operator.clone(),
        _permit: permit,
    };
    let mut handle = tokio::spawn(async move {
        let attempt = attempt;
        attempt.operator.execute(params, task_token).await
    });

    let joined = if timeout_ms == 0 {
        handle.await
    } else {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                token.cancel();
                return Err(StepError::Timeout(timeout_ms));
            }
        }
    };

    joined.map_err(|e| StepError::Execution(describe_join_error(e)))
}

/// Owned by the attempt task. A task that dies mid-call never reached
/// `finish_execution`, so leave `Running` before the gate opens.
struct AttemptGuard {
    operator: Arc<dyn Operator>,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.operator.lifecycle().finish_execution(false);
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "operator task was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("operator panicked: {}", message)
}
