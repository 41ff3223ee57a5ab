//! Workflow engine
//!
//! Drives one run from start to finish: applies inputs, makes sure every
//! referenced operator instance exists, then alternates executor and resolver
//! until the run terminates, hits a fatal error, or reaches the step cap.
//!
//! Steps of a run are strictly sequential. Independent runs may be driven
//! concurrently; they share only the operator registry.

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::errors::{ControlFlowError, DefinitionError, StepError, WorkflowError};
use crate::events::{names, EventBus};
use crate::executor::{StepExecutor, StepOutcome};
use crate::operator::{Operator, OperatorIdentity, OperatorRegistry, OperatorState};
use crate::resolver::{self, Next, Predicate, Predicates};
use crate::types::{OperationResult, RunState, Variables};
use crate::workflow::{ensure_valid, ErrorStrategy, WorkflowContext, WorkflowDefinition, WorkflowStep};

const EVENT_SOURCE: &str = "engine";

/// Result of a run. The engine never fails past this boundary.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    /// Id of the step the run failed at, if it failed at one
    pub failed_at: Option<String>,
    pub error: Option<WorkflowError>,
    pub context: WorkflowContext,
}

type Operators = HashMap<OperatorIdentity, Arc<dyn Operator>>;

pub struct WorkflowEngine {
    registry: Arc<OperatorRegistry>,
    bus: Arc<EventBus>,
    config: EngineConfig,
    executor: StepExecutor,
    predicates: RwLock<Predicates>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<OperatorRegistry>, bus: Arc<EventBus>, config: EngineConfig) -> Self {
        Self {
            executor: StepExecutor::new(bus.clone(), &config),
            registry,
            bus,
            config,
            predicates: RwLock::new(Predicates::new()),
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /* ===================== Registration ===================== */

    /// Validate and store a definition by id, replacing any previous version
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        ensure_valid(&definition)?;
        tracing::info!(
            workflow_id = %definition.id,
            version = %definition.version,
            steps = definition.steps.len(),
            "workflow registered"
        );
        self.definitions
            .write()
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().get(workflow_id).cloned()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register a host predicate for `custom` conditions
    pub fn register_predicate<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&OperationResult, &Variables) -> bool + Send + Sync + 'static,
    {
        let predicate: Predicate = Arc::new(predicate);
        self.predicates.write().insert(name.into(), predicate);
    }

    /* ===================== Runs ===================== */

    /// Run a registered workflow with the given input variables
    pub async fn run(&self, workflow_id: &str, variables: Variables) -> RunOutcome {
        let context = WorkflowContext::new(workflow_id).with_variables(variables);
        match self.workflow(workflow_id) {
            Some(definition) => self.execute_workflow(&definition, context).await,
            None => {
                let error = WorkflowError::UnknownWorkflow {
                    workflow_id: workflow_id.to_string(),
                };
                self.fail(context, None, error)
            }
        }
    }

    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> RunOutcome {
        self.execute_with_cancel(definition, context, CancellationToken::new())
            .await
    }

    /// Run with cooperative cancellation, observed between steps
    pub async fn execute_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        mut ctx: WorkflowContext,
        cancel: CancellationToken,
    ) -> RunOutcome {
        ctx.workflow_id = definition.id.clone();
        ctx.state = RunState::Running;
        ctx.started_at = Some(Utc::now());
        ctx.definition_fingerprint = Some(definition.fingerprint());

        tracing::info!(workflow_id = %definition.id, context_id = %ctx.id, "workflow started");
        self.emit(
            names::WORKFLOW_STARTED,
            json!({
                "workflowId": definition.id,
                "contextId": ctx.id,
                "steps": definition.steps.len(),
            }),
        );

        if let Err(e) = ensure_valid(definition) {
            let error = WorkflowError::Definition {
                message: e.to_string(),
            };
            return self.fail(ctx, None, error);
        }

        if let Err(error) = apply_inputs(definition, &mut ctx) {
            return self.fail(ctx, None, error);
        }

        let operators = match self.ensure_operators(definition).await {
            Ok(operators) => operators,
            Err(error) => return self.fail(ctx, None, error),
        };

        // Snapshot so predicates registered mid-run don't affect it
        let predicates = self.predicates.read().clone();

        match self
            .drive(definition, &mut ctx, &operators, &predicates, &cancel)
            .await
        {
            Ok(()) => self.complete(ctx),
            Err((failed_at, WorkflowError::Cancelled)) => self.cancelled(ctx, failed_at),
            Err((failed_at, error)) => self.fail(ctx, failed_at, error),
        }
    }

    /// Make sure an initialized instance exists for every operator reference
    async fn ensure_operators(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Operators, WorkflowError> {
        let mut operators = Operators::new();

        for op_ref in definition.operator_refs() {
            let operator = self
                .registry
                .create_operator(
                    &op_ref.library,
                    &op_ref.operator_type,
                    &op_ref.id,
                    JsonValue::Object(op_ref.parameters.clone()),
                )
                .await?;

            if matches!(
                operator.state(),
                OperatorState::Idle | OperatorState::Stopped | OperatorState::Initializing
            ) {
                // the gate orders us after a concurrent run's initialize
                let gate = operator.lifecycle().execution_gate();
                let _turn = gate.lock().await;
                if matches!(operator.state(), OperatorState::Idle | OperatorState::Stopped) {
                    operator
                        .initialize()
                        .await
                        .map_err(|e| WorkflowError::Initialization {
                            message: format!("{}: {}", operator.identity(), e),
                        })?;
                }
            }

            operators.insert(op_ref.identity(), operator);
        }

        Ok(operators)
    }

    /// The step loop. Errors carry the id of the step they stopped at.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut WorkflowContext,
        operators: &Operators,
        predicates: &Predicates,
        cancel: &CancellationToken,
    ) -> Result<(), (Option<String>, WorkflowError)> {
        let cap = definition.steps.len() * self.config.step_cap_factor.max(1);
        let mut index = 0;

        while let Some(step) = definition.step(index) {
            ctx.current_step_index = index;

            if cancel.is_cancelled() {
                return Err((Some(step.id.clone()), WorkflowError::Cancelled));
            }

            if !self.enter_loop(step, index, ctx) {
                match resolver::fallthrough(definition, index) {
                    Next::Step(next) => {
                        index = next;
                        continue;
                    }
                    Next::Terminate => break,
                }
            }

            if ctx.steps_executed >= cap {
                let error = ControlFlowError::StepCapExceeded { cap };
                return Err((Some(step.id.clone()), error.into()));
            }
            ctx.steps_executed += 1;

            let operator = operators
                .get(&step.operator.identity())
                .cloned()
                .ok_or_else(|| {
                    let error = WorkflowError::UnknownOperatorType {
                        operator_type: step.operator.operator_type.clone(),
                    };
                    (Some(step.id.clone()), error)
                })?;

            tracing::debug!(workflow_id = %definition.id, step_id = %step.id, index, "step started");
            self.emit(
                names::STEP_STARTED,
                json!({
                    "workflowId": definition.id,
                    "contextId": ctx.id,
                    "step": step.id,
                    "stepIndex": index,
                }),
            );

            let outcome = self
                .executor
                .execute_step(step, index, &definition.error_handling, operator, ctx, cancel)
                .await;

            // a failure caused by cancellation ends the run as cancelled
            if outcome.error.is_some() && cancel.is_cancelled() {
                return Err((Some(step.id.clone()), WorkflowError::Cancelled));
            }

            let iteration = match step.loop_config {
                Some(_) => {
                    let counter = ctx.loop_iterations.entry(step.id.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                }
                None => 1,
            };

            let next = match &outcome.error {
                None => {
                    self.step_completed(definition, step, index, &outcome, ctx);
                    resolver::resolve(
                        definition,
                        index,
                        &outcome.result,
                        iteration,
                        &ctx.variables,
                        predicates,
                    )
                    .map_err(WorkflowError::from)
                }
                Some(error) => {
                    self.step_failed(definition, step, index, &outcome, error, ctx);
                    self.route_failure(definition, step, index, &outcome, error, iteration, ctx, predicates)
                }
            }
            .map_err(|e| (Some(step.id.clone()), e))?;

            if next != Next::Step(index) {
                ctx.loop_iterations.remove(&step.id);
            }

            match next {
                Next::Step(next) => index = next,
                Next::Terminate => break,
            }
        }

        Ok(())
    }

    /// Loop entry check. Returns false when the step must be skipped.
    fn enter_loop(&self, step: &WorkflowStep, index: usize, ctx: &mut WorkflowContext) -> bool {
        let Some(loop_config) = &step.loop_config else {
            return true;
        };

        let done = ctx.loop_iterations.get(&step.id).copied().unwrap_or(0);
        if done >= loop_config.max_iterations {
            ctx.loop_iterations.remove(&step.id);
            tracing::debug!(step_id = %step.id, "loop exhausted on entry; step skipped");
            self.emit(
                names::STEP_SKIPPED,
                json!({
                    "workflowId": ctx.workflow_id,
                    "contextId": ctx.id,
                    "step": step.id,
                    "stepIndex": index,
                }),
            );
            return false;
        }

        if let Some(variable) = &loop_config.iteration_variable {
            ctx.set_variable(variable.clone(), json!(done));
        }
        true
    }

    /// Where control goes after a step failed for good
    ///
    /// `onError.targetStep` wins; otherwise `abort` ends the run and
    /// `continue` hands the failed result to the resolver.
    #[allow(clippy::too_many_arguments)]
    fn route_failure(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        index: usize,
        outcome: &StepOutcome,
        error: &StepError,
        iteration: u32,
        ctx: &WorkflowContext,
        predicates: &Predicates,
    ) -> Result<Next, WorkflowError> {
        let step_error = || WorkflowError::Step {
            step_id: step.id.clone(),
            error: error.clone(),
        };

        if matches!(error, StepError::ControlFlow(_)) {
            return Err(step_error());
        }

        let target = step.on_error.as_ref().and_then(|e| e.target_step.as_deref());
        if let Some(target) = target {
            tracing::info!(step_id = %step.id, target, "step failed; jumping to error handler");
            return resolver::jump_target(definition, &step.id, target)
                .map(Next::Step)
                .map_err(WorkflowError::from);
        }

        match step.effective_strategy(&definition.error_handling) {
            ErrorStrategy::Abort => Err(step_error()),
            ErrorStrategy::Continue => {
                tracing::warn!(step_id = %step.id, error = %error, "step failed; continuing");
                resolver::resolve(
                    definition,
                    index,
                    &outcome.result,
                    iteration,
                    &ctx.variables,
                    predicates,
                )
                .map_err(WorkflowError::from)
            }
        }
    }

    /* ===================== Events ===================== */

    fn emit(&self, name: &str, payload: JsonValue) {
        self.bus.publish_from(name, payload, EVENT_SOURCE);
    }

    fn step_completed(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        index: usize,
        outcome: &StepOutcome,
        ctx: &WorkflowContext,
    ) {
        self.emit(
            names::STEP_COMPLETED,
            json!({
                "workflowId": definition.id,
                "contextId": ctx.id,
                "step": step.id,
                "stepIndex": index,
                "result": outcome.result,
                "attemptCount": outcome.attempts,
            }),
        );
    }

    fn step_failed(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        index: usize,
        outcome: &StepOutcome,
        error: &StepError,
        ctx: &WorkflowContext,
    ) {
        tracing::warn!(
            workflow_id = %definition.id,
            step_id = %step.id,
            attempts = outcome.attempts,
            error = %error,
            "step failed"
        );
        self.emit(
            names::STEP_ERROR,
            json!({
                "workflowId": definition.id,
                "contextId": ctx.id,
                "step": step.id,
                "stepIndex": index,
                "error": error.to_string(),
                "errorKind": error.kind(),
                "attemptCount": outcome.attempts,
            }),
        );
    }

    fn complete(&self, mut ctx: WorkflowContext) -> RunOutcome {
        ctx.finish(RunState::Completed);
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            context_id = %ctx.id,
            steps_executed = ctx.steps_executed,
            "workflow completed"
        );
        self.emit(
            names::WORKFLOW_COMPLETED,
            json!({
                "workflowId": ctx.workflow_id,
                "contextId": ctx.id,
                "stepsExecuted": ctx.steps_executed,
            }),
        );
        RunOutcome {
            success: true,
            failed_at: None,
            error: None,
            context: ctx,
        }
    }

    fn cancelled(&self, mut ctx: WorkflowContext, failed_at: Option<String>) -> RunOutcome {
        ctx.finish(RunState::Cancelled);
        tracing::info!(workflow_id = %ctx.workflow_id, context_id = %ctx.id, "workflow cancelled");
        self.emit(
            names::WORKFLOW_CANCELLED,
            json!({
                "workflowId": ctx.workflow_id,
                "contextId": ctx.id,
                "stepIndex": ctx.current_step_index,
            }),
        );
        RunOutcome {
            success: false,
            failed_at,
            error: Some(WorkflowError::Cancelled),
            context: ctx,
        }
    }

    fn fail(
        &self,
        mut ctx: WorkflowContext,
        failed_at: Option<String>,
        error: WorkflowError,
    ) -> RunOutcome {
        ctx.finish(RunState::Error);
        tracing::error!(
            workflow_id = %ctx.workflow_id,
            context_id = %ctx.id,
            failed_at = ?failed_at,
            error = %error,
            "workflow failed"
        );
        self.emit(
            names::WORKFLOW_ERROR,
            json!({
                "workflowId": ctx.workflow_id,
                "contextId": ctx.id,
                "failedAt": failed_at,
                "error": error.to_string(),
                "errorKind": error.kind(),
            }),
        );
        RunOutcome {
            success: false,
            failed_at,
            error: Some(error),
            context: ctx,
        }
    }
}

/// Seed variables from `initialState` and `globalParameters`
///
/// Caller-supplied variables always win.
fn apply_inputs(definition: &WorkflowDefinition, ctx: &mut WorkflowContext) -> Result<(), WorkflowError> {
    for (key, value) in &definition.initial_state {
        if !ctx.variables.contains_key(key) {
            ctx.variables.insert(key.clone(), value.clone());
        }
    }

    for (name, decl) in &definition.global_parameters {
        if ctx.variables.contains_key(name) {
            continue;
        }
        match (&decl.default, decl.required) {
            (Some(default), _) => {
                ctx.variables.insert(name.clone(), default.clone());
            }
            (None, true) => {
                return Err(WorkflowError::MissingParameter { name: name.clone() });
            }
            (None, false) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
